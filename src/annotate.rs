//! Frame annotation for recorded segments.
//!
//! Boxes are drawn only for classes that are both present in the latest
//! sampled detections and currently confirmed, so nothing is outlined while a
//! class is still inside its debounce window.

use crate::detect::DetectionSet;
use crate::frame::Frame;
use crate::{ClassSet, BOTTLE, FOOD, PHONE, SLEEPING};

const BOX_THICKNESS: u32 = 2;
const INDICATOR_CENTER: (i64, i64) = (30, 30);
const INDICATOR_RADIUS: i64 = 10;
pub const INDICATOR_RGB: [u8; 3] = [255, 0, 0];

/// Outline colour per class.
pub fn class_color(class: &str) -> [u8; 3] {
    match class {
        SLEEPING => [231, 76, 60],
        PHONE => [243, 156, 18],
        FOOD => [52, 152, 219],
        BOTTLE => [155, 89, 182],
        _ => [46, 204, 113],
    }
}

/// Classes eligible for drawing: latest raw detections ∩ latest confirmed set.
pub fn classes_to_draw(raw: &DetectionSet, confirmed: &ClassSet) -> ClassSet {
    raw.classes()
        .filter(|class| confirmed.contains(*class))
        .map(str::to_string)
        .collect()
}

/// Draw box outlines for `classes` and return how many boxes were drawn.
pub fn draw_detections(frame: &mut Frame, raw: &DetectionSet, classes: &ClassSet) -> usize {
    let mut drawn = 0;
    for class in classes {
        let color = class_color(class);
        for det in raw.boxes(class) {
            let x0 = to_px(det.x, frame.width);
            let y0 = to_px(det.y, frame.height);
            let x1 = to_px(det.x + det.w, frame.width);
            let y1 = to_px(det.y + det.h, frame.height);
            draw_rect(frame, x0, y0, x1, y1, color);
            drawn += 1;
        }
    }
    drawn
}

/// Filled red disc in the top-left corner marking a frame as recorded.
pub fn draw_recording_indicator(frame: &mut Frame) {
    let (cx, cy) = INDICATOR_CENTER;
    let r = INDICATOR_RADIUS;
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 {
                frame.set_pixel(x as u32, y as u32, INDICATOR_RGB);
            }
        }
    }
}

fn to_px(v: f32, extent: u32) -> u32 {
    if extent == 0 {
        return 0;
    }
    let max = (extent - 1) as f32;
    (v * extent as f32).round().clamp(0.0, max) as u32
}

fn draw_rect(frame: &mut Frame, x0: u32, y0: u32, x1: u32, y1: u32, color: [u8; 3]) {
    let (x0, x1) = (x0.min(x1), x0.max(x1));
    let (y0, y1) = (y0.min(y1), y0.max(y1));
    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            frame.set_pixel(x, y0.saturating_add(t).min(y1), color);
            frame.set_pixel(x, y1.saturating_sub(t).max(y0), color);
        }
        for y in y0..=y1 {
            frame.set_pixel(x0.saturating_add(t).min(x1), y, color);
            frame.set_pixel(x1.saturating_sub(t).max(x0), y, color);
        }
    }
}

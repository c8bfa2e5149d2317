//! Decoded frames as they flow through the pipeline.
//!
//! - `Frame`: RGB24 pixels plus the capture timestamp used by every timer.
//! - `VideoFormat`: fixed per-run dimensions and rate handed to segment sinks.

use chrono::{DateTime, Utc};

/// Bytes per RGB24 pixel.
pub const RGB_CHANNELS: usize = 3;

/// Frame geometry and rate. Fixed for the duration of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self { width, height, fps }
    }

    /// Size of one RGB24 frame in bytes.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_CHANNELS
    }
}

/// One decoded frame.
///
/// `captured_at` is media time for file sources and wall time for live
/// sources; the confirmation and recording timers only ever compare two
/// `captured_at` values from the same run.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    /// Zero-based position in the source stream.
    pub index: u64,
}

impl Frame {
    /// Wrap RGB24 pixels. Returns `None` when the buffer does not match the
    /// dimensions.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
        index: u64,
    ) -> Option<Self> {
        if data.len() != width as usize * height as usize * RGB_CHANNELS {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            captured_at,
            index,
        })
    }

    /// All-black frame.
    pub fn blank(width: u32, height: u32, captured_at: DateTime<Utc>, index: u64) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * RGB_CHANNELS],
            width,
            height,
            captured_at,
            index,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        self.data[i..i + RGB_CHANNELS].copy_from_slice(&rgb);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

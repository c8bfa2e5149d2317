use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionSet};
use crate::frame::Frame;

/// Box used when a schedule window does not specify one.
const DEFAULT_BOX: [f32; 4] = [0.35, 0.3, 0.3, 0.4];

/// One scheduled detection window, relative to the first frame seen.
#[derive(Clone, Debug, Deserialize)]
pub struct ScheduleWindow {
    pub class: String,
    /// Inclusive start, seconds after the first frame.
    pub start_secs: f64,
    /// Exclusive end, seconds after the first frame.
    pub end_secs: f64,
    /// Normalized `[x, y, w, h]`.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.9
}

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    windows: Vec<ScheduleWindow>,
}

/// Replays a fixed detection timeline instead of running a model.
///
/// Used for replaying annotated footage and for deterministic runs where the
/// real detector is not linked in.
pub struct ScheduleBackend {
    windows: Vec<ScheduleWindow>,
    origin: Option<DateTime<Utc>>,
}

impl ScheduleBackend {
    pub fn new(windows: Vec<ScheduleWindow>) -> Result<Self> {
        for window in &windows {
            if window.class.trim().is_empty() {
                return Err(anyhow!("schedule window has an empty class name"));
            }
            if !(window.start_secs.is_finite() && window.end_secs.is_finite())
                || window.end_secs < window.start_secs
            {
                return Err(anyhow!(
                    "schedule window for {} has an invalid range {}..{}",
                    window.class,
                    window.start_secs,
                    window.end_secs
                ));
            }
        }
        Ok(Self {
            windows,
            origin: None,
        })
    }

    /// Load a schedule from a JSON file of the form `{"windows": [...]}`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read schedule {}: {}", path.display(), e))?;
        let file: ScheduleFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid schedule {}: {}", path.display(), e))?;
        Self::new(file.windows)
    }

    /// A backend that never detects anything.
    pub fn empty() -> Self {
        Self {
            windows: Vec::new(),
            origin: None,
        }
    }
}

impl DetectorBackend for ScheduleBackend {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet> {
        let origin = *self.origin.get_or_insert(frame.captured_at);
        let offset = (frame.captured_at - origin)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let mut set = DetectionSet::new();
        for window in &self.windows {
            if offset >= window.start_secs && offset < window.end_secs {
                let [x, y, w, h] = window.bbox.unwrap_or(DEFAULT_BOX);
                set.insert(
                    window.class.clone(),
                    vec![Detection::new(x, y, w, h, window.confidence)],
                );
            }
        }
        Ok(set)
    }
}

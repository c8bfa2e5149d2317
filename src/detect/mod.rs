//! Per-frame object detection.
//!
//! The detector itself is an external collaborator. The pipeline only sees
//! the [`DetectorBackend`] trait and the [`DetectionSet`] it returns for each
//! sampled frame.

mod backend;
mod backends;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ScheduleBackend, ScheduleWindow};
pub use result::{Detection, DetectionSet};

//! Frame ingestion sources.
//!
//! Sources hand out decoded RGB24 frames in stream order. Each frame carries
//! the capture time every downstream timer is computed from:
//! - file sources derive it from the frame index and the stream rate, so a
//!   replay of the same file always produces the same timeline
//! - `stub://` sources synthesize frames for tests and dry runs
//!
//! Only local paths are accepted. Network URLs are rejected up front.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
mod y4m;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::frame::{Frame, VideoFormat};

pub use file::{FileConfig, FileSource, FileStats};

/// Largest frame edge a file source will allocate buffers for.
pub const MAX_DIMENSION: u32 = 8192;

/// A finite or unbounded stream of frames.
pub trait FrameSource {
    /// Geometry and rate of the frames this source yields.
    fn format(&self) -> VideoFormat;

    /// Next frame, `Ok(None)` once the stream is exhausted.
    ///
    /// An `Err` ends the run; the orchestrator does not retry.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn format(&self) -> VideoFormat {
        (**self).format()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

/// Media time of frame `index` at `fps`, counted from `start`.
pub fn frame_time(start: DateTime<Utc>, index: u64, fps: f64) -> DateTime<Utc> {
    if !fps.is_finite() || fps <= 0.0 {
        return start;
    }
    let micros = (index as f64 * 1_000_000.0 / fps).round() as i64;
    start + ChronoDuration::microseconds(micros)
}

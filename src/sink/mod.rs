//! Segment sinks.
//!
//! A sink opens one writer per recorded segment. The writer is owned by the
//! recorder for the lifetime of the segment and is consumed by
//! [`SegmentWriter::finish`], so a closed segment cannot be written again and
//! every exit path has to go through `finish` or `Drop`.
//!
//! - `Y4mSink`: uncompressed YUV4MPEG2 files on disk (playable by ffmpeg/mpv).
//! - `FfmpegSink`: MPEG-4 in an mp4 container (`sink-ffmpeg` feature).
//! - `MemorySink`: in-process recording with failure injection (tests, dry runs).

#[cfg(feature = "sink-ffmpeg")]
mod ffmpeg;
mod memory;
mod y4m;

use std::path::Path;

use anyhow::Result;

use crate::frame::{Frame, VideoFormat};

pub use memory::{MemorySink, MemorySinkLog, RecordedSegment};
#[cfg(feature = "sink-ffmpeg")]
pub use ffmpeg::{FfmpegSink, MP4_EXTENSION};
pub(crate) use y4m::{file_sha256, COLOR_MATRIX, COLOR_RANGE};
pub use y4m::{Y4mSink, Y4M_EXTENSION};

/// What a finished writer leaves behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentArtifact {
    pub frames_written: u64,
    /// Hex SHA-256 of the bytes written, when the sink computes one.
    pub sha256: Option<String>,
}

pub trait SegmentSink {
    /// File extension (without the dot) used when allocating segment paths.
    fn extension(&self) -> &'static str;

    /// Open a writer for a new segment at `path`.
    fn open(&mut self, path: &Path, format: VideoFormat) -> Result<Box<dyn SegmentWriter>>;
}

pub trait SegmentWriter {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and release the output. Consumes the writer.
    fn finish(self: Box<Self>) -> Result<SegmentArtifact>;
}

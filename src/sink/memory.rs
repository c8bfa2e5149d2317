use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::{SegmentArtifact, SegmentSink, SegmentWriter};
use crate::frame::{Frame, VideoFormat};

/// One segment captured by a [`MemorySink`].
#[derive(Clone, Debug)]
pub struct RecordedSegment {
    pub path: PathBuf,
    pub format: VideoFormat,
    pub frames: Vec<Frame>,
    pub finished: bool,
}

/// Shared view of everything a [`MemorySink`] has recorded.
#[derive(Clone, Debug, Default)]
pub struct MemorySinkLog {
    segments: Arc<Mutex<Vec<RecordedSegment>>>,
}

impl MemorySinkLog {
    pub fn segments(&self) -> Vec<RecordedSegment> {
        self.segments
            .lock()
            .map(|segments| segments.clone())
            .unwrap_or_default()
    }

    /// Writers opened but never finished.
    pub fn open_writers(&self) -> usize {
        self.segments()
            .iter()
            .filter(|segment| !segment.finished)
            .count()
    }

    fn with_segment<T>(&self, slot: usize, f: impl FnOnce(&mut RecordedSegment) -> T) -> Result<T> {
        let mut segments = self
            .segments
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?;
        let segment = segments
            .get_mut(slot)
            .ok_or_else(|| anyhow!("memory sink: unknown segment {}", slot))?;
        Ok(f(segment))
    }
}

/// Keeps segments in memory. Failures can be injected to exercise the
/// recorder's writer-failure path.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    log: MemorySinkLog,
    opens: usize,
    fail_open_at: Option<usize>,
    fail_write_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MemorySinkLog {
        self.log.clone()
    }

    /// Make the `n`th call to `open` (zero-based) fail.
    pub fn fail_open_at(mut self, n: usize) -> Self {
        self.fail_open_at = Some(n);
        self
    }

    /// Make every writer fail once it has accepted `n` frames.
    pub fn fail_write_after(mut self, n: usize) -> Self {
        self.fail_write_after = Some(n);
        self
    }
}

impl SegmentSink for MemorySink {
    fn extension(&self) -> &'static str {
        "raw"
    }

    fn open(&mut self, path: &Path, format: VideoFormat) -> Result<Box<dyn SegmentWriter>> {
        let attempt = self.opens;
        self.opens += 1;
        if self.fail_open_at == Some(attempt) {
            return Err(anyhow!("memory sink: injected open failure"));
        }
        let slot = {
            let mut segments = self
                .log
                .segments
                .lock()
                .map_err(|_| anyhow!("memory sink lock poisoned"))?;
            segments.push(RecordedSegment {
                path: path.to_path_buf(),
                format,
                frames: Vec::new(),
                finished: false,
            });
            segments.len() - 1
        };
        Ok(Box::new(MemoryWriter {
            log: self.log.clone(),
            slot,
            written: 0,
            fail_write_after: self.fail_write_after,
        }))
    }
}

struct MemoryWriter {
    log: MemorySinkLog,
    slot: usize,
    written: usize,
    fail_write_after: Option<usize>,
}

impl SegmentWriter for MemoryWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.fail_write_after.is_some_and(|limit| self.written >= limit) {
            return Err(anyhow!("memory sink: injected write failure"));
        }
        self.log
            .with_segment(self.slot, |segment| segment.frames.push(frame.clone()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SegmentArtifact> {
        self.log
            .with_segment(self.slot, |segment| segment.finished = true)?;
        Ok(SegmentArtifact {
            frames_written: self.written as u64,
            sha256: None,
        })
    }
}

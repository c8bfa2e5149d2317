//! Segment recording lifecycle.
//!
//! The recorder opens a segment on the first confirmed violation, extends it
//! while confirmations keep arriving, and closes it once no confirmation has
//! been seen for the trailing buffer interval. Each closed segment becomes
//! exactly one ledger entry.
//!
//! The open writer belongs to the recorder alone. It is released on every
//! exit path: buffer close, [`SegmentRecorder::finish`] at end of stream, a
//! writer failure, and `Drop`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::annotate::draw_recording_indicator;
use crate::frame::{Frame, VideoFormat};
use crate::ledger::{ClosedSegment, ViolationLedger};
use crate::sink::{SegmentSink, SegmentWriter};
use crate::{elapsed_between, ClassSet};

/// Allocates unique segment paths:
/// `<root>/segments/<YYYY-MM-DD>/seg_<HH-MM-SS>[_N].<ext>`.
#[derive(Debug)]
pub struct SegmentPathAllocator {
    root: PathBuf,
    issued: HashSet<PathBuf>,
}

impl SegmentPathAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            issued: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Next free path for a segment opened at `at`. Two opens within the same
    /// second get `_2`, `_3`, ... suffixes; files left by earlier runs are
    /// never reused.
    pub fn allocate(&mut self, at: DateTime<Utc>, extension: &str) -> PathBuf {
        let dir = self
            .root
            .join("segments")
            .join(at.format("%Y-%m-%d").to_string());
        let stem = format!("seg_{}", at.format("%H-%M-%S"));
        let mut n = 1u32;
        loop {
            let name = if n == 1 {
                format!("{stem}.{extension}")
            } else {
                format!("{stem}_{n}.{extension}")
            };
            let path = dir.join(name);
            if !self.issued.contains(&path) && !path.exists() {
                self.issued.insert(path.clone());
                return path;
            }
            n += 1;
        }
    }
}

/// Recorder state visible to callers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordingState {
    pub is_recording: bool,
    /// Union of every confirmed set seen since the segment opened.
    pub accumulated_violation_types: ClassSet,
    pub segment_path: Option<PathBuf>,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// What one call to [`SegmentRecorder::on_frame`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecorderStep {
    pub opened: Option<PathBuf>,
    pub frame_written: bool,
    /// Ledger id of the segment closed on this frame.
    pub closed: Option<u64>,
}

pub struct SegmentRecorder<S: SegmentSink> {
    sink: S,
    allocator: SegmentPathAllocator,
    format: VideoFormat,
    buffer: Duration,
    state: RecordingState,
    writer: Option<Box<dyn SegmentWriter>>,
    writer_failure: Option<String>,
    frames_written: u64,
    segments_closed: u64,
}

impl<S: SegmentSink> SegmentRecorder<S> {
    pub fn new(sink: S, allocator: SegmentPathAllocator, format: VideoFormat, buffer: Duration) -> Self {
        Self {
            sink,
            allocator,
            format,
            buffer,
            state: RecordingState::default(),
            writer: None,
            writer_failure: None,
            frames_written: 0,
            segments_closed: 0,
        }
    }

    pub fn state(&self) -> &RecordingState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state.is_recording
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn segments_closed(&self) -> u64 {
        self.segments_closed
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Advance the recorder by one frame.
    ///
    /// `confirmed` is empty on frames that were not sampled. The frame is
    /// marked with the recording indicator and written while a segment is
    /// open; the close check runs after the write so the closing frame is
    /// part of the segment.
    pub fn on_frame(
        &mut self,
        frame: &mut Frame,
        confirmed: &ClassSet,
        ledger: &mut ViolationLedger,
    ) -> RecorderStep {
        let now = frame.captured_at;
        let mut step = RecorderStep::default();

        if !confirmed.is_empty() {
            if self.state.is_recording {
                self.state
                    .accumulated_violation_types
                    .extend(confirmed.iter().cloned());
            } else {
                step.opened = Some(self.open(now, confirmed));
            }
            self.state.last_confirmed_at = Some(now);
        }

        if self.state.is_recording {
            draw_recording_indicator(frame);
            step.frame_written = self.write(frame);

            let expired = self
                .state
                .last_confirmed_at
                .is_some_and(|last| elapsed_between(last, now) >= self.buffer);
            if expired {
                step.closed = Some(self.close(now, false, ledger));
            }
        }

        step
    }

    /// Force-close any open segment at end of stream.
    pub fn finish(&mut self, now: DateTime<Utc>, ledger: &mut ViolationLedger) -> Option<u64> {
        if !self.state.is_recording {
            return None;
        }
        Some(self.close(now, true, ledger))
    }

    fn open(&mut self, now: DateTime<Utc>, confirmed: &ClassSet) -> PathBuf {
        let path = self.allocator.allocate(now, self.sink.extension());
        match self.sink.open(&path, self.format) {
            Ok(writer) => {
                self.writer = Some(writer);
                log::info!(
                    "segment opened: {} classes=[{}]",
                    path.display(),
                    join_classes(confirmed)
                );
            }
            Err(e) => {
                log::error!("segment writer failed to open {}: {:#}", path.display(), e);
                self.writer_failure = Some(format!("open failed: {e:#}"));
            }
        }
        self.state = RecordingState {
            is_recording: true,
            accumulated_violation_types: confirmed.clone(),
            segment_path: Some(path.clone()),
            last_confirmed_at: Some(now),
            opened_at: Some(now),
        };
        self.frames_written = 0;
        path
    }

    fn write(&mut self, frame: &Frame) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        match writer.write(frame) {
            Ok(()) => {
                self.frames_written += 1;
                true
            }
            Err(e) => {
                log::error!(
                    "segment write failed at frame {}: {:#}; recording stops for this segment",
                    frame.index,
                    e
                );
                self.writer_failure = Some(format!("write failed: {e:#}"));
                if let Some(writer) = self.writer.take() {
                    if let Err(e) = writer.finish() {
                        log::warn!("segment writer release after failure: {:#}", e);
                    }
                }
                false
            }
        }
    }

    fn close(&mut self, now: DateTime<Utc>, forced: bool, ledger: &mut ViolationLedger) -> u64 {
        let mut segment_sha256 = None;
        if let Some(writer) = self.writer.take() {
            match writer.finish() {
                Ok(artifact) => segment_sha256 = artifact.sha256,
                Err(e) => {
                    log::error!("segment writer failed to close: {:#}", e);
                    self.writer_failure = Some(format!("close failed: {e:#}"));
                }
            }
        }

        let state = std::mem::take(&mut self.state);
        let opened_at = state.opened_at.unwrap_or(now);
        let segment_path = state.segment_path.unwrap_or_default();
        log::info!(
            "segment closed{}: {} classes=[{}] frames={} duration={}s",
            if forced { " (end of stream)" } else { "" },
            segment_path.display(),
            join_classes(&state.accumulated_violation_types),
            self.frames_written,
            elapsed_between(opened_at, now).as_secs()
        );

        let id = ledger.append(ClosedSegment {
            segment_path,
            opened_at,
            closed_at: now,
            violation_types: state.accumulated_violation_types,
            frames_written: self.frames_written,
            segment_sha256,
            writer_failure: self.writer_failure.take(),
            forced_close: forced,
        });
        self.frames_written = 0;
        self.segments_closed += 1;
        id
    }
}

impl<S: SegmentSink> Drop for SegmentRecorder<S> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            log::warn!("segment recorder dropped with an open writer; releasing it");
            if let Err(e) = writer.finish() {
                log::warn!("segment writer release on drop: {:#}", e);
            }
        }
    }
}

fn join_classes(classes: &ClassSet) -> String {
    classes.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::IdentityStatus;
    use crate::sink::MemorySink;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn set_of(classes: &[&str]) -> ClassSet {
        classes.iter().map(|c| c.to_string()).collect()
    }

    fn recorder(sink: MemorySink) -> SegmentRecorder<MemorySink> {
        SegmentRecorder::new(
            sink,
            SegmentPathAllocator::new("/nonexistent/monitor_output"),
            VideoFormat::new(40, 40, 1.0),
            Duration::from_secs(10),
        )
    }

    fn step(
        rec: &mut SegmentRecorder<MemorySink>,
        ledger: &mut ViolationLedger,
        secs: i64,
        classes: &[&str],
    ) -> RecorderStep {
        let mut frame = Frame::blank(40, 40, t(secs), secs as u64);
        rec.on_frame(&mut frame, &set_of(classes), ledger)
    }

    #[test]
    fn allocator_disambiguates_same_second() {
        let mut alloc = SegmentPathAllocator::new("/nonexistent/out");
        let a = alloc.allocate(t(5), "y4m");
        let b = alloc.allocate(t(5), "y4m");
        let c = alloc.allocate(t(6), "y4m");
        assert_eq!(
            a,
            PathBuf::from("/nonexistent/out/segments/2026-03-02/seg_09-00-05.y4m")
        );
        assert_eq!(
            b,
            PathBuf::from("/nonexistent/out/segments/2026-03-02/seg_09-00-05_2.y4m")
        );
        assert!(c.ends_with("seg_09-00-06.y4m"));
    }

    #[test]
    fn allocator_skips_files_from_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("segments/2026-03-02/seg_09-00-05.y4m");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, b"old").unwrap();
        let mut alloc = SegmentPathAllocator::new(dir.path());
        assert!(alloc.allocate(t(5), "y4m").ends_with("seg_09-00-05_2.y4m"));
    }

    #[test]
    fn idle_without_confirmations() {
        let sink = MemorySink::new();
        let log = sink.log();
        let mut rec = recorder(sink);
        let mut ledger = ViolationLedger::new();
        for s in 0..5 {
            assert_eq!(step(&mut rec, &mut ledger, s, &[]), RecorderStep::default());
        }
        assert!(log.segments().is_empty());
        assert!(ledger.is_empty());
    }

    #[test]
    fn closes_exactly_buffer_after_last_confirmation() {
        let sink = MemorySink::new();
        let log = sink.log();
        let mut rec = recorder(sink);
        let mut ledger = ViolationLedger::new();

        let opened = step(&mut rec, &mut ledger, 5, &["phone"]);
        assert!(opened.opened.is_some());
        assert!(opened.frame_written);
        for s in 6..15 {
            let st = step(&mut rec, &mut ledger, s, &[]);
            assert_eq!(st.closed, None, "closed early at t={s}");
        }
        let st = step(&mut rec, &mut ledger, 15, &[]);
        assert!(st.closed.is_some());
        assert!(!rec.is_recording());
        assert_eq!(*rec.state(), RecordingState::default());

        let entry = &ledger.entries()[0];
        assert_eq!(entry.opened_at, t(5));
        assert_eq!(entry.closed_at, t(15));
        assert_eq!(entry.violation_types, set_of(&["phone"]));
        assert_eq!(entry.identity_status, IdentityStatus::Pending);
        assert_eq!(entry.frames_written, 11);
        assert!(!entry.forced_close);

        let segments = log.segments();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].finished);
        assert_eq!(segments[0].frames.len(), 11);
        assert_eq!(segments[0].frames[0].pixel(30, 30), Some(crate::annotate::INDICATOR_RGB));
    }

    #[test]
    fn confirmations_extend_and_accumulate() {
        let mut rec = recorder(MemorySink::new());
        let mut ledger = ViolationLedger::new();
        step(&mut rec, &mut ledger, 0, &["phone"]);
        step(&mut rec, &mut ledger, 8, &["food"]);
        step(&mut rec, &mut ledger, 16, &["phone", "bottle"]);
        assert!(rec.is_recording());
        assert_eq!(
            rec.state().accumulated_violation_types,
            set_of(&["bottle", "food", "phone"])
        );
        for s in 17..26 {
            assert_eq!(step(&mut rec, &mut ledger, s, &[]).closed, None);
        }
        assert!(step(&mut rec, &mut ledger, 26, &[]).closed.is_some());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.entries()[0].violation_label(), "bottle, food, phone");
    }

    #[test]
    fn finish_force_closes_once() {
        let sink = MemorySink::new();
        let log = sink.log();
        let mut rec = recorder(sink);
        let mut ledger = ViolationLedger::new();
        step(&mut rec, &mut ledger, 0, &["sleeping"]);
        step(&mut rec, &mut ledger, 1, &[]);
        assert!(rec.finish(t(2), &mut ledger).is_some());
        assert!(rec.finish(t(3), &mut ledger).is_none());
        assert_eq!(ledger.len(), 1);
        assert!(ledger.entries()[0].forced_close);
        assert_eq!(log.open_writers(), 0);
    }

    #[test]
    fn open_failure_still_produces_entry() {
        let mut rec = recorder(MemorySink::new().fail_open_at(0));
        let mut ledger = ViolationLedger::new();
        let st = step(&mut rec, &mut ledger, 0, &["phone"]);
        assert!(st.opened.is_some());
        assert!(!st.frame_written);
        for s in 1..=10 {
            step(&mut rec, &mut ledger, s, &[]);
        }
        assert_eq!(ledger.len(), 1);
        let entry = &ledger.entries()[0];
        assert!(entry
            .writer_failure
            .as_deref()
            .is_some_and(|note| note.starts_with("open failed")));
        assert_eq!(entry.frames_written, 0);
    }

    #[test]
    fn write_failure_releases_writer_and_keeps_lifecycle() {
        let sink = MemorySink::new().fail_write_after(2);
        let log = sink.log();
        let mut rec = recorder(sink);
        let mut ledger = ViolationLedger::new();
        step(&mut rec, &mut ledger, 0, &["food"]);
        step(&mut rec, &mut ledger, 1, &[]);
        let st = step(&mut rec, &mut ledger, 2, &[]);
        assert!(!st.frame_written);
        assert_eq!(log.open_writers(), 0);
        assert!(rec.is_recording());
        for s in 3..=10 {
            step(&mut rec, &mut ledger, s, &[]);
        }
        let entry = &ledger.entries()[0];
        assert_eq!(entry.frames_written, 2);
        assert!(entry.writer_failure.is_some());
    }

    #[test]
    fn drop_releases_open_writer() {
        let sink = MemorySink::new();
        let log = sink.log();
        {
            let mut rec = recorder(sink);
            let mut ledger = ViolationLedger::new();
            step(&mut rec, &mut ledger, 0, &["phone"]);
            assert_eq!(log.open_writers(), 1);
        }
        assert_eq!(log.open_writers(), 0);
    }
}

//! Single-pass driver over a frame source.
//!
//! Frames are processed strictly in order: detection (sampled frames only),
//! confirmation, drawing and recording for frame *i* all complete before frame
//! *i + 1* is read. Every way out of [`StreamOrchestrator::run`] force-closes
//! the open segment first, so the writer is released before attribution runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::annotate::{classes_to_draw, draw_detections};
use crate::attribution::{AttributionPipeline, AttributionSummary, IdentityMatcher};
use crate::confirm::ConfirmationFilter;
use crate::detect::{DetectionSet, DetectorBackend};
use crate::frame::VideoFormat;
use crate::ingest::FrameSource;
use crate::ledger::ViolationLedger;
use crate::recorder::{SegmentPathAllocator, SegmentRecorder};
use crate::sink::SegmentSink;
use crate::{elapsed_between, ClassSet};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Run-scoped tuning consumed by the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Run the detector on every Nth frame.
    pub frame_skip: u64,
    /// Trailing buffer after the last confirmation before a segment closes.
    pub buffer: Duration,
    /// Continuous "sleeping" time required before it is confirmed.
    pub sleep_debounce: Duration,
    /// Minimum identity similarity, 0..1.
    pub similarity_threshold: f32,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
    /// Stop once this much media time has elapsed since the first frame.
    pub max_duration: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            buffer: Duration::from_secs(10),
            sleep_debounce: Duration::from_secs(10),
            similarity_threshold: 0.5,
            max_frames: None,
            max_duration: None,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.frame_skip == 0 {
            return Err(anyhow!("config: frame_skip must be at least 1"));
        }
        if self.buffer.is_zero() {
            return Err(anyhow!("config: recording buffer must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(anyhow!(
                "config: similarity_threshold must be within 0..1 (got {})",
                self.similarity_threshold
            ));
        }
        if self.max_frames == Some(0) {
            return Err(anyhow!("config: max_frames must be at least 1"));
        }
        if self.max_duration.is_some_and(|d| d.is_zero()) {
            return Err(anyhow!("config: max_duration must be greater than zero"));
        }
        Ok(())
    }
}

/// Cloneable handle used to ask a running pipeline to stop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the frame loop ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    SourceExhausted,
    StopRequested,
    FrameCapReached,
    TimeCapReached,
    SourceReadFailure(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::SourceExhausted => f.write_str("source exhausted"),
            TerminationReason::StopRequested => f.write_str("stop requested"),
            TerminationReason::FrameCapReached => f.write_str("frame cap reached"),
            TerminationReason::TimeCapReached => f.write_str("time cap reached"),
            TerminationReason::SourceReadFailure(e) => write!(f, "source read failure: {e}"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub total_frames: u64,
    pub sampled_frames: u64,
    pub detector_failures: u64,
    /// Sampled frames in which each class was detected (before confirmation).
    pub detections_by_class: BTreeMap<String, u64>,
    pub segments_opened: u64,
    pub segments_closed: u64,
    pub first_frame_at: Option<DateTime<Utc>>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub termination: TerminationReason,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            total_frames: 0,
            sampled_frames: 0,
            detector_failures: 0,
            detections_by_class: BTreeMap::new(),
            segments_opened: 0,
            segments_closed: 0,
            first_frame_at: None,
            last_frame_at: None,
            termination: TerminationReason::SourceExhausted,
        }
    }
}

pub struct StreamOrchestrator<S: SegmentSink> {
    settings: PipelineSettings,
    filter: ConfirmationFilter,
    recorder: SegmentRecorder<S>,
    stop: StopSignal,
    /// Raw detections of the latest sampled frame.
    last_raw: DetectionSet,
    /// Confirmed set of the latest sampled frame; cleared when a segment closes.
    last_confirmed: ClassSet,
}

impl<S: SegmentSink> StreamOrchestrator<S> {
    pub fn new(
        settings: PipelineSettings,
        sink: S,
        allocator: SegmentPathAllocator,
        format: VideoFormat,
    ) -> Result<Self> {
        settings.validate()?;
        if format.width == 0 || format.height == 0 {
            return Err(anyhow!("config: frame size must be non-zero"));
        }
        Ok(Self {
            filter: ConfirmationFilter::new(settings.sleep_debounce),
            recorder: SegmentRecorder::new(sink, allocator, format, settings.buffer),
            settings,
            stop: StopSignal::new(),
            last_raw: DetectionSet::new(),
            last_confirmed: ClassSet::new(),
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn recorder(&self) -> &SegmentRecorder<S> {
        &self.recorder
    }

    /// Handle that stops [`StreamOrchestrator::run`] before the next frame.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Drive `source` to completion, appending closed segments to `ledger`.
    ///
    /// Source read failures end the run and are reported in
    /// [`RunSummary::termination`]; they are not returned as errors.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        detector: &mut dyn DetectorBackend,
        ledger: &mut ViolationLedger,
    ) -> RunSummary {
        let mut summary = RunSummary::new();
        let mut last_health_log = Instant::now();
        log::info!(
            "pipeline running: detector={} skip={} buffer={}s debounce={}s",
            detector.name(),
            self.settings.frame_skip,
            self.settings.buffer.as_secs_f64(),
            self.settings.sleep_debounce.as_secs_f64()
        );

        summary.termination = loop {
            if self.stop.is_stop_requested() {
                break TerminationReason::StopRequested;
            }
            if self
                .settings
                .max_frames
                .is_some_and(|cap| summary.total_frames >= cap)
            {
                break TerminationReason::FrameCapReached;
            }

            let mut frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break TerminationReason::SourceExhausted,
                Err(e) => {
                    log::error!("frame source failed: {:#}", e);
                    break TerminationReason::SourceReadFailure(format!("{e:#}"));
                }
            };
            let now = frame.captured_at;
            let first = *summary.first_frame_at.get_or_insert(now);
            if self
                .settings
                .max_duration
                .is_some_and(|cap| elapsed_between(first, now) >= cap)
            {
                break TerminationReason::TimeCapReached;
            }

            let mut confirmed = ClassSet::new();
            if frame.index % self.settings.frame_skip == 0 {
                match detector.detect(&frame) {
                    Ok(raw) => {
                        summary.sampled_frames += 1;
                        for class in raw.classes() {
                            *summary
                                .detections_by_class
                                .entry(class.to_string())
                                .or_insert(0) += 1;
                        }
                        let confirmation = self.filter.confirm(now, &raw);
                        confirmed = confirmation.confirmed;
                        self.last_confirmed = confirmed.clone();
                        self.last_raw = raw;
                    }
                    Err(e) => {
                        summary.detector_failures += 1;
                        log::warn!("detector failed on frame {}: {:#}", frame.index, e);
                    }
                }
            }

            if self.recorder.is_recording() || !confirmed.is_empty() {
                let draw = classes_to_draw(&self.last_raw, &self.last_confirmed);
                draw_detections(&mut frame, &self.last_raw, &draw);
            }

            let step = self.recorder.on_frame(&mut frame, &confirmed, ledger);
            if step.opened.is_some() {
                summary.segments_opened += 1;
            }
            if step.closed.is_some() {
                summary.segments_closed += 1;
                self.last_confirmed.clear();
            }

            summary.total_frames += 1;
            summary.last_frame_at = Some(now);

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "pipeline health: frames={} sampled={} recording={} segments={}",
                    summary.total_frames,
                    summary.sampled_frames,
                    self.recorder.is_recording(),
                    ledger.len()
                );
                last_health_log = Instant::now();
            }
        };

        if let Some(now) = summary.last_frame_at {
            if self.recorder.finish(now, ledger).is_some() {
                summary.segments_closed += 1;
            }
        }
        self.last_confirmed.clear();

        log::info!(
            "pipeline stopped ({}): frames={} sampled={} segments={}",
            summary.termination,
            summary.total_frames,
            summary.sampled_frames,
            summary.segments_closed
        );
        summary
    }

    /// Resolve identities for every pending ledger entry.
    pub fn attribute(
        &self,
        ledger: &mut ViolationLedger,
        matcher: &mut dyn IdentityMatcher,
    ) -> AttributionSummary {
        AttributionPipeline::new(self.settings.similarity_threshold).resolve_all(ledger, matcher)
    }
}

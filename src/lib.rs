//! Conduct Witness
//!
//! This crate turns a classroom video stream into evidentiary clips of
//! behavioural violations and a ledger that attributes each clip to a
//! student.
//!
//! # Architecture
//!
//! Processing is single-threaded and frame-sequential:
//!
//! 1. **Detect**: an external detector labels every Nth frame.
//! 2. **Confirm**: instantaneous classes are confirmed at once; "sleeping"
//!    must persist for a debounce interval first.
//! 3. **Record**: the first confirmation opens a segment, later ones extend
//!    it, and it closes a trailing buffer after the last confirmation.
//! 4. **Ledger**: each closed segment becomes exactly one `Pending` entry.
//! 5. **Attribute**: after the stream ends, each pending entry is matched
//!    against an identity database, one entry at a time, failures isolated.
//!
//! # Module Structure
//!
//! - `detect`: detection sets and the detector backend trait
//! - `frame`: decoded frames and stream format
//! - `ingest`: frame sources (local files, `stub://`)
//! - `confirm`: temporal confirmation filter
//! - `annotate`: box and recording-indicator drawing
//! - `sink`: segment containers
//! - `recorder`: segment lifecycle
//! - `ledger`: violation ledger
//! - `attribution`: deferred identity matching
//! - `orchestrator`: the frame loop
//! - `report`: text and JSON exports
//! - `config`: file and environment configuration

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub mod annotate;
pub mod attribution;
pub mod config;
pub mod confirm;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod ledger;
pub mod orchestrator;
pub mod recorder;
pub mod report;
pub mod sink;
pub mod ui;

pub use attribution::{
    open_identity_matcher, AppearanceEmbedder, AttributionPipeline, AttributionSummary,
    FaceEmbedder, FaceSample, IdentityMatch, IdentityMatcher, IdentityRoster, NoIdentityDatabase,
    RosterMatcher, UNKNOWN_IDENTITY,
};
pub use config::MonitorConfig;
pub use confirm::{Confirmation, ConfirmationFilter, ConfirmationState};
pub use detect::{Detection, DetectionSet, DetectorBackend, ScheduleBackend, ScheduleWindow};
pub use frame::{Frame, VideoFormat};
pub use ingest::{FileConfig, FileSource, FrameSource};
pub use ledger::{ClosedSegment, IdentityStatus, LedgerEntry, UnresolvedReason, ViolationLedger};
pub use orchestrator::{
    PipelineSettings, RunSummary, StopSignal, StreamOrchestrator, TerminationReason,
};
pub use recorder::{RecorderStep, RecordingState, SegmentPathAllocator, SegmentRecorder};
pub use sink::{MemorySink, SegmentArtifact, SegmentSink, SegmentWriter, Y4mSink};
#[cfg(feature = "sink-ffmpeg")]
pub use sink::FfmpegSink;

// Detection vocabulary.

/// Requires continuous presence for the debounce interval before it counts.
pub const SLEEPING: &str = "sleeping";
pub const PHONE: &str = "phone";
pub const FOOD: &str = "food";
pub const BOTTLE: &str = "bottle";

/// Set of class names, iterated in sorted order.
pub type ClassSet = BTreeSet<String>;

/// Time from `since` to `now`, zero if `now` is earlier.
pub fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

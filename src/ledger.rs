//! Violation ledger.
//!
//! Append-only, in-process record of closed segments. Entries are created
//! once by the recorder (always `Pending`) and resolved at most once by the
//! attribution pipeline. Nothing in the core removes an entry.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ClassSet;

/// Why an entry could not be attributed to a known identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// The matcher ran but found no confident match.
    Unrecognized,
    /// The matcher failed on this segment.
    AnalysisError(String),
    /// No identity database was available for the run.
    NoDatabase,
    /// The segment was never fully written.
    RecordingFailed,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::Unrecognized => "unrecognized",
            UnresolvedReason::AnalysisError(_) => "analysis error",
            UnresolvedReason::NoDatabase => "no database",
            UnresolvedReason::RecordingFailed => "recording failed",
        }
    }
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdentityStatus {
    Pending,
    Resolved { name: String, score: f32 },
    Unresolved { reason: UnresolvedReason },
}

impl IdentityStatus {
    pub fn unresolved(reason: UnresolvedReason) -> Self {
        IdentityStatus::Unresolved { reason }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, IdentityStatus::Pending)
    }
}

/// A segment as handed over by the recorder at close time.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedSegment {
    pub segment_path: PathBuf,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub violation_types: ClassSet,
    pub frames_written: u64,
    pub segment_sha256: Option<String>,
    /// Set when the sink failed to open, write or close the segment.
    pub writer_failure: Option<String>,
    /// Closed by end of stream rather than by the trailing buffer.
    pub forced_close: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub segment_path: PathBuf,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub violation_types: ClassSet,
    pub identity_status: IdentityStatus,
    /// Face crop or similar artifact produced by the identity matcher.
    pub evidence_path: Option<PathBuf>,
    pub frames_written: u64,
    pub segment_sha256: Option<String>,
    pub writer_failure: Option<String>,
    pub forced_close: bool,
}

impl LedgerEntry {
    /// Sorted, comma-joined violation classes, e.g. `"phone, sleeping"`.
    pub fn violation_label(&self) -> String {
        self.violation_types
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Wall-clock time of day the segment closed.
    pub fn display_time(&self) -> String {
        self.closed_at.format("%H:%M:%S").to_string()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ViolationLedger {
    entries: Vec<LedgerEntry>,
    next_id: u64,
}

impl ViolationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a closed segment as a new `Pending` entry and return its id.
    pub fn append(&mut self, segment: ClosedSegment) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(LedgerEntry {
            id,
            segment_path: segment.segment_path,
            opened_at: segment.opened_at,
            closed_at: segment.closed_at,
            violation_types: segment.violation_types,
            identity_status: IdentityStatus::Pending,
            evidence_path: None,
            frames_written: segment.frames_written,
            segment_sha256: segment.segment_sha256,
            writer_failure: segment.writer_failure,
            forced_close: segment.forced_close,
        });
        id
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&LedgerEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Ids of entries still awaiting attribution, in ledger order.
    pub fn pending_ids(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|entry| entry.identity_status.is_pending())
            .map(|entry| entry.id)
            .collect()
    }

    /// Move a `Pending` entry to a terminal status.
    ///
    /// Fails if the entry is unknown, already resolved, or `status` is
    /// itself `Pending`.
    pub fn resolve(
        &mut self,
        id: u64,
        status: IdentityStatus,
        evidence_path: Option<PathBuf>,
    ) -> Result<()> {
        if status.is_pending() {
            return Err(anyhow!("conformance: cannot resolve entry {} to pending", id));
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| anyhow!("ledger: no entry with id {}", id))?;
        if !entry.identity_status.is_pending() {
            return Err(anyhow!(
                "conformance: ledger entry {} already resolved",
                id
            ));
        }
        entry.identity_status = status;
        entry.evidence_path = evidence_path;
        Ok(())
    }

    /// Number of entries whose violation set contains each class.
    pub fn counts_by_class(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            for class in &entry.violation_types {
                *counts.entry(class.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn closed(path: &str, classes: &[&str]) -> ClosedSegment {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 4).unwrap();
        ClosedSegment {
            segment_path: PathBuf::from(path),
            opened_at: t,
            closed_at: t + chrono::Duration::seconds(12),
            violation_types: classes.iter().map(|c| c.to_string()).collect(),
            frames_written: 120,
            segment_sha256: None,
            writer_failure: None,
            forced_close: false,
        }
    }

    #[test]
    fn append_assigns_increasing_ids_and_pending_status() {
        let mut ledger = ViolationLedger::new();
        let a = ledger.append(closed("a.y4m", &["phone"]));
        let b = ledger.append(closed("b.y4m", &["sleeping"]));
        assert!(a < b);
        assert_eq!(ledger.pending_ids(), vec![a, b]);
        assert_eq!(ledger.entries()[0].segment_path, PathBuf::from("a.y4m"));
    }

    #[test]
    fn label_is_sorted_and_comma_joined() {
        let mut ledger = ViolationLedger::new();
        let id = ledger.append(closed("a.y4m", &["sleeping", "bottle", "phone"]));
        let entry = ledger.get(id).unwrap();
        assert_eq!(entry.violation_label(), "bottle, phone, sleeping");
        assert_eq!(entry.display_time(), "09:15:16");
    }

    #[test]
    fn resolve_is_single_shot() {
        let mut ledger = ViolationLedger::new();
        let id = ledger.append(closed("a.y4m", &["food"]));
        assert!(ledger.resolve(id, IdentityStatus::Pending, None).is_err());
        ledger
            .resolve(
                id,
                IdentityStatus::Resolved {
                    name: "Ivanov".to_string(),
                    score: 0.8,
                },
                Some(PathBuf::from("face.jpg")),
            )
            .unwrap();
        assert!(ledger
            .resolve(id, IdentityStatus::unresolved(UnresolvedReason::NoDatabase), None)
            .is_err());
        assert!(ledger.pending_ids().is_empty());
        assert!(ledger.resolve(99, IdentityStatus::unresolved(UnresolvedReason::NoDatabase), None).is_err());
    }

    #[test]
    fn counts_by_class_counts_entries() {
        let mut ledger = ViolationLedger::new();
        ledger.append(closed("a", &["phone", "food"]));
        ledger.append(closed("b", &["phone"]));
        let counts = ledger.counts_by_class();
        assert_eq!(counts.get("phone"), Some(&2));
        assert_eq!(counts.get("food"), Some(&1));
        assert_eq!(counts.get("sleeping"), None);
    }

    #[test]
    fn reasons_render_report_labels() {
        assert_eq!(UnresolvedReason::NoDatabase.to_string(), "no database");
        assert_eq!(
            UnresolvedReason::AnalysisError("bad file".into()).as_str(),
            "analysis error"
        );
    }
}

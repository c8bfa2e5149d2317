//! Operator-facing exports of the violation ledger.
//!
//! - `report_<YYYY-MM-DD>.txt`: one block per entry, in ledger order.
//! - JSON export: the full ledger plus per-class counts, for tooling.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;

use crate::ledger::{IdentityStatus, LedgerEntry, ViolationLedger};
use crate::orchestrator::RunSummary;

const RULE_WIDE: usize = 70;
const RULE_NARROW: usize = 30;

/// Student column of the report.
pub fn student_label(status: &IdentityStatus) -> String {
    match status {
        IdentityStatus::Pending => "pending".to_string(),
        IdentityStatus::Resolved { name, score } => {
            format!("{} ({:.0}%)", name, score * 100.0)
        }
        IdentityStatus::Unresolved { reason } => reason.to_string(),
    }
}

/// Render the text report for `date`.
pub fn render_text_report(ledger: &ViolationLedger, date: NaiveDate) -> Result<String> {
    let mut out = String::new();
    write_report(&mut out, ledger, date).context("report: render")?;
    Ok(out)
}

fn write_report(out: &mut String, ledger: &ViolationLedger, date: NaiveDate) -> fmt::Result {
    let wide = "=".repeat(RULE_WIDE);
    writeln!(out, "{wide}")?;
    writeln!(out, "VIOLATION REPORT | DATE: {}", date.format("%Y-%m-%d"))?;
    writeln!(out, "{wide}")?;
    writeln!(out)?;
    for (ordinal, entry) in ledger.iter().enumerate() {
        write_entry(out, ordinal + 1, entry)?;
    }
    Ok(())
}

fn write_entry(out: &mut String, ordinal: usize, entry: &LedgerEntry) -> fmt::Result {
    let evidence = entry
        .evidence_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "no face".to_string());
    writeln!(out, "#{ordinal}")?;
    writeln!(out, "{}", "-".repeat(RULE_NARROW))?;
    writeln!(out, "Time:        {}", entry.display_time())?;
    writeln!(out, "Violation:   {}", entry.violation_label())?;
    writeln!(out, "Student:     {}", student_label(&entry.identity_status))?;
    writeln!(out, "Video file:  {}", entry.segment_path.display())?;
    writeln!(out, "Face photo:  {evidence}")?;
    if let Some(failure) = &entry.writer_failure {
        writeln!(out, "Note:        {failure}")?;
    }
    writeln!(out)
}

/// Write `report_<date>.txt` into `dir`.
///
/// Returns `None` without touching the filesystem when the ledger is empty.
pub fn write_text_report(
    ledger: &ViolationLedger,
    dir: &Path,
    date: NaiveDate,
) -> Result<Option<PathBuf>> {
    if ledger.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("report: create directory {}", dir.display()))?;
    let path = dir.join(format!("report_{}.txt", date.format("%Y-%m-%d")));
    std::fs::write(&path, render_text_report(ledger, date)?)
        .with_context(|| format!("report: write {}", path.display()))?;
    log::info!("report written to {}", path.display());
    Ok(Some(path))
}

#[derive(Serialize)]
struct LedgerExport<'a> {
    run: Option<&'a RunSummary>,
    counts_by_class: BTreeMap<String, usize>,
    entries: &'a [LedgerEntry],
}

/// Write the ledger (and optionally the run summary) as pretty JSON.
pub fn write_json_export(
    ledger: &ViolationLedger,
    run: Option<&RunSummary>,
    path: &Path,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("export: create directory {}", parent.display()))?;
    }
    let export = LedgerExport {
        run,
        counts_by_class: ledger.counts_by_class(),
        entries: ledger.entries(),
    };
    let json = serde_json::to_vec_pretty(&export).context("export: serialize ledger")?;
    std::fs::write(path, json).with_context(|| format!("export: write {}", path.display()))?;
    log::info!("ledger export written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ClosedSegment, UnresolvedReason};
    use chrono::{TimeZone, Utc};

    fn ledger() -> ViolationLedger {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 10, 41, 7).unwrap();
        let mut ledger = ViolationLedger::new();
        for (path, classes, failure) in [
            ("seg_a.y4m", vec!["phone", "food"], None),
            ("seg_b.y4m", vec!["sleeping"], Some("write failed: disk full".to_string())),
        ] {
            ledger.append(ClosedSegment {
                segment_path: PathBuf::from(path),
                opened_at: t,
                closed_at: t,
                violation_types: classes.into_iter().map(String::from).collect(),
                frames_written: 10,
                segment_sha256: None,
                writer_failure: failure,
                forced_close: false,
            });
        }
        ledger
            .resolve(
                1,
                IdentityStatus::Resolved {
                    name: "Ivanov".to_string(),
                    score: 0.874,
                },
                Some(PathBuf::from("faces/ivanov.jpg")),
            )
            .unwrap();
        ledger
            .resolve(2, IdentityStatus::unresolved(UnresolvedReason::RecordingFailed), None)
            .unwrap();
        ledger
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[test]
    fn labels_match_report_vocabulary() {
        assert_eq!(
            student_label(&IdentityStatus::Resolved {
                name: "Petrova".into(),
                score: 0.5
            }),
            "Petrova (50%)"
        );
        assert_eq!(
            student_label(&IdentityStatus::unresolved(UnresolvedReason::AnalysisError(
                "decode".into()
            ))),
            "analysis error"
        );
        assert_eq!(
            student_label(&IdentityStatus::unresolved(UnresolvedReason::Unrecognized)),
            "unrecognized"
        );
    }

    #[test]
    fn text_report_lists_entries_in_order() {
        let text = render_text_report(&ledger(), date()).unwrap();
        assert!(text.contains("VIOLATION REPORT | DATE: 2026-03-02"));
        let first = text.find("#1").unwrap();
        let second = text.find("#2").unwrap();
        assert!(first < second);
        assert!(text.contains("Violation:   food, phone"));
        assert!(text.contains("Student:     Ivanov (87%)"));
        assert!(text.contains("Face photo:  faces/ivanov.jpg"));
        assert!(text.contains("Student:     recording failed"));
        assert!(text.contains("Face photo:  no face"));
        assert!(text.contains("Note:        write failed: disk full"));
        assert!(text.contains("Time:        10:41:07"));
    }

    #[test]
    fn empty_ledger_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = write_text_report(&ViolationLedger::new(), dir.path(), date()).unwrap();
        assert!(out.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn exports_are_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let report = write_text_report(&ledger, dir.path(), date()).unwrap().unwrap();
        assert_eq!(report, dir.path().join("report_2026-03-02.txt"));

        let json_path = dir.path().join("exports").join("ledger.json");
        write_json_export(&ledger, None, &json_path).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
        assert_eq!(value["entries"].as_array().unwrap().len(), 2);
        assert_eq!(value["counts_by_class"]["phone"], 1);
        assert_eq!(value["entries"][0]["identity_status"]["state"], "resolved");
        assert!(value["run"].is_null());
    }
}

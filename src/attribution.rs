//! Deferred identity attribution.
//!
//! Runs only after the frame stream has ended and every segment writer has
//! been released. Each `Pending` ledger entry is resolved independently: a
//! failure on one segment is recorded on that entry and the pass moves on.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::frame::{Frame, VideoFormat, RGB_CHANNELS};
use crate::ingest::{FileConfig, FileSource, FrameSource};
use crate::ledger::{IdentityStatus, UnresolvedReason, ViolationLedger};
use crate::sink::{SegmentSink, SegmentWriter, Y4mSink, Y4M_EXTENSION};

/// Display name a matcher returns when no identity clears the threshold.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Best identity guess for one segment.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityMatch {
    pub display_name: String,
    /// Similarity in 0..1.
    pub score: f32,
    pub evidence_path: Option<PathBuf>,
}

impl IdentityMatch {
    pub fn unknown(score: f32, evidence_path: Option<PathBuf>) -> Self {
        Self {
            display_name: UNKNOWN_IDENTITY.to_string(),
            score,
            evidence_path,
        }
    }
}

/// Face-matching collaborator.
pub trait IdentityMatcher {
    /// False when there is no identity database to match against.
    fn is_available(&self) -> bool;

    /// Analyse a closed segment. Errors mean the segment could not be
    /// processed; a below-threshold result is returned as
    /// [`UNKNOWN_IDENTITY`], not as an error.
    fn match_segment(&mut self, segment_path: &Path, similarity_threshold: f32)
        -> Result<IdentityMatch>;
}

/// Matcher used when no identity database is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIdentityDatabase;

impl IdentityMatcher for NoIdentityDatabase {
    fn is_available(&self) -> bool {
        false
    }

    fn match_segment(&mut self, _segment_path: &Path, _similarity_threshold: f32) -> Result<IdentityMatch> {
        Err(anyhow!("no identity database configured"))
    }
}

// -------------------- Roster matching --------------------

/// Best face found in a segment, as an embedding vector.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceSample {
    pub embedding: Vec<f32>,
    /// Saved face crop, if the embedder wrote one.
    pub evidence_path: Option<PathBuf>,
}

/// Extracts the most usable face from a video segment.
pub trait FaceEmbedder {
    /// `Ok(None)` when the segment contains no usable face.
    fn best_face(&mut self, segment_path: &Path) -> Result<Option<FaceSample>>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    students: Vec<RosterEntry>,
}

/// Named reference embeddings.
#[derive(Clone, Debug, Default)]
pub struct IdentityRoster {
    entries: Vec<RosterEntry>,
}

impl IdentityRoster {
    pub fn new(entries: Vec<RosterEntry>) -> Result<Self> {
        if let Some(first) = entries.first() {
            let dim = first.embedding.len();
            if dim == 0 {
                return Err(anyhow!("roster: empty embedding for {}", first.name));
            }
            if let Some(bad) = entries.iter().find(|entry| entry.embedding.len() != dim) {
                return Err(anyhow!(
                    "roster: embedding for {} has {} dimensions, expected {}",
                    bad.name,
                    bad.embedding.len(),
                    dim
                ));
            }
        }
        Ok(Self { entries })
    }

    /// Load `{"students": [{"name": ..., "embedding": [...]}, ...]}`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read roster {}: {}", path.display(), e))?;
        let file: RosterFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid roster {}: {}", path.display(), e))?;
        Self::new(file.students)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closest roster entry by cosine similarity.
    pub fn best_match(&self, embedding: &[f32]) -> Result<Option<(&str, f32)>> {
        let mut best: Option<(&str, f32)> = None;
        for entry in &self.entries {
            if entry.embedding.len() != embedding.len() {
                return Err(anyhow!(
                    "face embedding has {} dimensions, roster uses {}",
                    embedding.len(),
                    entry.embedding.len()
                ));
            }
            let score = cosine_similarity(&entry.embedding, embedding);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((entry.name.as_str(), score));
            }
        }
        Ok(best)
    }
}

/// Matches the best face of a segment against an [`IdentityRoster`].
pub struct RosterMatcher<E: FaceEmbedder> {
    roster: IdentityRoster,
    embedder: E,
}

impl<E: FaceEmbedder> RosterMatcher<E> {
    pub fn new(roster: IdentityRoster, embedder: E) -> Self {
        Self { roster, embedder }
    }
}

impl<E: FaceEmbedder> IdentityMatcher for RosterMatcher<E> {
    fn is_available(&self) -> bool {
        !self.roster.is_empty()
    }

    fn match_segment(&mut self, segment_path: &Path, similarity_threshold: f32) -> Result<IdentityMatch> {
        let Some(face) = self.embedder.best_face(segment_path)? else {
            return Ok(IdentityMatch::unknown(0.0, None));
        };
        match self.roster.best_match(&face.embedding)? {
            Some((name, score)) if score >= similarity_threshold => Ok(IdentityMatch {
                display_name: name.to_string(),
                score,
                evidence_path: face.evidence_path,
            }),
            Some((_, score)) => Ok(IdentityMatch::unknown(score, face.evidence_path)),
            None => Ok(IdentityMatch::unknown(0.0, face.evidence_path)),
        }
    }
}

/// Cosine similarity clamped to 0..1. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0)
}

// -------------------- Appearance embedder --------------------

/// Side of the luma grid [`AppearanceEmbedder`] reduces a crop to.
pub const APPEARANCE_GRID: u32 = 16;

/// Frames flatter than this (luma variance) hold nothing to match.
const MIN_CONTRAST: f32 = 4.0;

/// Model-free [`FaceEmbedder`]: takes the highest-contrast frame of a
/// segment, crops its centre and reduces it to a normalised
/// `APPEARANCE_GRID`x`APPEARANCE_GRID` luma descriptor.
///
/// Roster embeddings must come from [`AppearanceEmbedder::describe_frame`].
#[derive(Clone, Debug, Default)]
pub struct AppearanceEmbedder {
    evidence_dir: Option<PathBuf>,
}

impl AppearanceEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the chosen crop of each segment under `dir`.
    pub fn with_evidence_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            evidence_dir: Some(dir.into()),
        }
    }

    /// Descriptor of a whole frame. `None` when the frame is smaller than the
    /// grid or has no contrast.
    pub fn describe_frame(frame: &Frame) -> Option<Vec<f32>> {
        let (w, h) = (frame.width, frame.height);
        if w < APPEARANCE_GRID || h < APPEARANCE_GRID {
            return None;
        }
        let cells = (APPEARANCE_GRID * APPEARANCE_GRID) as usize;
        let mut sums = vec![0.0f32; cells];
        let mut counts = vec![0u32; cells];
        for (i, px) in frame.pixels().chunks_exact(RGB_CHANNELS).enumerate() {
            let (x, y) = (i as u32 % w, i as u32 / w);
            let cell = ((y * APPEARANCE_GRID / h) * APPEARANCE_GRID + x * APPEARANCE_GRID / w) as usize;
            sums[cell] += luma(px);
            counts[cell] += 1;
        }
        let mut descriptor: Vec<f32> = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| sum / (*count).max(1) as f32)
            .collect();
        let mean = descriptor.iter().sum::<f32>() / cells as f32;
        descriptor.iter_mut().for_each(|v| *v -= mean);
        let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-3 {
            return None;
        }
        descriptor.iter_mut().for_each(|v| *v /= norm);
        Some(descriptor)
    }

    fn save_crop(&self, segment_path: &Path, crop: &Frame) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.evidence_dir else {
            return Ok(None);
        };
        let stem = segment_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment".to_string());
        let path = dir.join(format!("{stem}_face.{Y4M_EXTENSION}"));
        let mut writer = Y4mSink::new().open(&path, VideoFormat::new(crop.width, crop.height, 1.0))?;
        writer.write(crop)?;
        writer.finish()?;
        Ok(Some(path))
    }
}

impl FaceEmbedder for AppearanceEmbedder {
    fn best_face(&mut self, segment_path: &Path) -> Result<Option<FaceSample>> {
        let mut source = FileSource::new(FileConfig {
            path: segment_path.display().to_string(),
            ..FileConfig::default()
        })?;
        let mut best: Option<(f32, Frame)> = None;
        while let Some(frame) = source.next_frame()? {
            let contrast = luma_variance(&frame);
            if best.as_ref().map_or(true, |(c, _)| contrast > *c) {
                best = Some((contrast, frame));
            }
        }
        let Some((contrast, frame)) = best else {
            return Ok(None);
        };
        if contrast < MIN_CONTRAST {
            return Ok(None);
        }
        let crop = center_crop(&frame).unwrap_or(frame);
        let Some(embedding) = Self::describe_frame(&crop) else {
            return Ok(None);
        };
        Ok(Some(FaceSample {
            embedding,
            evidence_path: self.save_crop(segment_path, &crop)?,
        }))
    }
}

fn luma(px: &[u8]) -> f32 {
    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
}

fn luma_variance(frame: &Frame) -> f32 {
    let n = (frame.width as usize * frame.height as usize).max(1) as f32;
    let (sum, sq) = frame
        .pixels()
        .chunks_exact(RGB_CHANNELS)
        .map(luma)
        .fold((0.0f32, 0.0f32), |(s, q), l| (s + l, q + l * l));
    let mean = sum / n;
    (sq / n - mean * mean).max(0.0)
}

/// Middle half of the frame in each direction, if it still covers the grid.
fn center_crop(frame: &Frame) -> Option<Frame> {
    let (w, h) = (frame.width / 2, frame.height / 2);
    if w < APPEARANCE_GRID || h < APPEARANCE_GRID {
        return None;
    }
    let (x0, y0) = (frame.width / 4, frame.height / 4);
    let row_bytes = w as usize * RGB_CHANNELS;
    let mut pixels = Vec::with_capacity(row_bytes * h as usize);
    for y in y0..y0 + h {
        let start = (y as usize * frame.width as usize + x0 as usize) * RGB_CHANNELS;
        pixels.extend_from_slice(frame.pixels().get(start..start + row_bytes)?);
    }
    Frame::from_rgb(pixels, w, h, frame.captured_at, frame.index)
}

/// Matcher for an optional roster file.
///
/// No path, or a path that does not exist, yields [`NoIdentityDatabase`]. An
/// existing roster is matched with an [`AppearanceEmbedder`] that saves face
/// crops under `evidence_dir`.
pub fn open_identity_matcher(
    roster_path: Option<&Path>,
    evidence_dir: &Path,
) -> Result<Box<dyn IdentityMatcher>> {
    let Some(path) = roster_path else {
        log::info!("no roster configured; segments will not be attributed");
        return Ok(Box::new(NoIdentityDatabase));
    };
    if !path.exists() {
        log::warn!("roster {} not found; segments will not be attributed", path.display());
        return Ok(Box::new(NoIdentityDatabase));
    }
    let roster = IdentityRoster::from_path(path)?;
    log::info!("loaded roster {} ({} student(s))", path.display(), roster.len());
    Ok(Box::new(RosterMatcher::new(
        roster,
        AppearanceEmbedder::with_evidence_dir(evidence_dir),
    )))
}

// -------------------- Pipeline --------------------

/// Outcome counts of one attribution pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributionSummary {
    pub resolved: usize,
    pub unrecognized: usize,
    pub analysis_errors: usize,
    pub no_database: usize,
    pub recording_failed: usize,
}

impl AttributionSummary {
    pub fn total(&self) -> usize {
        self.resolved + self.unrecognized + self.analysis_errors + self.no_database + self.recording_failed
    }

    fn count(&mut self, status: &IdentityStatus) {
        match status {
            IdentityStatus::Pending => {}
            IdentityStatus::Resolved { .. } => self.resolved += 1,
            IdentityStatus::Unresolved { reason } => match reason {
                UnresolvedReason::Unrecognized => self.unrecognized += 1,
                UnresolvedReason::AnalysisError(_) => self.analysis_errors += 1,
                UnresolvedReason::NoDatabase => self.no_database += 1,
                UnresolvedReason::RecordingFailed => self.recording_failed += 1,
            },
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AttributionPipeline {
    similarity_threshold: f32,
}

impl AttributionPipeline {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            similarity_threshold,
        }
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    /// Resolve every `Pending` entry in ledger order.
    pub fn resolve_all(
        &self,
        ledger: &mut ViolationLedger,
        matcher: &mut dyn IdentityMatcher,
    ) -> AttributionSummary {
        self.resolve_all_with_progress(ledger, matcher, |_, _| {})
    }

    /// As [`AttributionPipeline::resolve_all`], calling `progress(done, total)`
    /// after each entry.
    pub fn resolve_all_with_progress(
        &self,
        ledger: &mut ViolationLedger,
        matcher: &mut dyn IdentityMatcher,
        mut progress: impl FnMut(usize, usize),
    ) -> AttributionSummary {
        let pending = ledger.pending_ids();
        let total = pending.len();
        let mut summary = AttributionSummary::default();
        if total == 0 {
            return summary;
        }

        if !matcher.is_available() {
            log::warn!(
                "identity database unavailable; {} segment(s) left unattributed",
                total
            );
        }

        for (done, id) in pending.into_iter().enumerate() {
            let (status, evidence) = self.resolve_one(ledger, id, matcher);
            summary.count(&status);
            if let Err(e) = ledger.resolve(id, status, evidence) {
                log::error!("attribution: {:#}", e);
            }
            progress(done + 1, total);
        }

        log::info!(
            "attribution finished: resolved={} unrecognized={} errors={} no_database={} recording_failed={}",
            summary.resolved,
            summary.unrecognized,
            summary.analysis_errors,
            summary.no_database,
            summary.recording_failed
        );
        summary
    }

    fn resolve_one(
        &self,
        ledger: &ViolationLedger,
        id: u64,
        matcher: &mut dyn IdentityMatcher,
    ) -> (IdentityStatus, Option<PathBuf>) {
        if !matcher.is_available() {
            return (IdentityStatus::unresolved(UnresolvedReason::NoDatabase), None);
        }
        let Some(entry) = ledger.get(id) else {
            return (
                IdentityStatus::unresolved(UnresolvedReason::AnalysisError(
                    "entry vanished".to_string(),
                )),
                None,
            );
        };
        if entry.writer_failure.is_some() {
            log::warn!(
                "attribution skipped for {}: segment was not fully recorded",
                entry.segment_path.display()
            );
            return (IdentityStatus::unresolved(UnresolvedReason::RecordingFailed), None);
        }

        match matcher.match_segment(&entry.segment_path, self.similarity_threshold) {
            Ok(found) => {
                let confident = found.score.is_finite()
                    && found.score >= self.similarity_threshold
                    && found.display_name != UNKNOWN_IDENTITY;
                if confident {
                    log::info!(
                        "attributed {} to {} ({:.0}%)",
                        entry.segment_path.display(),
                        found.display_name,
                        found.score * 100.0
                    );
                    (
                        IdentityStatus::Resolved {
                            name: found.display_name,
                            score: found.score,
                        },
                        found.evidence_path,
                    )
                } else {
                    log::info!(
                        "no confident match for {} (best score {:.2})",
                        entry.segment_path.display(),
                        found.score
                    );
                    (
                        IdentityStatus::unresolved(UnresolvedReason::Unrecognized),
                        found.evidence_path,
                    )
                }
            }
            Err(e) => {
                log::warn!(
                    "identity analysis failed for {}: {:#}",
                    entry.segment_path.display(),
                    e
                );
                (
                    IdentityStatus::unresolved(UnresolvedReason::AnalysisError(format!("{e:#}"))),
                    None,
                )
            }
        }
    }
}

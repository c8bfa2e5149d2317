//! conduct_monitor - classroom conduct monitor
//!
//! This binary:
//! 1. Reads frames from a local file or a `stub://` source
//! 2. Runs the configured detector on every Nth frame
//! 3. Records confirmed violations into segments under the output directory
//! 4. Attributes each segment to a student once the stream has ended
//! 5. Writes the daily text report and a JSON export of the ledger

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use conduct_witness::report::{write_json_export, write_text_report};
use conduct_witness::ui::{Ui, UiMode};
#[cfg(feature = "sink-ffmpeg")]
use conduct_witness::FfmpegSink;
#[cfg(not(feature = "sink-ffmpeg"))]
use conduct_witness::Y4mSink;
use conduct_witness::{
    open_identity_matcher, AttributionPipeline, DetectorBackend, FileConfig, FileSource,
    FrameSource, MonitorConfig, ScheduleBackend, SegmentPathAllocator, StreamOrchestrator,
    TerminationReason, ViolationLedger,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CONDUCT_CONFIG")]
    config: Option<PathBuf>,
    /// Frame source: local video file or stub://<name>.
    #[arg(long)]
    source: Option<String>,
    /// Detection schedule replayed by the detector.
    #[arg(long)]
    schedule: Option<PathBuf>,
    /// Student roster used to attribute segments.
    #[arg(long)]
    roster: Option<PathBuf>,
    /// Output directory for segments and reports.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Terminal output style.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = match args.config.as_deref() {
        Some(path) => MonitorConfig::load_from(path)?,
        None => MonitorConfig::load()?,
    };
    if let Some(source) = args.source {
        cfg.source.path = source;
    }
    if let Some(schedule) = args.schedule {
        cfg.detection.schedule_path = Some(schedule);
    }
    if let Some(roster) = args.roster {
        cfg.identity.roster_path = Some(roster);
    }
    if let Some(output) = args.output {
        cfg.output_dir = output;
    }
    if let Some(max_frames) = args.max_frames {
        cfg.limits.max_frames = Some(max_frames);
    }
    cfg.validate()?;
    let settings = cfg.pipeline_settings()?;

    let ui = Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    );

    let mut source = FileSource::new(FileConfig {
        path: cfg.source.path.clone(),
        target_fps: f64::from(cfg.source.fps),
        width: cfg.source.width,
        height: cfg.source.height,
        start_at: Utc::now(),
        frame_limit: None,
    })?;

    let mut detector = match cfg.detection.schedule_path.as_deref() {
        Some(path) => ScheduleBackend::from_path(path)?,
        None => {
            log::warn!("no detection schedule configured; no violations will be detected");
            ScheduleBackend::empty()
        }
    };
    detector.warm_up()?;

    let mut matcher = open_identity_matcher(
        cfg.identity.roster_path.as_deref(),
        &cfg.output_dir.join("faces"),
    )?;

    #[cfg(feature = "sink-ffmpeg")]
    let sink = FfmpegSink::new();
    #[cfg(not(feature = "sink-ffmpeg"))]
    let sink = Y4mSink::new();

    let mut orchestrator = StreamOrchestrator::new(
        settings.clone(),
        sink,
        SegmentPathAllocator::new(cfg.output_dir.clone()),
        source.format(),
    )?;

    let stop = orchestrator.stop_signal();
    ctrlc::set_handler(move || {
        stop.request_stop();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "conduct_monitor running. source={} output={}",
        cfg.source.path,
        cfg.output_dir.display()
    );

    let mut ledger = ViolationLedger::new();
    let summary = {
        let _stage = ui.stage("process stream");
        orchestrator.run(&mut source, &mut detector, &mut ledger)
    };
    if let TerminationReason::SourceReadFailure(e) = &summary.termination {
        log::warn!("stream ended early after a read failure: {}", e);
    }
    let stats = source.stats();
    log::info!(
        "source {} delivered {} frame(s) (healthy={})",
        stats.path,
        stats.frames_captured,
        source.is_healthy()
    );
    for (class, frames) in &summary.detections_by_class {
        log::info!("detected {} in {} sampled frame(s)", class, frames);
    }
    for (class, segments) in ledger.counts_by_class() {
        log::info!("{} segment(s) with {}", segments, class);
    }

    {
        let pending = ledger.pending_ids().len() as u64;
        let stage = ui.counted_stage("attribute segments", pending);
        AttributionPipeline::new(settings.similarity_threshold).resolve_all_with_progress(
            &mut ledger,
            &mut *matcher,
            |done, _| stage.set_position(done as u64),
        );
    }

    {
        let _stage = ui.stage("write report");
        let date = summary
            .first_frame_at
            .unwrap_or_else(Utc::now)
            .date_naive();
        match write_text_report(&ledger, &cfg.output_dir, date)? {
            Some(path) => log::info!("{} violation(s) reported in {}", ledger.len(), path.display()),
            None => log::info!("no violations recorded; no report written"),
        }
        let export = cfg
            .output_dir
            .join(format!("ledger_{}.json", date.format("%Y-%m-%d")));
        write_json_export(&ledger, Some(&summary), &export)?;
    }

    log::info!(
        "conduct_monitor finished ({}): frames={} sampled={} segments={}",
        summary.termination,
        summary.total_frames,
        summary.sampled_frames,
        ledger.len()
    );
    Ok(())
}

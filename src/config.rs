use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::PipelineSettings;

const DEFAULT_OUTPUT_DIR: &str = "monitor_output";
const DEFAULT_SOURCE_PATH: &str = "stub://classroom";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_FRAME_SKIP: u64 = 2;
const DEFAULT_SLEEP_DEBOUNCE_SECS: f64 = 10.0;
const DEFAULT_BUFFER_SECS: f64 = 10.0;
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_FRAMES: u64 = 9000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MonitorConfigFile {
    output_dir: Option<PathBuf>,
    source: Option<SourceConfigFile>,
    detection: Option<DetectionConfigFile>,
    recording: Option<RecordingConfigFile>,
    identity: Option<IdentityConfigFile>,
    limits: Option<LimitsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    path: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    frame_skip: Option<u64>,
    sleep_debounce_secs: Option<f64>,
    schedule_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    buffer_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct IdentityConfigFile {
    similarity_threshold: Option<f32>,
    roster_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LimitsConfigFile {
    max_frames: Option<u64>,
    max_duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub output_dir: PathBuf,
    pub source: SourceSettings,
    pub detection: DetectionSettings,
    pub recording: RecordingSettings,
    pub identity: IdentitySettings,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    /// Local Y4M file or `stub://<name>`.
    pub path: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub frame_skip: u64,
    pub sleep_debounce_secs: f64,
    /// Detection timeline replayed by the schedule detector.
    pub schedule_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSettings {
    pub buffer_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentitySettings {
    pub similarity_threshold: f32,
    /// Student roster; attribution is skipped when unset or missing.
    pub roster_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitSettings {
    pub max_frames: Option<u64>,
    pub max_duration_secs: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            source: SourceSettings {
                path: DEFAULT_SOURCE_PATH.to_string(),
                fps: DEFAULT_SOURCE_FPS,
                width: DEFAULT_SOURCE_WIDTH,
                height: DEFAULT_SOURCE_HEIGHT,
            },
            detection: DetectionSettings {
                frame_skip: DEFAULT_FRAME_SKIP,
                sleep_debounce_secs: DEFAULT_SLEEP_DEBOUNCE_SECS,
                schedule_path: None,
            },
            recording: RecordingSettings {
                buffer_secs: DEFAULT_BUFFER_SECS,
            },
            identity: IdentitySettings {
                similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
                roster_path: None,
            },
            limits: LimitSettings {
                max_frames: Some(DEFAULT_MAX_FRAMES),
                max_duration_secs: None,
            },
        }
    }
}

impl MonitorConfig {
    /// Load from `CONDUCT_CONFIG` (if set), then `CONDUCT_*` overrides, then
    /// validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONDUCT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, then env overrides, then validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let defaults = Self::default();
        let source = file.source.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let identity = file.identity.unwrap_or_default();
        let limits = file.limits.unwrap_or_default();
        Self {
            output_dir: file.output_dir.unwrap_or(defaults.output_dir),
            source: SourceSettings {
                path: source.path.unwrap_or(defaults.source.path),
                fps: source.fps.unwrap_or(defaults.source.fps),
                width: source.width.unwrap_or(defaults.source.width),
                height: source.height.unwrap_or(defaults.source.height),
            },
            detection: DetectionSettings {
                frame_skip: detection.frame_skip.unwrap_or(defaults.detection.frame_skip),
                sleep_debounce_secs: detection
                    .sleep_debounce_secs
                    .unwrap_or(defaults.detection.sleep_debounce_secs),
                schedule_path: detection.schedule_path,
            },
            recording: RecordingSettings {
                buffer_secs: recording
                    .buffer_secs
                    .unwrap_or(defaults.recording.buffer_secs),
            },
            identity: IdentitySettings {
                similarity_threshold: identity
                    .similarity_threshold
                    .unwrap_or(defaults.identity.similarity_threshold),
                roster_path: identity.roster_path,
            },
            limits: LimitSettings {
                max_frames: limits.max_frames.or(defaults.limits.max_frames),
                max_duration_secs: limits.max_duration_secs,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_nonempty("CONDUCT_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_nonempty("CONDUCT_SOURCE") {
            self.source.path = path;
        }
        if let Some(path) = env_nonempty("CONDUCT_SCHEDULE_PATH") {
            self.detection.schedule_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("CONDUCT_ROSTER_PATH") {
            self.identity.roster_path = Some(PathBuf::from(path));
        }
        if let Some(skip) = env_nonempty("CONDUCT_FRAME_SKIP") {
            self.detection.frame_skip = skip
                .parse()
                .map_err(|_| anyhow!("CONDUCT_FRAME_SKIP must be a positive integer"))?;
        }
        if let Some(secs) = env_nonempty("CONDUCT_BUFFER_SECS") {
            self.recording.buffer_secs = secs
                .parse()
                .map_err(|_| anyhow!("CONDUCT_BUFFER_SECS must be a number of seconds"))?;
        }
        if let Some(secs) = env_nonempty("CONDUCT_SLEEP_DEBOUNCE_SECS") {
            self.detection.sleep_debounce_secs = secs
                .parse()
                .map_err(|_| anyhow!("CONDUCT_SLEEP_DEBOUNCE_SECS must be a number of seconds"))?;
        }
        if let Some(threshold) = env_nonempty("CONDUCT_SIMILARITY_THRESHOLD") {
            self.identity.similarity_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("CONDUCT_SIMILARITY_THRESHOLD must be a number in 0..1"))?;
        }
        if let Some(frames) = env_nonempty("CONDUCT_MAX_FRAMES") {
            self.limits.max_frames = Some(
                frames
                    .parse()
                    .map_err(|_| anyhow!("CONDUCT_MAX_FRAMES must be a positive integer"))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("config: output_dir must not be empty"));
        }
        if self.source.path.trim().is_empty() {
            return Err(anyhow!("config: source.path must not be empty"));
        }
        if self.source.fps == 0 {
            return Err(anyhow!("config: source.fps must be at least 1"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("config: source width and height must be at least 1"));
        }
        if !self.recording.buffer_secs.is_finite() || self.recording.buffer_secs <= 0.0 {
            return Err(anyhow!("config: recording.buffer_secs must be greater than zero"));
        }
        if !self.detection.sleep_debounce_secs.is_finite() || self.detection.sleep_debounce_secs < 0.0 {
            return Err(anyhow!("config: detection.sleep_debounce_secs must be zero or more"));
        }
        if let Some(secs) = self.limits.max_duration_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(anyhow!("config: limits.max_duration_secs must be greater than zero"));
            }
        }
        self.pipeline_settings()?.validate()
    }

    /// Core tuning derived from this configuration.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            frame_skip: self.detection.frame_skip,
            buffer: secs_to_duration("recording.buffer_secs", self.recording.buffer_secs)?,
            sleep_debounce: secs_to_duration(
                "detection.sleep_debounce_secs",
                self.detection.sleep_debounce_secs,
            )?,
            similarity_threshold: self.identity.similarity_threshold,
            max_frames: self.limits.max_frames,
            max_duration: self
                .limits
                .max_duration_secs
                .map(|secs| secs_to_duration("limits.max_duration_secs", secs))
                .transpose()?,
        })
    }
}

fn secs_to_duration(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("config: {} is not a valid duration ({})", name, secs))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

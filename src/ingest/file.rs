//! Local file frame source.
//!
//! `FileSource` reads frames from a local YUV4MPEG2 file, any container
//! FFmpeg can decode (`ingest-file-ffmpeg` feature), or synthesizes them for
//! `stub://` paths. The file source is responsible for:
//! - Rejecting URL schemes (no network access)
//! - Decoding frames in-memory to RGB24
//! - Stamping each frame with its media time
//!
//! The file source MUST NOT retain frames after handing them out.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::y4m::Y4mReader;
use super::{frame_time, FrameSource, MAX_DIMENSION};
use crate::frame::{Frame, VideoFormat, RGB_CHANNELS};

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/srv/lessons/room12.y4m") or `stub://<name>`.
    pub path: String,
    /// Frame rate for synthetic sources. File sources use the rate in the
    /// file header.
    pub target_fps: f64,
    /// Synthetic frame size.
    pub width: u32,
    pub height: u32,
    /// Media time of the first frame.
    pub start_at: DateTime<Utc>,
    /// Synthetic sources stop after this many frames; `None` runs forever.
    pub frame_limit: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            target_fps: 10.0,
            width: 640,
            height: 480,
            start_at: Utc::now(),
            frame_limit: None,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    Y4m(Y4mFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let backend = if config.path.starts_with("stub://") {
            FileBackend::Synthetic(SyntheticFileSource::new(config)?)
        } else if is_y4m_path(&config.path) {
            FileBackend::Y4m(Y4mFileSource::new(config)?)
        } else {
            Self::container_backend(config)?
        };
        Ok(Self { backend })
    }

    #[cfg(feature = "ingest-file-ffmpeg")]
    fn container_backend(config: FileConfig) -> Result<FileBackend> {
        Ok(FileBackend::Ffmpeg(FfmpegFileSource::new(config)?))
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    fn container_backend(config: FileConfig) -> Result<FileBackend> {
        Err(anyhow!(
            "{}: only .y4m files are supported without the ingest-file-ffmpeg feature",
            config.path
        ))
    }

    /// Check if the source is healthy.
    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Synthetic(_) => true,
            FileBackend::Y4m(source) => !source.failed,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.is_healthy(),
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> FileStats {
        match &self.backend {
            FileBackend::Synthetic(source) => FileStats {
                frames_captured: source.frame_count,
                path: source.config.path.clone(),
            },
            FileBackend::Y4m(source) => FileStats {
                frames_captured: source.frame_count,
                path: source.config.path.clone(),
            },
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

impl FrameSource for FileSource {
    fn format(&self) -> VideoFormat {
        match &self.backend {
            FileBackend::Synthetic(source) => source.format,
            FileBackend::Y4m(source) => source.format,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.format(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            FileBackend::Y4m(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }
}

/// Statistics for a file source.
#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_captured: u64,
    pub path: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    config: FileConfig,
    format: VideoFormat,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticFileSource {
    fn new(config: FileConfig) -> Result<Self> {
        if config.width == 0
            || config.height == 0
            || config.width > MAX_DIMENSION
            || config.height > MAX_DIMENSION
        {
            return Err(anyhow!(
                "synthetic source frame size must be within 1..={}",
                MAX_DIMENSION
            ));
        }
        if !config.target_fps.is_finite() || config.target_fps <= 0.0 {
            return Err(anyhow!("synthetic source needs a positive frame rate"));
        }
        log::info!("FileSource: connected to {} (synthetic)", config.path);
        Ok(Self {
            format: VideoFormat::new(config.width, config.height, config.target_fps),
            config,
            frame_count: 0,
            scene_state: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.config.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        let index = self.frame_count;
        self.frame_count += 1;
        let captured_at = frame_time(self.config.start_at, index, self.format.fps);
        let pixels = self.generate_synthetic_pixels();
        Frame::from_rgb(pixels, self.format.width, self.format.height, captured_at, index)
            .map(Some)
            .ok_or_else(|| anyhow!("{}: synthetic frame has the wrong size", self.config.path))
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count =
            self.config.width as usize * self.config.height as usize * RGB_CHANNELS;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / RGB_CHANNELS as u64 + self.frame_count + self.scene_state as u64)
                % 256) as u8;
        }
        pixels
    }
}

// ----------------------------------------------------------------------------
// YUV4MPEG2 file source
// ----------------------------------------------------------------------------

struct Y4mFileSource {
    config: FileConfig,
    reader: Y4mReader,
    format: VideoFormat,
    frame_count: u64,
    failed: bool,
}

impl Y4mFileSource {
    fn new(config: FileConfig) -> Result<Self> {
        let reader = Y4mReader::open(std::path::Path::new(&config.path))?;
        let header = reader.header();
        let format = VideoFormat::new(header.width, header.height, header.fps);
        log::info!(
            "FileSource: opened {} ({}x{} @ {:.2} fps)",
            config.path,
            format.width,
            format.height,
            format.fps
        );
        Ok(Self {
            config,
            reader,
            format,
            frame_count: 0,
            failed: false,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let pixels = match self.reader.read_rgb() {
            Ok(Some(pixels)) => pixels,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };
        let index = self.frame_count;
        self.frame_count += 1;
        let captured_at = frame_time(self.config.start_at, index, self.format.fps);
        Frame::from_rgb(pixels, self.format.width, self.format.height, captured_at, index)
            .map(Some)
            .ok_or_else(|| anyhow!("{}: decoded frame has the wrong size", self.config.path))
    }
}

fn is_y4m_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("y4m"))
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SegmentSink, SegmentWriter, Y4mSink};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap()
    }

    #[test]
    fn rejects_urls_and_empty_paths() {
        for path in ["", "  ", "rtsp://cam/stream", "http://host/video.y4m"] {
            let config = FileConfig {
                path: path.to_string(),
                ..FileConfig::default()
            };
            assert!(FileSource::new(config).is_err(), "{path}");
        }
    }

    #[test]
    fn synthetic_source_stops_at_limit_with_media_time() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://room".to_string(),
            target_fps: 4.0,
            width: 8,
            height: 6,
            start_at: start(),
            frame_limit: Some(3),
        })
        .unwrap();
        assert_eq!(source.format(), VideoFormat::new(8, 6, 4.0));
        let mut times = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.pixels().len(), 8 * 6 * 3);
            times.push(frame.captured_at);
        }
        assert_eq!(
            times,
            vec![
                start(),
                start() + chrono::Duration::milliseconds(250),
                start() + chrono::Duration::milliseconds(500)
            ]
        );
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[test]
    fn reads_back_recorded_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.y4m");
        let format = VideoFormat::new(4, 2, 5.0);
        let mut writer = Y4mSink::new().open(&path, format).unwrap();
        for i in 0..2 {
            let mut frame = Frame::blank(4, 2, start(), i);
            frame.set_pixel(0, 0, [200, 200, 200]);
            writer.write(&frame).unwrap();
        }
        writer.finish().unwrap();

        let mut source = FileSource::new(FileConfig {
            path: path.display().to_string(),
            start_at: start(),
            ..FileConfig::default()
        })
        .unwrap();
        assert_eq!(source.format(), format);
        let first = source.next_frame().unwrap().unwrap();
        let [r, g, b] = first.pixel(0, 0).unwrap();
        for c in [r, g, b] {
            assert!((c as i16 - 200).abs() <= 1, "{c}");
        }
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.captured_at, start() + chrono::Duration::milliseconds(200));
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.is_healthy());
    }

    #[test]
    fn oversized_file_header_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostile.y4m");
        std::fs::write(
            &path,
            b"YUV4MPEG2 W4294967295 H4294967295 F10:1 C444\nFRAME\n",
        )
        .unwrap();
        let opened = std::panic::catch_unwind(|| {
            FileSource::new(FileConfig {
                path: path.display().to_string(),
                ..FileConfig::default()
            })
            .is_ok()
        });
        assert_eq!(opened.ok(), Some(false));
    }

    #[test]
    fn synthetic_size_mismatch_is_a_read_error() {
        let mut source = SyntheticFileSource::new(FileConfig {
            path: "stub://room".to_string(),
            width: 4,
            height: 4,
            ..FileConfig::default()
        })
        .unwrap();
        assert!(source.next_frame().unwrap().is_some());
        source.config.width = 3;
        assert!(source.next_frame().is_err());
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn container_files_need_ffmpeg_feature() {
        let err = FileSource::new(FileConfig {
            path: "/srv/lessons/room12.mp4".to_string(),
            ..FileConfig::default()
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("ingest-file-ffmpeg"), "{err}");
    }
}

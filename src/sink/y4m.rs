use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use yuv::{
    YuvChromaSubsampling, YuvConversionMode, YuvPlanarImageMut, YuvRange, YuvStandardMatrix,
};

use super::{SegmentArtifact, SegmentSink, SegmentWriter};
use crate::frame::{Frame, VideoFormat, RGB_CHANNELS};

pub const Y4M_EXTENSION: &str = "y4m";

/// Colour model of every Y4M segment this crate writes and reads.
pub(crate) const COLOR_RANGE: YuvRange = YuvRange::Full;
pub(crate) const COLOR_MATRIX: YuvStandardMatrix = YuvStandardMatrix::Bt601;

/// Writes each segment as a full-range 4:4:4 YUV4MPEG2 file.
#[derive(Clone, Debug, Default)]
pub struct Y4mSink;

impl Y4mSink {
    pub fn new() -> Self {
        Self
    }
}

impl SegmentSink for Y4mSink {
    fn extension(&self) -> &'static str {
        Y4M_EXTENSION
    }

    fn open(&mut self, path: &Path, format: VideoFormat) -> Result<Box<dyn SegmentWriter>> {
        if format.width == 0 || format.height == 0 {
            return Err(anyhow!("y4m: frame size must be non-zero"));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("y4m: create directory {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("y4m: create {}", path.display()))?;
        let sync_handle = file
            .try_clone()
            .with_context(|| format!("y4m: clone handle for {}", path.display()))?;
        let (num, den) = fps_fraction(format.fps);
        let encoder = y4m::encode(
            format.width as usize,
            format.height as usize,
            y4m::Ratio::new(num, den),
        )
        .with_colorspace(y4m::Colorspace::C444)
        .write_header(file)
        .map_err(|e| anyhow!("y4m: write header to {}: {:?}", path.display(), e))?;
        Ok(Box::new(Y4mWriter {
            path: path.to_path_buf(),
            encoder,
            sync_handle,
            format,
            frames_written: 0,
            planes: YuvPlanarImageMut::alloc(
                format.width,
                format.height,
                YuvChromaSubsampling::Yuv444,
            ),
        }))
    }
}

struct Y4mWriter {
    path: PathBuf,
    encoder: y4m::Encoder<File>,
    sync_handle: File,
    format: VideoFormat,
    frames_written: u64,
    planes: YuvPlanarImageMut<'static, u8>,
}

impl SegmentWriter for Y4mWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.format.width || frame.height != self.format.height {
            return Err(anyhow!(
                "y4m: frame is {}x{}, segment is {}x{}",
                frame.width,
                frame.height,
                self.format.width,
                self.format.height
            ));
        }
        yuv::rgb_to_yuv444(
            &mut self.planes,
            frame.pixels(),
            frame.width * RGB_CHANNELS as u32,
            COLOR_RANGE,
            COLOR_MATRIX,
            YuvConversionMode::Balanced,
        )
        .map_err(|e| anyhow!("y4m: convert frame {}: {:?}", frame.index, e))?;
        let planes = [
            self.planes.y_plane.borrow(),
            self.planes.u_plane.borrow(),
            self.planes.v_plane.borrow(),
        ];
        self.encoder
            .write_frame(&y4m::Frame::new(planes, None))
            .map_err(|e| anyhow!("y4m: write {}: {:?}", self.path.display(), e))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SegmentArtifact> {
        let Y4mWriter {
            path,
            encoder,
            sync_handle,
            frames_written,
            ..
        } = *self;
        drop(encoder);
        sync_handle
            .sync_all()
            .with_context(|| format!("y4m: sync {}", path.display()))?;
        Ok(SegmentArtifact {
            frames_written,
            sha256: Some(file_sha256(&path)?),
        })
    }
}

/// Hex SHA-256 of a finished segment file.
pub(crate) fn file_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("digest: open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut BufReader::new(file), &mut hasher)
        .with_context(|| format!("digest: read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

fn fps_fraction(fps: f64) -> (usize, usize) {
    if !fps.is_finite() || fps <= 0.0 {
        return (25, 1);
    }
    if (fps - fps.round()).abs() < 1e-6 {
        return (fps.round() as usize, 1);
    }
    ((fps * 1000.0).round() as usize, 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn writes_header_frames_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segments").join("seg.y4m");
        let mut sink = Y4mSink::new();
        let mut writer = sink.open(&path, VideoFormat::new(2, 2, 10.0)).unwrap();
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        writer.write(&Frame::blank(2, 2, t, 0)).unwrap();
        writer.write(&Frame::blank(2, 2, t, 1)).unwrap();
        let artifact = writer.finish().unwrap();
        assert_eq!(artifact.frames_written, 2);

        let bytes = std::fs::read(&path).unwrap();
        let header_end = bytes.iter().position(|b| *b == b'\n').unwrap() + 1;
        let header = String::from_utf8_lossy(&bytes[..header_end]).to_string();
        assert!(header.starts_with("YUV4MPEG2 W2 H2 F10:1"), "{header}");
        assert!(header.contains("C444"), "{header}");
        assert_eq!(bytes.len(), header_end + 2 * (6 + 12));
        assert_eq!(
            artifact.sha256.as_deref(),
            Some(hex::encode(Sha256::digest(&bytes)).as_str())
        );
    }

    #[test]
    fn rejects_mismatched_frame_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Y4mSink::new();
        let mut writer = sink
            .open(&dir.path().join("a.y4m"), VideoFormat::new(4, 4, 10.0))
            .unwrap();
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(writer.write(&Frame::blank(2, 2, t, 0)).is_err());
    }

    #[test]
    fn fractional_rates_keep_precision() {
        assert_eq!(fps_fraction(30.0), (30, 1));
        assert_eq!(fps_fraction(29.97), (29970, 1000));
        assert_eq!(fps_fraction(0.0), (25, 1));
    }
}

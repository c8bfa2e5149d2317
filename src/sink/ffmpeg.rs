//! MPEG-4 segment writer using FFmpeg.
//!
//! Frames are scaled from RGB24 to YUV420P in-memory and encoded into an mp4
//! container. The digest is taken over the finished file.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{file_sha256, SegmentArtifact, SegmentSink, SegmentWriter};
use crate::frame::{Frame, VideoFormat, RGB_CHANNELS};

pub const MP4_EXTENSION: &str = "mp4";

/// Writes each segment as an MPEG-4 Part 2 mp4 file.
#[derive(Clone, Debug, Default)]
pub struct FfmpegSink;

impl FfmpegSink {
    pub fn new() -> Self {
        Self
    }
}

impl SegmentSink for FfmpegSink {
    fn extension(&self) -> &'static str {
        MP4_EXTENSION
    }

    fn open(&mut self, path: &Path, format: VideoFormat) -> Result<Box<dyn SegmentWriter>> {
        if format.width == 0 || format.height == 0 || format.width % 2 != 0 || format.height % 2 != 0
        {
            return Err(anyhow!(
                "ffmpeg: frame size {}x{} must be non-zero and even",
                format.width,
                format.height
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("ffmpeg: create directory {}", parent.display()))?;
        }
        Ok(Box::new(FfmpegWriter::open(path, format)?))
    }
}

struct FfmpegWriter {
    path: PathBuf,
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    format: VideoFormat,
    frames_written: u64,
}

impl FfmpegWriter {
    fn open(path: &Path, format: VideoFormat) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("ffmpeg: open output {}", path.display()))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg: MPEG-4 encoder not available"))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let fps = frame_rate(format.fps);
        let encoder_time_base = fps.invert();
        let mut stream = output.add_stream(codec).context("ffmpeg: add video stream")?;
        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("ffmpeg: create video encoder")?;
        encoder.set_width(format.width);
        encoder.set_height(format.height);
        encoder.set_format(ffmpeg::format::Pixel::YUV420P);
        encoder.set_time_base(encoder_time_base);
        encoder.set_frame_rate(Some(fps));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder
            .open_as(codec)
            .context("ffmpeg: open MPEG-4 encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);
        let stream_index = stream.index();

        output
            .write_header()
            .with_context(|| format!("ffmpeg: write header to {}", path.display()))?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .ok_or_else(|| anyhow!("ffmpeg: output stream disappeared"))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            ffmpeg::format::Pixel::RGB24,
            format.width,
            format.height,
            ffmpeg::format::Pixel::YUV420P,
            format.width,
            format.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("ffmpeg: create scaler")?;

        Ok(Self {
            path: path.to_path_buf(),
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            format,
            frames_written: 0,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .with_context(|| format!("ffmpeg: write packet to {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl SegmentWriter for FfmpegWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.format.width || frame.height != self.format.height {
            return Err(anyhow!(
                "ffmpeg: frame is {}x{}, segment is {}x{}",
                frame.width,
                frame.height,
                self.format.width,
                self.format.height
            ));
        }
        let mut rgb = ffmpeg::frame::Video::new(
            ffmpeg::format::Pixel::RGB24,
            frame.width,
            frame.height,
        );
        let row_bytes = frame.width as usize * RGB_CHANNELS;
        let stride = rgb.stride(0);
        let data = rgb.data_mut(0);
        for (row, src) in frame.pixels().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            data.get_mut(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?
                .copy_from_slice(src);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .context("scale frame to YUV420P")?;
        yuv.set_pts(Some(self.frames_written as i64));
        self.encoder
            .send_frame(&yuv)
            .context("send frame to ffmpeg encoder")?;
        self.drain_packets()?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<SegmentArtifact> {
        self.encoder.send_eof().context("flush ffmpeg encoder")?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .with_context(|| format!("ffmpeg: write trailer to {}", self.path.display()))?;
        let FfmpegWriter {
            path,
            output,
            frames_written,
            ..
        } = *self;
        drop(output);
        Ok(SegmentArtifact {
            frames_written,
            sha256: Some(file_sha256(&path)?),
        })
    }
}

fn frame_rate(fps: f64) -> ffmpeg::Rational {
    if !fps.is_finite() || fps <= 0.0 {
        return ffmpeg::Rational::new(25, 1);
    }
    if (fps - fps.round()).abs() < 1e-6 {
        return ffmpeg::Rational::new(fps.round() as i32, 1);
    }
    ffmpeg::Rational::new((fps * 1000.0).round() as i32, 1000)
}

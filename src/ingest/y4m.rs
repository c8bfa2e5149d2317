use std::fs::File;
use std::io::{BufRead, BufReader, Chain, Cursor, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use yuv::{YuvGrayImage, YuvPlanarImage};

use super::MAX_DIMENSION;
use crate::frame::RGB_CHANNELS;
use crate::sink::{COLOR_MATRIX, COLOR_RANGE};

/// Longest stream header accepted before the first frame.
const MAX_HEADER_LEN: u64 = 1024;

/// Chroma layouts the reader understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Chroma {
    C444,
    C422,
    C420,
    Mono,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub chroma: Chroma,
}

type HeaderedInput = Chain<Cursor<Vec<u8>>, BufReader<File>>;

/// Sequential YUV4MPEG2 decoder producing RGB24 buffers.
pub(crate) struct Y4mReader {
    path: PathBuf,
    decoder: y4m::Decoder<HeaderedInput>,
    header: Y4mHeader,
}

impl Y4mReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut input = BufReader::new(file);
        let mut header_line = Vec::new();
        (&mut input)
            .take(MAX_HEADER_LEN)
            .read_until(b'\n', &mut header_line)
            .with_context(|| format!("read header of {}", path.display()))?;
        check_frame_size(&header_line)
            .with_context(|| format!("parse header of {}", path.display()))?;

        let decoder = y4m::decode(Cursor::new(header_line).chain(input))
            .map_err(|e| anyhow!("parse header of {}: {:?}", path.display(), e))?;
        let chroma = match decoder.get_colorspace() {
            y4m::Colorspace::C444 => Chroma::C444,
            y4m::Colorspace::C422 => Chroma::C422,
            y4m::Colorspace::C420
            | y4m::Colorspace::C420jpeg
            | y4m::Colorspace::C420paldv
            | y4m::Colorspace::C420mpeg2 => Chroma::C420,
            y4m::Colorspace::Cmono => Chroma::Mono,
            other => {
                return Err(anyhow!(
                    "{}: unsupported y4m colorspace {:?}",
                    path.display(),
                    other
                ))
            }
        };
        let rate = decoder.get_framerate();
        let fps = if rate.num > 0 && rate.den > 0 {
            rate.num as f64 / rate.den as f64
        } else {
            25.0
        };
        let header = Y4mHeader {
            width: u32::try_from(decoder.get_width())?,
            height: u32::try_from(decoder.get_height())?,
            fps,
            chroma,
        };
        Ok(Self {
            path: path.to_path_buf(),
            decoder,
            header,
        })
    }

    pub fn header(&self) -> Y4mHeader {
        self.header
    }

    /// Next frame as RGB24, `None` at the end of the stream.
    pub fn read_rgb(&mut self) -> Result<Option<Vec<u8>>> {
        let header = self.header;
        let frame = match self.decoder.read_frame() {
            Ok(frame) => frame,
            Err(y4m::Error::EOF) => return Ok(None),
            Err(e) => return Err(anyhow!("{}: read frame: {:?}", self.path.display(), e)),
        };
        let (w, h) = (header.width, header.height);
        let stride = w * RGB_CHANNELS as u32;
        let mut rgb = vec![0u8; w as usize * h as usize * RGB_CHANNELS];
        let converted = match header.chroma {
            Chroma::Mono => yuv::yuv400_to_rgb(
                &YuvGrayImage {
                    y_plane: frame.get_y_plane(),
                    y_stride: w,
                    width: w,
                    height: h,
                },
                &mut rgb,
                stride,
                COLOR_RANGE,
                COLOR_MATRIX,
            ),
            chroma => {
                let chroma_stride = if chroma == Chroma::C444 { w } else { w.div_ceil(2) };
                let planar = YuvPlanarImage {
                    y_plane: frame.get_y_plane(),
                    y_stride: w,
                    u_plane: frame.get_u_plane(),
                    u_stride: chroma_stride,
                    v_plane: frame.get_v_plane(),
                    v_stride: chroma_stride,
                    width: w,
                    height: h,
                };
                match chroma {
                    Chroma::C444 => {
                        yuv::yuv444_to_rgb(&planar, &mut rgb, stride, COLOR_RANGE, COLOR_MATRIX)
                    }
                    Chroma::C422 => {
                        yuv::yuv422_to_rgb(&planar, &mut rgb, stride, COLOR_RANGE, COLOR_MATRIX)
                    }
                    _ => yuv::yuv420_to_rgb(&planar, &mut rgb, stride, COLOR_RANGE, COLOR_MATRIX),
                }
            }
        };
        converted.map_err(|e| anyhow!("{}: convert frame: {:?}", self.path.display(), e))?;
        Ok(Some(rgb))
    }
}

/// Reject `W`/`H` header fields outside `1..=MAX_DIMENSION` before any frame
/// buffer is sized from them.
fn check_frame_size(header_line: &[u8]) -> Result<()> {
    for token in header_line.split(|b| b.is_ascii_whitespace()) {
        let Some((&tag, digits)) = token.split_first() else {
            continue;
        };
        if tag != b'W' && tag != b'H' {
            continue;
        }
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<u64>().ok());
        match value {
            Some(v) if v > 0 && v <= u64::from(MAX_DIMENSION) => {}
            _ => {
                return Err(anyhow!(
                    "y4m frame {} {} is outside 1..={}",
                    if tag == b'W' { "width" } else { "height" },
                    String::from_utf8_lossy(digits),
                    MAX_DIMENSION
                ))
            }
        }
    }
    Ok(())
}

use bytes::Bytes;

use crate::{
    error::ConvertError,
    frame::{PixelBuffer, PixelFormat, Plane, PreviewFormat, VideoFrame},
    stream::VideoParams,
    timebase::MILLIS,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ContextKey {
    width: u32,
    height: u32,
    format: PixelFormat,
}

enum Context {
    Software,
    #[cfg(feature = "ffmpeg")]
    Sws(crate::ffmpeg::scaler::SwsConverter),
}

/// Converts decoded pictures to packed 32-bit RGB at their own size.
///
/// The conversion context is keyed on (width, height, pixel format) and rebuilt whenever
/// an incoming frame differs, so mid-stream resolution or format changes are picked up.
pub struct VideoConverter {
    target: PreviewFormat,
    key: Option<ContextKey>,
    context: Option<Context>,
    rebuilds: u64,
    dropped: u64,
}

impl VideoConverter {
    pub fn new(target: PreviewFormat) -> Self {
        Self {
            target,
            key: None,
            context: None,
            rebuilds: 0,
            dropped: 0,
        }
    }

    pub fn target(&self) -> PreviewFormat {
        self.target
    }

    /// Times a context has been (re)built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Frames dropped because no context could be built or the frame was unusable.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Builds the context for the stream's announced geometry ahead of the first frame.
    pub fn prime(&mut self, params: &VideoParams) -> Result<(), ConvertError> {
        self.ensure(ContextKey {
            width: params.width,
            height: params.height,
            format: params.pixel_format,
        })
    }

    pub fn convert(&mut self, frame: &VideoFrame) -> Result<PixelBuffer, ConvertError> {
        let result = self.try_convert(frame);
        if result.is_err() {
            self.dropped += 1;
        }
        result
    }

    fn try_convert(&mut self, frame: &VideoFrame) -> Result<PixelBuffer, ConvertError> {
        self.ensure(ContextKey {
            width: frame.width,
            height: frame.height,
            format: frame.format,
        })?;

        let data = match self.context.as_mut() {
            Some(Context::Software) => software_convert(frame, self.target)?,
            #[cfg(feature = "ffmpeg")]
            Some(Context::Sws(sws)) => sws.run(frame)?,
            None => {
                return Err(ConvertError::Unsupported(format!(
                    "pixel format {:?}",
                    frame.format
                )));
            }
        };

        Ok(PixelBuffer {
            width: frame.width,
            height: frame.height,
            format: self.target,
            data,
            pts_ms: frame.pts.map(|pts| crate::timebase::rescale(pts, frame.time_base, MILLIS)),
        })
    }

    fn ensure(&mut self, key: ContextKey) -> Result<(), ConvertError> {
        if self.key == Some(key) && self.context.is_some() {
            return Ok(());
        }
        self.key = Some(key);
        self.context = None;

        if key.width == 0 || key.height == 0 {
            return Err(ConvertError::InvalidGeometry(format!("{}x{}", key.width, key.height)));
        }

        let context = if is_software_format(key.format) {
            Context::Software
        } else {
            self.fallback(key)?
        };
        log::debug!(
            "video converter context {}x{} {:?} -> {:?}",
            key.width,
            key.height,
            key.format,
            self.target
        );
        self.context = Some(context);
        self.rebuilds += 1;
        Ok(())
    }

    #[cfg(feature = "ffmpeg")]
    fn fallback(&self, key: ContextKey) -> Result<Context, ConvertError> {
        crate::ffmpeg::scaler::SwsConverter::new(key.width, key.height, key.format, self.target)
            .map(Context::Sws)
    }

    #[cfg(not(feature = "ffmpeg"))]
    fn fallback(&self, key: ContextKey) -> Result<Context, ConvertError> {
        Err(ConvertError::Unsupported(format!("pixel format {:?}", key.format)))
    }
}

fn is_software_format(format: PixelFormat) -> bool {
    matches!(
        format,
        PixelFormat::Yuv420p
            | PixelFormat::Yuvj420p
            | PixelFormat::Nv12
            | PixelFormat::Yuv422p
            | PixelFormat::Yuv444p
            | PixelFormat::Rgb24
            | PixelFormat::Rgba
            | PixelFormat::Bgra
    )
}

fn plane<'a>(
    frame: &'a VideoFrame,
    index: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<&'a Plane, ConvertError> {
    let plane = frame.planes.get(index).ok_or(ConvertError::ShortPlane {
        plane: index,
        len: 0,
        expected: row_bytes * rows,
    })?;
    if plane.stride < row_bytes {
        return Err(ConvertError::InvalidGeometry(format!(
            "plane {} stride {} < {}",
            index, plane.stride, row_bytes
        )));
    }
    let expected = plane.stride * (rows - 1) + row_bytes;
    if plane.data.len() < expected {
        return Err(ConvertError::ShortPlane {
            plane: index,
            len: plane.data.len(),
            expected,
        });
    }
    Ok(plane)
}

#[inline]
fn put(out: &mut Vec<u8>, target: PreviewFormat, r: u8, g: u8, b: u8) {
    match target {
        PreviewFormat::Rgba => out.extend_from_slice(&[r, g, b, 255]),
        PreviewFormat::Bgra => out.extend_from_slice(&[b, g, r, 255]),
    }
}

// BT.601, full swing luma
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    (r, g, b)
}

fn software_convert(frame: &VideoFrame, target: PreviewFormat) -> Result<Bytes, ConvertError> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let mut out = Vec::with_capacity(width * height * 4);

    match frame.format {
        PixelFormat::Yuv420p
        | PixelFormat::Yuvj420p
        | PixelFormat::Yuv422p
        | PixelFormat::Yuv444p => {
            // chroma subsampling shifts (x, y)
            let (sx, sy) = match frame.format {
                PixelFormat::Yuv422p => (1, 0),
                PixelFormat::Yuv444p => (0, 0),
                _ => (1, 1),
            };
            let cw = (width + (1 << sx) - 1) >> sx;
            let ch = (height + (1 << sy) - 1) >> sy;
            let yp = plane(frame, 0, width, height)?;
            let up = plane(frame, 1, cw, ch)?;
            let vp = plane(frame, 2, cw, ch)?;
            for j in 0..height {
                let yrow = &yp.data[j * yp.stride..];
                let urow = &up.data[(j >> sy) * up.stride..];
                let vrow = &vp.data[(j >> sy) * vp.stride..];
                for i in 0..width {
                    let (r, g, b) = yuv_to_rgb(yrow[i], urow[i >> sx], vrow[i >> sx]);
                    put(&mut out, target, r, g, b);
                }
            }
        }
        PixelFormat::Nv12 => {
            let cw = width.div_ceil(2);
            let ch = height.div_ceil(2);
            let yp = plane(frame, 0, width, height)?;
            let uv = plane(frame, 1, cw * 2, ch)?;
            for j in 0..height {
                let yrow = &yp.data[j * yp.stride..];
                let uvrow = &uv.data[(j >> 1) * uv.stride..];
                for i in 0..width {
                    let c = (i >> 1) * 2;
                    let (r, g, b) = yuv_to_rgb(yrow[i], uvrow[c], uvrow[c + 1]);
                    put(&mut out, target, r, g, b);
                }
            }
        }
        PixelFormat::Rgb24 => {
            let p = plane(frame, 0, width * 3, height)?;
            for j in 0..height {
                let row = &p.data[j * p.stride..j * p.stride + width * 3];
                for px in row.chunks_exact(3) {
                    put(&mut out, target, px[0], px[1], px[2]);
                }
            }
        }
        PixelFormat::Rgba | PixelFormat::Bgra => {
            let p = plane(frame, 0, width * 4, height)?;
            let swap = (frame.format == PixelFormat::Rgba) != (target == PreviewFormat::Rgba);
            for j in 0..height {
                let row = &p.data[j * p.stride..j * p.stride + width * 4];
                if swap {
                    for px in row.chunks_exact(4) {
                        out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                    }
                } else {
                    out.extend_from_slice(row);
                }
            }
        }
        other => return Err(ConvertError::Unsupported(format!("pixel format {:?}", other))),
    }

    Ok(Bytes::from(out))
}

use bytes::Bytes;
use ffmpeg_next::{
    format::Pixel,
    software::scaling::{Context, flag::Flags},
};

use crate::{
    error::ConvertError,
    frame::{PixelFormat, PreviewFormat, VideoFrame},
};

/// swscale context for pixel formats without a built-in converter. Same size in and out.
pub struct SwsConverter {
    context: Context,
    source: Pixel,
    destination: ffmpeg_next::frame::Video,
}

unsafe impl Send for SwsConverter {}

impl SwsConverter {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        target: PreviewFormat,
    ) -> Result<Self, ConvertError> {
        let source = super::pixel_to_ffmpeg(format)
            .ok_or_else(|| ConvertError::Unsupported(format!("pixel format {:?}", format)))?;
        let target = match target {
            PreviewFormat::Rgba => Pixel::RGBA,
            PreviewFormat::Bgra => Pixel::BGRA,
        };
        let context = Context::get(source, width, height, target, width, height, Flags::BILINEAR)
            .map_err(|e| ConvertError::Backend(e.to_string()))?;
        Ok(Self {
            context,
            source,
            destination: ffmpeg_next::frame::Video::new(target, width, height),
        })
    }

    /// Packed output without row padding.
    pub fn run(&mut self, frame: &VideoFrame) -> Result<Bytes, ConvertError> {
        let mut input = ffmpeg_next::frame::Video::new(self.source, frame.width, frame.height);
        if input.planes() > frame.planes.len() {
            return Err(ConvertError::ShortPlane {
                plane: frame.planes.len(),
                len: 0,
                expected: 1,
            });
        }
        for i in 0..input.planes() {
            let src = &frame.planes[i];
            let dst_stride = input.stride(i);
            let rows = input.data(i).len() / dst_stride.max(1);
            let row_bytes = dst_stride.min(src.stride);
            let dst = input.data_mut(i);
            for row in 0..rows {
                let from = row * src.stride;
                if from + row_bytes > src.data.len() {
                    return Err(ConvertError::ShortPlane {
                        plane: i,
                        len: src.data.len(),
                        expected: from + row_bytes,
                    });
                }
                let to = row * dst_stride;
                dst[to..to + row_bytes].copy_from_slice(&src.data[from..from + row_bytes]);
            }
        }

        self.context
            .run(&input, &mut self.destination)
            .map_err(|e| ConvertError::Backend(e.to_string()))?;

        let width = frame.width as usize * 4;
        let stride = self.destination.stride(0);
        let data = self.destination.data(0);
        let mut out = Vec::with_capacity(width * frame.height as usize);
        for row in 0..frame.height as usize {
            out.extend_from_slice(&data[row * stride..row * stride + width]);
        }
        Ok(Bytes::from(out))
    }
}

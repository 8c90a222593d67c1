//! FFmpeg-backed demuxer, muxer, decoders and fallback pixel conversion.

use std::path::Path;

use ffmpeg_next::{
    ffi::{AVPixelFormat, AVSampleFormat},
    format::{Pixel, Sample, sample::Type as SampleType},
};

use crate::{
    backend::MediaBackend,
    error::{PipelineError, Result},
    frame::{PixelFormat, SampleFormat, SampleLayout},
    source::SourceOptions,
    stream::StreamDescriptor,
};

pub mod decoder;
pub mod input;
pub mod output;
pub mod scaler;

pub use decoder::FfmpegDecoder;
pub use input::FfmpegSource;
pub use output::FfmpegWriter;

/// Initializes FFmpeg and its network layer. Call once before opening anything.
pub fn init() -> Result<()> {
    ffmpeg_next::init().map_err(|e| PipelineError::InvalidConfig(format!("ffmpeg init: {}", e)))?;
    ffmpeg_next::format::network::init();
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    type Source = FfmpegSource;
    type Writer = FfmpegWriter;
    type Decoder = FfmpegDecoder;

    fn open_source(&self, url: &str, options: &SourceOptions) -> Result<FfmpegSource> {
        FfmpegSource::open(url, options)
    }

    fn create_output(&self, path: &Path, source: &FfmpegSource) -> Result<FfmpegWriter> {
        FfmpegWriter::create(path, source)
    }

    fn open_decoder(
        &self,
        source: &FfmpegSource,
        stream: &StreamDescriptor,
    ) -> Result<FfmpegDecoder> {
        let parameters = source.parameters(stream.index()).ok_or_else(|| {
            PipelineError::DecoderOpenFailed {
                codec: stream.codec().to_string(),
                reason: format!("no codec parameters for stream {}", stream.index()),
            }
        })?;
        FfmpegDecoder::open(stream, parameters)
    }
}

pub(crate) fn pixel_format(raw: i32) -> PixelFormat {
    match raw {
        x if x == AVPixelFormat::AV_PIX_FMT_YUV420P as i32 => PixelFormat::Yuv420p,
        x if x == AVPixelFormat::AV_PIX_FMT_YUVJ420P as i32 => PixelFormat::Yuvj420p,
        x if x == AVPixelFormat::AV_PIX_FMT_NV12 as i32 => PixelFormat::Nv12,
        x if x == AVPixelFormat::AV_PIX_FMT_YUV422P as i32 => PixelFormat::Yuv422p,
        x if x == AVPixelFormat::AV_PIX_FMT_YUV444P as i32 => PixelFormat::Yuv444p,
        x if x == AVPixelFormat::AV_PIX_FMT_RGB24 as i32 => PixelFormat::Rgb24,
        x if x == AVPixelFormat::AV_PIX_FMT_RGBA as i32 => PixelFormat::Rgba,
        x if x == AVPixelFormat::AV_PIX_FMT_BGRA as i32 => PixelFormat::Bgra,
        other => PixelFormat::Other(other),
    }
}

pub(crate) fn pixel_from_ffmpeg(pixel: Pixel) -> PixelFormat {
    pixel_format(AVPixelFormat::from(pixel) as i32)
}

pub(crate) fn pixel_to_ffmpeg(format: PixelFormat) -> Option<Pixel> {
    let pixel = match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Yuvj420p => Pixel::YUVJ420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Yuv422p => Pixel::YUV422P,
        PixelFormat::Yuv444p => Pixel::YUV444P,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Other(raw) => {
            if raw < 0 || raw >= AVPixelFormat::AV_PIX_FMT_NB as i32 {
                return None;
            }
            // raw came from FFmpeg itself and is within the enum range
            Pixel::from(unsafe { std::mem::transmute::<i32, AVPixelFormat>(raw) })
        }
    };
    Some(pixel)
}

pub(crate) fn sample_format(raw: i32) -> SampleFormat {
    use AVSampleFormat::*;
    let (format, layout) = match raw {
        x if x == AV_SAMPLE_FMT_U8 as i32 => (0, SampleLayout::Packed),
        x if x == AV_SAMPLE_FMT_S16 as i32 => (1, SampleLayout::Packed),
        x if x == AV_SAMPLE_FMT_S32 as i32 => (2, SampleLayout::Packed),
        x if x == AV_SAMPLE_FMT_FLT as i32 => (3, SampleLayout::Packed),
        x if x == AV_SAMPLE_FMT_DBL as i32 => (4, SampleLayout::Packed),
        x if x == AV_SAMPLE_FMT_U8P as i32 => (0, SampleLayout::Planar),
        x if x == AV_SAMPLE_FMT_S16P as i32 => (1, SampleLayout::Planar),
        x if x == AV_SAMPLE_FMT_S32P as i32 => (2, SampleLayout::Planar),
        x if x == AV_SAMPLE_FMT_FLTP as i32 => (3, SampleLayout::Planar),
        x if x == AV_SAMPLE_FMT_DBLP as i32 => (4, SampleLayout::Planar),
        other => return SampleFormat::Other(other),
    };
    match format {
        0 => SampleFormat::U8(layout),
        1 => SampleFormat::I16(layout),
        2 => SampleFormat::I32(layout),
        3 => SampleFormat::F32(layout),
        _ => SampleFormat::F64(layout),
    }
}

pub(crate) fn sample_from_ffmpeg(sample: Sample) -> SampleFormat {
    let layout = |t: SampleType| match t {
        SampleType::Packed => SampleLayout::Packed,
        SampleType::Planar => SampleLayout::Planar,
    };
    match sample {
        Sample::U8(t) => SampleFormat::U8(layout(t)),
        Sample::I16(t) => SampleFormat::I16(layout(t)),
        Sample::I32(t) => SampleFormat::I32(layout(t)),
        Sample::F32(t) => SampleFormat::F32(layout(t)),
        Sample::F64(t) => SampleFormat::F64(layout(t)),
        other => SampleFormat::Other(AVSampleFormat::from(other) as i32),
    }
}

/// Errno values meaning the destination itself is gone.
pub(crate) fn is_fatal_io(error: &ffmpeg_next::Error) -> bool {
    const EIO: i32 = 5;
    const ENOSPC: i32 = 28;
    const EPIPE: i32 = 32;
    matches!(
        error,
        ffmpeg_next::Error::Other { errno } if *errno == EIO || *errno == EPIPE || *errno == ENOSPC
    )
}

#[cfg(test)]
#[path = "backend_test.rs"]
mod backend_test;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_mapping() {
        assert_eq!(pixel_from_ffmpeg(Pixel::YUV420P), PixelFormat::Yuv420p);
        assert_eq!(pixel_from_ffmpeg(Pixel::NV12), PixelFormat::Nv12);
        assert!(matches!(pixel_from_ffmpeg(Pixel::YUV420P10LE), PixelFormat::Other(_)));
        let raw = pixel_from_ffmpeg(Pixel::YUV420P10LE);
        assert_eq!(pixel_to_ffmpeg(raw), Some(Pixel::YUV420P10LE));
        assert_eq!(pixel_to_ffmpeg(PixelFormat::Other(-1)), None);
    }

    #[test]
    fn test_sample_format_mapping() {
        assert_eq!(
            sample_from_ffmpeg(Sample::F32(SampleType::Planar)),
            SampleFormat::F32(SampleLayout::Planar)
        );
        assert_eq!(
            sample_format(AVSampleFormat::AV_SAMPLE_FMT_S16 as i32),
            SampleFormat::I16(SampleLayout::Packed)
        );
        assert!(matches!(
            sample_format(AVSampleFormat::AV_SAMPLE_FMT_S64 as i32),
            SampleFormat::Other(_)
        ));
    }
}

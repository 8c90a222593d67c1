use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::timebase::Timebase;

/// Decoded picture layouts. `Other` carries the raw FFmpeg `AVPixelFormat` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Yuvj420p,
    Nv12,
    Yuv422p,
    Yuv444p,
    Rgb24,
    Rgba,
    Bgra,
    Other(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleLayout {
    Packed,
    Planar,
}

/// Audio sample representation. `Other` carries the raw FFmpeg `AVSampleFormat` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8(SampleLayout),
    I16(SampleLayout),
    I32(SampleLayout),
    F32(SampleLayout),
    F64(SampleLayout),
    Other(i32),
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> Option<usize> {
        match self {
            SampleFormat::U8(_) => Some(1),
            SampleFormat::I16(_) => Some(2),
            SampleFormat::I32(_) | SampleFormat::F32(_) => Some(4),
            SampleFormat::F64(_) => Some(8),
            SampleFormat::Other(_) => None,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8(SampleLayout::Planar)
                | SampleFormat::I16(SampleLayout::Planar)
                | SampleFormat::I32(SampleLayout::Planar)
                | SampleFormat::F32(SampleLayout::Planar)
                | SampleFormat::F64(SampleLayout::Planar)
        )
    }

    /// Same representation, interleaved.
    pub fn packed(&self) -> Self {
        match *self {
            SampleFormat::U8(_) => SampleFormat::U8(SampleLayout::Packed),
            SampleFormat::I16(_) => SampleFormat::I16(SampleLayout::Packed),
            SampleFormat::I32(_) => SampleFormat::I32(SampleLayout::Packed),
            SampleFormat::F32(_) => SampleFormat::F32(SampleLayout::Packed),
            SampleFormat::F64(_) => SampleFormat::F64(SampleLayout::Packed),
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Plane {
    pub data: Bytes,
    // bytes per row, padding included
    pub stride: usize,
}

/// Decoded picture as produced by a video decode stage.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
    pub pts: Option<i64>,
    pub time_base: Timebase,
    pub is_key: bool,
}

/// Decoded audio as produced by an audio decode stage. Packed formats use one plane,
/// planar formats one plane per channel.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    // samples per channel
    pub samples: usize,
    pub planes: Vec<Bytes>,
    pub pts: Option<i64>,
    pub time_base: Timebase,
}

#[derive(Clone, Debug)]
pub enum DecodedFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl DecodedFrame {
    pub fn pts(&self) -> Option<i64> {
        match self {
            DecodedFrame::Video(f) => f.pts,
            DecodedFrame::Audio(f) => f.pts,
        }
    }
}

/// Packed 32-bit pixel layouts handed to the video sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PreviewFormat {
    #[default]
    Rgba,
    Bgra,
}

/// Converted picture ready for display: packed, 4 bytes per pixel, no row padding.
#[derive(Clone, Debug)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PreviewFormat,
    pub data: Bytes,
    pub pts_ms: Option<i64>,
}

impl PixelBuffer {
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }
}

impl Display for PixelBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PixelBuffer {}x{} {:?} len={} pts_ms={:?}",
            self.width,
            self.height,
            self.format,
            self.data.len(),
            self.pts_ms
        )
    }
}

/// Format negotiated with the playback device. Always interleaved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SinkFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl SinkFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: sample_format.packed(),
        }
    }
}

impl Default for SinkFormat {
    fn default() -> Self {
        Self::new(48000, 2, SampleFormat::F32(SampleLayout::Packed))
    }
}

/// Interleaved samples in the sink's format.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
    pub format: SinkFormat,
    // samples per channel
    pub frames: usize,
    pub data: Bytes,
    pub pts_ms: Option<i64>,
}

impl SampleBuffer {
    /// Samples as normalized `f32`, interleaved.
    pub fn to_f32(&self) -> Vec<f32> {
        crate::resampler::read_interleaved(&self.data, self.format.sample_format)
    }

    pub fn duration_ms(&self) -> u64 {
        if self.format.sample_rate == 0 {
            return 0;
        }
        self.frames as u64 * 1000 / self.format.sample_rate as u64
    }
}

use std::fmt::{Display, Formatter};

use crate::{
    frame::{PixelFormat, SampleFormat},
    timebase::Timebase,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamParams {
    Video(VideoParams),
    Audio(AudioParams),
    Other,
}

/// Metadata of one elementary stream, discovered when the input is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    index: usize,
    codec: String,
    time_base: Timebase,
    params: StreamParams,
}

impl StreamDescriptor {
    pub fn new(
        index: usize,
        codec: impl Into<String>,
        time_base: Timebase,
        params: StreamParams,
    ) -> Self {
        Self {
            index,
            codec: codec.into(),
            time_base,
            params,
        }
    }

    pub fn video(
        index: usize,
        codec: impl Into<String>,
        time_base: Timebase,
        params: VideoParams,
    ) -> Self {
        Self::new(index, codec, time_base, StreamParams::Video(params))
    }

    pub fn audio(
        index: usize,
        codec: impl Into<String>,
        time_base: Timebase,
        params: AudioParams,
    ) -> Self {
        Self::new(index, codec, time_base, StreamParams::Audio(params))
    }

    pub fn other(index: usize, codec: impl Into<String>, time_base: Timebase) -> Self {
        Self::new(index, codec, time_base, StreamParams::Other)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Codec name, e.g. "h264", "aac".
    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn time_base(&self) -> Timebase {
        self.time_base
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn kind(&self) -> MediaKind {
        match self.params {
            StreamParams::Video(_) => MediaKind::Video,
            StreamParams::Audio(_) => MediaKind::Audio,
            StreamParams::Other => MediaKind::Other,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind() == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind() == MediaKind::Audio
    }

    pub fn video_params(&self) -> Option<&VideoParams> {
        match &self.params {
            StreamParams::Video(params) => Some(params),
            _ => None,
        }
    }

    pub fn audio_params(&self) -> Option<&AudioParams> {
        match &self.params {
            StreamParams::Audio(params) => Some(params),
            _ => None,
        }
    }
}

impl Display for StreamDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.params {
            StreamParams::Video(v) => write!(
                f,
                "#{} video {} {}x{} {:?} tb={}",
                self.index, self.codec, v.width, v.height, v.pixel_format, self.time_base
            ),
            StreamParams::Audio(a) => write!(
                f,
                "#{} audio {} {}Hz {}ch {:?} tb={}",
                self.index, self.codec, a.sample_rate, a.channels, a.sample_format, self.time_base
            ),
            StreamParams::Other => {
                write!(f, "#{} other {} tb={}", self.index, self.codec, self.time_base)
            }
        }
    }
}

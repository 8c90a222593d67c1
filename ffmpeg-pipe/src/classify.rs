use std::fmt::{Display, Formatter};

use crate::{
    error::{PipelineError, Result},
    stream::{MediaKind, StreamDescriptor},
};

/// Which stream roles a session must find in its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamRequirement {
    /// Primary video and primary audio are both required and both decoded.
    #[default]
    AudioVideo,
    /// Only the primary video is decoded; audio streams are still recorded.
    VideoOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Video,
    Audio,
    Other,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Video => write!(f, "video"),
            Role::Audio => write!(f, "audio"),
            Role::Other => write!(f, "other"),
        }
    }
}

/// Role of every input stream, fixed for the lifetime of a session.
#[derive(Clone, Debug)]
pub struct RoleTable {
    roles: Vec<Option<Role>>,
    video: Option<usize>,
    audio: Option<usize>,
}

impl RoleTable {
    /// Assigns the first video and the first audio stream as primary.
    pub fn classify(
        descriptors: &[StreamDescriptor],
        requirement: StreamRequirement,
    ) -> Result<Self> {
        let video = descriptors.iter().find(|d| d.is_video()).map(|d| d.index());
        let audio = match requirement {
            StreamRequirement::AudioVideo => {
                descriptors.iter().find(|d| d.is_audio()).map(|d| d.index())
            }
            StreamRequirement::VideoOnly => None,
        };

        if video.is_none() {
            return Err(PipelineError::RequiredStreamMissing(MediaKind::Video));
        }
        if requirement == StreamRequirement::AudioVideo && audio.is_none() {
            return Err(PipelineError::RequiredStreamMissing(MediaKind::Audio));
        }

        let len = descriptors.iter().map(|d| d.index() + 1).max().unwrap_or(0);
        let mut roles = vec![None; len];
        for d in descriptors {
            let role = if Some(d.index()) == video {
                Role::Video
            } else if Some(d.index()) == audio {
                Role::Audio
            } else {
                Role::Other
            };
            roles[d.index()] = Some(role);
        }

        Ok(Self { roles, video, audio })
    }

    /// `None` for an index the input never announced.
    pub fn role(&self, stream_index: usize) -> Option<Role> {
        self.roles.get(stream_index).copied().flatten()
    }

    pub fn video_index(&self) -> Option<usize> {
        self.video
    }

    pub fn audio_index(&self) -> Option<usize> {
        self.audio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{PixelFormat, SampleFormat, SampleLayout},
        stream::{AudioParams, VideoParams},
        timebase::Timebase,
    };

    fn video(index: usize) -> StreamDescriptor {
        StreamDescriptor::video(
            index,
            "h264",
            Timebase::new(1, 30),
            VideoParams {
                width: 640,
                height: 360,
                pixel_format: PixelFormat::Yuv420p,
            },
        )
    }

    fn audio(index: usize) -> StreamDescriptor {
        StreamDescriptor::audio(
            index,
            "aac",
            Timebase::new(1, 48000),
            AudioParams {
                sample_rate: 48000,
                channels: 2,
                sample_format: SampleFormat::F32(SampleLayout::Planar),
            },
        )
    }

    #[test]
    fn test_first_stream_of_each_kind_wins() {
        let streams = vec![
            StreamDescriptor::other(0, "mov_text", Timebase::new(1, 1000)),
            audio(1),
            video(2),
            video(3),
            audio(4),
        ];
        let table = RoleTable::classify(&streams, StreamRequirement::AudioVideo).unwrap();
        assert_eq!(table.video_index(), Some(2));
        assert_eq!(table.audio_index(), Some(1));
        assert_eq!(table.role(0), Some(Role::Other));
        assert_eq!(table.role(1), Some(Role::Audio));
        assert_eq!(table.role(2), Some(Role::Video));
        assert_eq!(table.role(3), Some(Role::Other));
        assert_eq!(table.role(4), Some(Role::Other));
        assert_eq!(table.role(5), None);
    }

    #[test]
    fn test_missing_audio_is_fatal_when_required() {
        let streams = vec![video(0)];
        let err = RoleTable::classify(&streams, StreamRequirement::AudioVideo).unwrap_err();
        assert!(matches!(err, PipelineError::RequiredStreamMissing(MediaKind::Audio)));
        assert!(err.is_startup());
    }

    #[test]
    fn test_missing_video_is_always_fatal() {
        let streams = vec![audio(0)];
        let err = RoleTable::classify(&streams, StreamRequirement::VideoOnly).unwrap_err();
        assert!(matches!(err, PipelineError::RequiredStreamMissing(MediaKind::Video)));
    }

    #[test]
    fn test_video_only_leaves_audio_unassigned() {
        let streams = vec![video(0), audio(1)];
        let table = RoleTable::classify(&streams, StreamRequirement::VideoOnly).unwrap();
        assert_eq!(table.video_index(), Some(0));
        assert_eq!(table.audio_index(), None);
        assert_eq!(table.role(1), Some(Role::Other));
    }
}

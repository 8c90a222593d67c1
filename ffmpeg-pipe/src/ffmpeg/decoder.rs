use bytes::Bytes;
use ffmpeg_next::{Rational, codec::Parameters, util::error::EAGAIN};

use crate::{
    decoder::{DecodeError, DecodeStatus, FrameDecoder},
    error::{PipelineError, Result},
    frame::{AudioFrame, DecodedFrame, Plane, VideoFrame},
    packet::Packet,
    stream::StreamDescriptor,
    timebase::Timebase,
};

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

/// libavcodec decoder for one input stream. Packets arrive in the stream timebase and
/// frames carry it too.
pub struct FfmpegDecoder {
    codec: String,
    inner: DecoderType,
    time_base: Timebase,
}

unsafe impl Send for FfmpegDecoder {}

fn map_error(error: ffmpeg_next::Error) -> DecodeError {
    match error {
        ffmpeg_next::Error::Other { errno } if errno == EAGAIN => DecodeError::NotReady,
        ffmpeg_next::Error::InvalidData => DecodeError::InvalidData(error.to_string()),
        e => DecodeError::Failed(e.to_string()),
    }
}

impl FfmpegDecoder {
    pub fn open(stream: &StreamDescriptor, parameters: Parameters) -> Result<Self> {
        let codec = stream.codec().to_string();
        if ffmpeg_next::decoder::find(parameters.id()).is_none() {
            return Err(PipelineError::DecoderUnavailable(codec));
        }
        let open_failed = |e: ffmpeg_next::Error| PipelineError::DecoderOpenFailed {
            codec: codec.clone(),
            reason: e.to_string(),
        };

        let mut context =
            ffmpeg_next::codec::Context::from_parameters(parameters).map_err(open_failed)?;
        let time_base = stream.time_base();
        unsafe {
            (*context.as_mut_ptr()).time_base = Rational::from(time_base).into();
            (*context.as_mut_ptr()).pkt_timebase = Rational::from(time_base).into();
        }

        let inner = if stream.is_video() {
            let video = context.decoder().video().map_err(open_failed)?;
            if video.width() == 0 || video.height() == 0 {
                return Err(PipelineError::DecoderOpenFailed {
                    codec,
                    reason: "missing picture size".to_string(),
                });
            }
            DecoderType::Video(video)
        } else if stream.is_audio() {
            DecoderType::Audio(context.decoder().audio().map_err(open_failed)?)
        } else {
            return Err(PipelineError::DecoderOpenFailed {
                codec,
                reason: "not an audio or video stream".to_string(),
            });
        };
        log::info!("opened {} decoder for stream {}", codec, stream.index());

        Ok(Self {
            codec,
            inner,
            time_base,
        })
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }
}

fn video_frame(frame: &ffmpeg_next::frame::Video, time_base: Timebase) -> VideoFrame {
    let planes = (0..frame.planes())
        .map(|i| Plane {
            data: Bytes::copy_from_slice(frame.data(i)),
            stride: frame.stride(i),
        })
        .collect();
    VideoFrame {
        width: frame.width(),
        height: frame.height(),
        format: super::pixel_from_ffmpeg(frame.format()),
        planes,
        pts: frame.timestamp().or(frame.pts()),
        time_base,
        is_key: frame.is_key(),
    }
}

fn audio_frame(frame: &ffmpeg_next::frame::Audio, time_base: Timebase) -> AudioFrame {
    let format = super::sample_from_ffmpeg(frame.format());
    let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels.max(0) as u16 };
    let samples = frame.samples();
    let (plane_count, plane_len) = match format.bytes_per_sample() {
        Some(bps) if format.is_planar() => (channels as usize, samples * bps),
        Some(bps) => (1, samples * bps * channels as usize),
        None => (0, 0),
    };
    let planes = (0..plane_count)
        .map(|i| {
            // SAFETY: extended_data has one pointer per plane, each at least plane_len bytes
            let data = unsafe {
                std::slice::from_raw_parts(*(*frame.as_ptr()).extended_data.add(i), plane_len)
            };
            Bytes::copy_from_slice(data)
        })
        .collect();
    AudioFrame {
        sample_rate: frame.rate(),
        channels,
        format,
        samples,
        planes,
        pts: frame.timestamp().or(frame.pts()),
        time_base,
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), DecodeError> {
        let mut raw = ffmpeg_next::Packet::copy(packet.data());
        raw.set_stream(packet.stream_index());
        raw.set_pts(packet.pts());
        raw.set_dts(packet.dts());
        raw.set_duration(packet.duration());
        if packet.is_key() {
            raw.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        match &mut self.inner {
            DecoderType::Video(decoder) => decoder.send_packet(&raw),
            DecoderType::Audio(decoder) => decoder.send_packet(&raw),
        }
        .map_err(map_error)
    }

    fn send_eof(&mut self) -> std::result::Result<(), DecodeError> {
        match &mut self.inner {
            DecoderType::Video(decoder) => decoder.send_eof(),
            DecoderType::Audio(decoder) => decoder.send_eof(),
        }
        .map_err(map_error)
    }

    fn receive_frame(&mut self) -> std::result::Result<DecodeStatus, DecodeError> {
        let time_base = self.time_base;
        let result = match &mut self.inner {
            DecoderType::Video(decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                decoder
                    .receive_frame(&mut frame)
                    .map(|()| DecodedFrame::Video(video_frame(&frame, time_base)))
            }
            DecoderType::Audio(decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                decoder
                    .receive_frame(&mut frame)
                    .map(|()| DecodedFrame::Audio(audio_frame(&frame, time_base)))
            }
        };
        match result {
            Ok(frame) => Ok(DecodeStatus::Frame(frame)),
            Err(ffmpeg_next::Error::Eof) => Ok(DecodeStatus::EndOfStream),
            Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => {
                Ok(DecodeStatus::NeedMoreInput)
            }
            Err(e) => Err(map_error(e)),
        }
    }
}

use std::{
    collections::HashMap,
    ffi::CString,
    time::{Duration, Instant},
};

use bytes::Bytes;
use ffmpeg_next::{Dictionary, codec::Parameters, ffi, format::context, media, util::error::EAGAIN};

use crate::{
    error::{PipelineError, Result},
    packet::Packet,
    source::{PacketSource, SourceOptions},
    stream::{AudioParams, StreamDescriptor, VideoParams},
    timebase::Timebase,
};

// Parameters holds a raw AVCodecParameters pointer; it is only touched from the worker
// that owns the source.
pub(crate) struct SendParameters(pub(crate) Parameters);

unsafe impl Send for SendParameters {}

/// Demuxer for a URL or local file.
pub struct FfmpegSource {
    url: String,
    inner: Option<context::Input>,
    streams: Vec<StreamDescriptor>,
    parameters: HashMap<usize, SendParameters>,
    read_timeout: Duration,
}

unsafe impl Send for FfmpegSource {}

fn is_rtmp(url: &str) -> bool {
    url.starts_with("rtmp")
}

/// Demuxer options for the given URL.
pub(crate) fn open_options(url: &str, options: &SourceOptions) -> Dictionary<'static> {
    let mut dict = Dictionary::new();
    let micros = |d: Duration| d.as_micros().max(1).to_string();
    if is_rtmp(url) {
        // the rtmp protocol reads its timeout in seconds
        dict.set("timeout", &options.connect_timeout.as_secs().max(1).to_string());
    } else if url.contains("://") {
        dict.set("timeout", &micros(options.connect_timeout));
    }
    dict.set("rw_timeout", &micros(options.read_timeout));
    if options.listen {
        dict.set("listen", "1");
    }
    if let Some(bytes) = options.probe_size {
        dict.set("probesize", &bytes.to_string());
    }
    if let Some(duration) = options.analyze_duration {
        dict.set("analyzeduration", &micros(duration));
    }
    dict
}

fn describe(index: usize, parameters: &Parameters, time_base: Timebase) -> StreamDescriptor {
    let codec = parameters.id().name().to_string();
    // SAFETY: the parameters pointer is valid for the lifetime of `parameters`
    let raw = unsafe { &*(parameters.as_ptr() as *const ffi::AVCodecParameters) };
    match parameters.medium() {
        media::Type::Video => StreamDescriptor::video(
            index,
            codec,
            time_base,
            VideoParams {
                width: raw.width.max(0) as u32,
                height: raw.height.max(0) as u32,
                pixel_format: super::pixel_format(raw.format),
            },
        ),
        media::Type::Audio => StreamDescriptor::audio(
            index,
            codec,
            time_base,
            AudioParams {
                sample_rate: raw.sample_rate.max(0) as u32,
                channels: raw.ch_layout.nb_channels.max(0) as u16,
                sample_format: super::sample_format(raw.format),
            },
        ),
        _ => StreamDescriptor::other(index, codec, time_base),
    }
}

impl FfmpegSource {
    pub fn open(url: &str, options: &SourceOptions) -> Result<Self> {
        let curl = CString::new(url).map_err(|e| PipelineError::OpenFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let opts = open_options(url, options);
        log::info!(
            "opening input {} (timeout {:?}, listen {})",
            url,
            options.connect_timeout,
            options.listen
        );

        // Open and probe separately so a dead endpoint and an unreadable stream are
        // reported as different failures.
        let input = unsafe {
            let mut ctx = std::ptr::null_mut();
            let mut dict = opts.disown();
            let res =
                ffi::avformat_open_input(&mut ctx, curl.as_ptr(), std::ptr::null_mut(), &mut dict);
            let leftover = Dictionary::own(dict);
            for (key, _) in leftover.iter() {
                log::debug!("input option {} not consumed", key);
            }
            if res < 0 {
                return Err(PipelineError::OpenFailed {
                    url: url.to_string(),
                    reason: ffmpeg_next::Error::from(res).to_string(),
                });
            }
            let res = ffi::avformat_find_stream_info(ctx, std::ptr::null_mut());
            if res < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(PipelineError::ProbeFailed(ffmpeg_next::Error::from(res).to_string()));
            }
            context::Input::wrap(ctx)
        };

        let mut streams = Vec::new();
        let mut parameters = HashMap::new();
        for stream in input.streams() {
            let params = stream.parameters();
            streams.push(describe(stream.index(), &params, stream.time_base().into()));
            parameters.insert(stream.index(), SendParameters(params));
        }
        if streams.is_empty() {
            return Err(PipelineError::ProbeFailed(format!("{} has no streams", url)));
        }

        Ok(Self {
            url: url.to_string(),
            inner: Some(input),
            streams,
            parameters,
            read_timeout: options.read_timeout,
        })
    }

    pub(crate) fn parameters(&self, stream_index: usize) -> Option<Parameters> {
        self.parameters.get(&stream_index).map(|p| p.0.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PacketSource for FfmpegSource {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let Some(input) = self.inner.as_mut() else {
            return Ok(None);
        };
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            match packet.read(input) {
                Ok(()) => {
                    let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
                    let position = packet.position();
                    return Ok(Some(
                        Packet::new(packet.stream(), data)
                            .with_pts(packet.pts())
                            .with_dts(packet.dts())
                            .with_duration(packet.duration())
                            .with_position((position >= 0).then_some(position as i64))
                            .with_key(packet.is_key()),
                    ));
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::ReadFailed("read timed out".to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(PipelineError::ReadFailed(e.to_string())),
            }
        }
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::info!("input {} closed", self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(dict: &Dictionary, key: &str) -> Option<String> {
        dict.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_rtmp_timeout_in_seconds() {
        let options = SourceOptions {
            listen: true,
            ..SourceOptions::default()
        };
        let dict = open_options("rtmp://0.0.0.0:1935/live/stream", &options);
        assert_eq!(get(&dict, "timeout").as_deref(), Some("10"));
        assert_eq!(get(&dict, "rw_timeout").as_deref(), Some("10000000"));
        assert_eq!(get(&dict, "listen").as_deref(), Some("1"));
    }

    #[test]
    fn test_other_protocols_use_microseconds() {
        let options = SourceOptions {
            connect_timeout: Duration::from_millis(2500),
            probe_size: Some(65536),
            analyze_duration: Some(Duration::from_secs(1)),
            ..SourceOptions::default()
        };
        let dict = open_options("srt://127.0.0.1:9000", &options);
        assert_eq!(get(&dict, "timeout").as_deref(), Some("2500000"));
        assert_eq!(get(&dict, "probesize").as_deref(), Some("65536"));
        assert_eq!(get(&dict, "analyzeduration").as_deref(), Some("1000000"));
        assert!(get(&dict, "listen").is_none());

        let dict = open_options("/var/media/clip.mp4", &options);
        assert!(get(&dict, "timeout").is_none());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let _ = super::super::init();
        let err = FfmpegSource::open("/nonexistent/clip.flv", &SourceOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::OpenFailed { .. }));
    }
}

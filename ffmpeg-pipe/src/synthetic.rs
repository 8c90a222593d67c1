//! Deterministic in-memory backend: a generated live source, decoders producing real
//! YUV420P pictures and PCM audio, and a writer that records what it was given.
//!
//! Runs the whole pipeline without FFmpeg; failures can be scripted per session.

use std::{
    f32::consts::TAU,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;

use crate::{
    backend::MediaBackend,
    decoder::{DecodeError, DecodeStatus, FrameDecoder},
    error::{PipelineError, Result},
    frame::{AudioFrame, DecodedFrame, PixelFormat, Plane, SampleFormat, SampleLayout, VideoFrame},
    output::{PacketWriter, WriteError},
    packet::Packet,
    source::{PacketSource, SourceOptions},
    stream::{AudioParams, StreamDescriptor, StreamParams, VideoParams},
    timebase::{Timebase, rescale},
};

const COMPARE_BASE: Timebase = Timebase::new(1, 1_000_000);

#[derive(Clone, Debug)]
struct SyntheticStream {
    descriptor: StreamDescriptor,
    // packet duration in stream ticks
    packet_duration: i64,
}

/// Shape of the generated input and the failures to inject.
#[derive(Clone, Debug)]
pub struct SyntheticSpec {
    streams: Vec<SyntheticStream>,
    packets: Option<u64>,
    packet_interval: Duration,
    stray_every: Option<u64>,
    open_failure: Option<String>,
    unavailable_codecs: Vec<String>,
    audio_decode_failure_after: Option<u64>,
    read_failure_after: Option<u64>,
    write_failures: Vec<u64>,
    fatal_write_after: Option<u64>,
}

impl SyntheticSpec {
    fn empty() -> Self {
        Self {
            streams: Vec::new(),
            packets: Some(100),
            packet_interval: Duration::ZERO,
            stray_every: None,
            open_failure: None,
            unavailable_codecs: Vec::new(),
            audio_decode_failure_after: None,
            read_failure_after: None,
            write_failures: Vec::new(),
            fatal_write_after: None,
        }
    }

    fn video_stream(index: usize) -> SyntheticStream {
        SyntheticStream {
            descriptor: StreamDescriptor::video(
                index,
                "h264",
                Timebase::new(1, 30),
                VideoParams {
                    width: 320,
                    height: 240,
                    pixel_format: PixelFormat::Yuv420p,
                },
            ),
            packet_duration: 1,
        }
    }

    fn audio_stream(index: usize) -> SyntheticStream {
        SyntheticStream {
            descriptor: StreamDescriptor::audio(
                index,
                "aac",
                Timebase::new(1, 48000),
                AudioParams {
                    sample_rate: 48000,
                    channels: 2,
                    sample_format: SampleFormat::F32(SampleLayout::Planar),
                },
            ),
            packet_duration: 1024,
        }
    }

    /// 320x240 H.264 at 30 fps (timebase 1/30) plus 48 kHz stereo AAC (timebase
    /// 1/48000, 1024 samples per packet), 100 packets.
    pub fn av() -> Self {
        let mut spec = Self::empty();
        spec.streams = vec![Self::video_stream(0), Self::audio_stream(1)];
        spec
    }

    pub fn video_only() -> Self {
        let mut spec = Self::empty();
        spec.streams = vec![Self::video_stream(0)];
        spec
    }

    /// Adds a timed metadata stream that is recorded but never decoded.
    pub fn with_data_stream(mut self) -> Self {
        let index = self.streams.len();
        self.streams.push(SyntheticStream {
            descriptor: StreamDescriptor::other(index, "timed_id3", Timebase::new(1, 1000)),
            packet_duration: 500,
        });
        self
    }

    pub fn with_packets(mut self, packets: u64) -> Self {
        self.packets = Some(packets);
        self
    }

    /// Never reaches end of stream.
    pub fn endless(mut self) -> Self {
        self.packets = None;
        self
    }

    /// Blocks each read this long, like a live input arriving in real time.
    pub fn with_packet_interval(mut self, interval: Duration) -> Self {
        self.packet_interval = interval;
        self
    }

    /// Every `n`th read yields a packet of a stream the input never announced.
    pub fn with_stray_packets(mut self, n: u64) -> Self {
        self.stray_every = Some(n.max(1));
        self
    }

    pub fn with_open_failure(mut self, reason: impl Into<String>) -> Self {
        self.open_failure = Some(reason.into());
        self
    }

    pub fn with_unavailable_codec(mut self, codec: impl Into<String>) -> Self {
        self.unavailable_codecs.push(codec.into());
        self
    }

    /// The audio decoder reports corrupt data after producing `frames` frames.
    pub fn with_audio_decode_failure_after(mut self, frames: u64) -> Self {
        self.audio_decode_failure_after = Some(frames);
        self
    }

    /// Reads fail after `packets` packets were delivered.
    pub fn with_read_failure_after(mut self, packets: u64) -> Self {
        self.read_failure_after = Some(packets);
        self
    }

    /// The writer rejects the write with this zero-based ordinal.
    pub fn with_write_failure_on(mut self, ordinal: u64) -> Self {
        self.write_failures.push(ordinal);
        self
    }

    /// The destination disappears after `packets` writes.
    pub fn with_output_lost_after(mut self, packets: u64) -> Self {
        self.fatal_write_after = Some(packets);
        self
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.streams.iter().map(|s| s.descriptor.clone()).collect()
    }
}

/// Everything the synthetic backend observed, shared with tests.
#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub sources_opened: u64,
    pub source_closed: bool,
    pub decoders_opened: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub header_written: bool,
    pub packets: Vec<Packet>,
    pub rejected: u64,
    pub trailer_written: bool,
    pub writer_closed: bool,
    /// (stream index, payload) of every packet the source produced.
    pub generated: Vec<(usize, Bytes)>,
}

impl Recording {
    /// Written packets of one stream, in write order.
    pub fn stream_packets(&self, stream_index: usize) -> Vec<&Packet> {
        self.packets.iter().filter(|p| p.stream_index() == stream_index).collect()
    }
}

pub struct SyntheticBackend {
    spec: SyntheticSpec,
    recording: Arc<Mutex<Recording>>,
}

impl SyntheticBackend {
    pub fn new(spec: SyntheticSpec) -> Self {
        Self {
            spec,
            recording: Arc::new(Mutex::new(Recording::default())),
        }
    }

    pub fn recording(&self) -> Arc<Mutex<Recording>> {
        self.recording.clone()
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaBackend for SyntheticBackend {
    type Source = SyntheticSource;
    type Writer = RecordingWriter;
    type Decoder = SyntheticDecoder;

    fn open_source(&self, url: &str, options: &SourceOptions) -> Result<SyntheticSource> {
        log::debug!("synthetic open {} (timeout {:?})", url, options.connect_timeout);
        if let Some(reason) = &self.spec.open_failure {
            return Err(PipelineError::OpenFailed {
                url: url.to_string(),
                reason: reason.clone(),
            });
        }
        {
            let mut log = self.log();
            log.sources_opened += 1;
            log.source_closed = false;
            log.generated.clear();
        }
        Ok(SyntheticSource::new(self.spec.clone(), self.recording.clone()))
    }

    fn create_output(&self, path: &Path, source: &SyntheticSource) -> Result<RecordingWriter> {
        let mut log = self.log();
        *log = Recording {
            sources_opened: log.sources_opened,
            decoders_opened: std::mem::take(&mut log.decoders_opened),
            generated: std::mem::take(&mut log.generated),
            output_path: Some(path.to_path_buf()),
            header_written: true,
            ..Recording::default()
        };
        Ok(RecordingWriter {
            time_bases: source
                .streams()
                .iter()
                .map(|s| match s.params() {
                    StreamParams::Video(_) => Timebase::new(1, 90000),
                    StreamParams::Audio(a) => Timebase::new(1, a.sample_rate as i32),
                    StreamParams::Other => Timebase::new(1, 1000),
                })
                .collect(),
            recording: self.recording.clone(),
            write_failures: self.spec.write_failures.clone(),
            fatal_write_after: self.spec.fatal_write_after,
            attempts: 0,
        })
    }

    fn open_decoder(
        &self,
        _source: &SyntheticSource,
        stream: &StreamDescriptor,
    ) -> Result<SyntheticDecoder> {
        if self.spec.unavailable_codecs.iter().any(|c| c == stream.codec()) {
            return Err(PipelineError::DecoderUnavailable(stream.codec().to_string()));
        }
        self.log().decoders_opened.push(stream.codec().to_string());
        match stream.params() {
            StreamParams::Video(params) => Ok(SyntheticDecoder::Video(VideoDecoder {
                params: params.clone(),
                time_base: stream.time_base(),
                buffered: None,
                output: None,
                eof: false,
            })),
            StreamParams::Audio(params) => Ok(SyntheticDecoder::Audio(AudioDecoder {
                params: params.clone(),
                time_base: stream.time_base(),
                pending: None,
                produced: 0,
                fail_after: self.spec.audio_decode_failure_after,
                phase: 0.0,
            })),
            StreamParams::Other => Err(PipelineError::DecoderOpenFailed {
                codec: stream.codec().to_string(),
                reason: "not a media stream".to_string(),
            }),
        }
    }
}

pub struct SyntheticSource {
    spec: SyntheticSpec,
    descriptors: Vec<StreamDescriptor>,
    next_pts: Vec<i64>,
    emitted: u64,
    reads: u64,
    closed: bool,
    recording: Arc<Mutex<Recording>>,
}

impl SyntheticSource {
    fn new(spec: SyntheticSpec, recording: Arc<Mutex<Recording>>) -> Self {
        Self {
            descriptors: spec.descriptors(),
            next_pts: vec![0; spec.streams.len()],
            spec,
            emitted: 0,
            reads: 0,
            closed: false,
            recording,
        }
    }

    // stream whose next packet is earliest, lowest index on ties
    fn next_stream(&self) -> Option<usize> {
        (0..self.spec.streams.len()).min_by_key(|&i| {
            let tb = self.spec.streams[i].descriptor.time_base();
            (rescale(self.next_pts[i], tb, COMPARE_BASE), i)
        })
    }
}

impl PacketSource for SyntheticSource {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.descriptors
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.closed {
            return Ok(None);
        }
        if self.spec.read_failure_after.is_some_and(|n| self.emitted >= n) {
            return Err(PipelineError::ReadFailed("connection reset by peer".to_string()));
        }
        if self.spec.packets.is_some_and(|n| self.emitted >= n) {
            return Ok(None);
        }
        if !self.spec.packet_interval.is_zero() {
            std::thread::sleep(self.spec.packet_interval);
        }
        self.reads += 1;

        if self.spec.stray_every.is_some_and(|n| self.reads % n == 0) {
            return Ok(Some(Packet::new(99, Bytes::from_static(b"stray")).with_pts(Some(0))));
        }

        let Some(i) = self.next_stream() else {
            return Ok(None);
        };
        let stream = &self.spec.streams[i];
        let index = stream.descriptor.index();
        let pts = self.next_pts[i];
        self.next_pts[i] += stream.packet_duration;

        let ordinal = pts / stream.packet_duration.max(1);
        let payload = Bytes::from(format!("s{}p{}", index, ordinal).into_bytes());
        let packet = Packet::new(index, payload.clone())
            .with_pts(Some(pts))
            .with_dts(Some(pts))
            .with_duration(stream.packet_duration)
            .with_position(Some(self.emitted as i64 * 188))
            .with_key(!stream.descriptor.is_video() || ordinal % 30 == 0);
        self.emitted += 1;
        self.recording
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generated
            .push((index, payload));
        Ok(Some(packet))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.recording.lock().unwrap_or_else(PoisonError::into_inner).source_closed = true;
    }
}

pub struct RecordingWriter {
    time_bases: Vec<Timebase>,
    recording: Arc<Mutex<Recording>>,
    write_failures: Vec<u64>,
    fatal_write_after: Option<u64>,
    attempts: u64,
}

impl PacketWriter for RecordingWriter {
    fn time_base(&self, stream_index: usize) -> Option<Timebase> {
        self.time_bases.get(stream_index).copied()
    }

    fn write_interleaved(&mut self, packet: Packet) -> std::result::Result<(), WriteError> {
        let attempt = self.attempts;
        self.attempts += 1;
        let mut log = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fatal_write_after.is_some_and(|n| attempt >= n) {
            log.rejected += 1;
            return Err(WriteError::Fatal("broken pipe".to_string()));
        }
        if self.write_failures.contains(&attempt) {
            log.rejected += 1;
            return Err(WriteError::Packet("invalid argument".to_string()));
        }
        log.packets.push(packet);
        Ok(())
    }

    fn write_trailer(&mut self) -> std::result::Result<(), WriteError> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner).trailer_written = true;
        Ok(())
    }

    fn close(&mut self) {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner).writer_closed = true;
    }
}

pub enum SyntheticDecoder {
    Video(VideoDecoder),
    Audio(AudioDecoder),
}

impl FrameDecoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), DecodeError> {
        match self {
            SyntheticDecoder::Video(d) => d.send_packet(packet),
            SyntheticDecoder::Audio(d) => d.send_packet(packet),
        }
    }

    fn send_eof(&mut self) -> std::result::Result<(), DecodeError> {
        match self {
            SyntheticDecoder::Video(d) => {
                d.eof = true;
                Ok(())
            }
            SyntheticDecoder::Audio(_) => Ok(()),
        }
    }

    fn receive_frame(&mut self) -> std::result::Result<DecodeStatus, DecodeError> {
        match self {
            SyntheticDecoder::Video(d) => Ok(d.receive_frame()),
            SyntheticDecoder::Audio(d) => d.receive_frame(),
        }
    }
}

/// Emits each picture one packet late, like a decoder with reordering delay.
pub struct VideoDecoder {
    params: VideoParams,
    time_base: Timebase,
    buffered: Option<Option<i64>>,
    output: Option<VideoFrame>,
    eof: bool,
}

impl VideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), DecodeError> {
        if self.output.is_some() {
            return Err(DecodeError::NotReady);
        }
        if let Some(previous) = self.buffered.replace(packet.pts()) {
            self.output = Some(self.picture(previous));
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> DecodeStatus {
        if let Some(frame) = self.output.take() {
            return DecodeStatus::Frame(DecodedFrame::Video(frame));
        }
        if self.eof {
            return match self.buffered.take() {
                Some(pts) => DecodeStatus::Frame(DecodedFrame::Video(self.picture(pts))),
                None => DecodeStatus::EndOfStream,
            };
        }
        DecodeStatus::NeedMoreInput
    }

    fn picture(&self, pts: Option<i64>) -> VideoFrame {
        let width = self.params.width as usize;
        let height = self.params.height as usize;
        let shade = (pts.unwrap_or(0) * 8).rem_euclid(220) as u8 + 16;
        let luma: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).map(move |x| shade.wrapping_add(((x + y) / 8) as u8)))
            .collect();
        let chroma = vec![128u8; width.div_ceil(2) * height.div_ceil(2)];
        let chroma = Bytes::from(chroma);
        VideoFrame {
            width: self.params.width,
            height: self.params.height,
            format: self.params.pixel_format,
            planes: vec![
                Plane {
                    data: Bytes::from(luma),
                    stride: width,
                },
                Plane {
                    data: chroma.clone(),
                    stride: width.div_ceil(2),
                },
                Plane {
                    data: chroma,
                    stride: width.div_ceil(2),
                },
            ],
            pts,
            time_base: self.time_base,
            is_key: false,
        }
    }
}

/// Turns each packet into one 440 Hz tone frame, planar `f32`.
pub struct AudioDecoder {
    params: AudioParams,
    time_base: Timebase,
    pending: Option<(Option<i64>, usize)>,
    produced: u64,
    fail_after: Option<u64>,
    phase: f32,
}

impl AudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), DecodeError> {
        if self.pending.is_some() {
            return Err(DecodeError::NotReady);
        }
        let samples = rescale(
            packet.duration(),
            self.time_base,
            Timebase::new(1, self.params.sample_rate as i32),
        )
        .max(0) as usize;
        self.pending = Some((packet.pts(), samples));
        Ok(())
    }

    fn receive_frame(&mut self) -> std::result::Result<DecodeStatus, DecodeError> {
        let Some((pts, samples)) = self.pending.take() else {
            return Ok(DecodeStatus::NeedMoreInput);
        };
        if self.fail_after.is_some_and(|n| self.produced >= n) {
            return Err(DecodeError::InvalidData("corrupt access unit".to_string()));
        }
        self.produced += 1;

        let step = TAU * 440.0 / self.params.sample_rate as f32;
        let mut plane = Vec::with_capacity(samples * 4);
        for _ in 0..samples {
            plane.extend_from_slice(&(0.25 * self.phase.sin()).to_ne_bytes());
            self.phase = (self.phase + step) % TAU;
        }
        let plane = Bytes::from(plane);
        Ok(DecodeStatus::Frame(DecodedFrame::Audio(AudioFrame {
            sample_rate: self.params.sample_rate,
            channels: self.params.channels,
            format: self.params.sample_format,
            samples,
            planes: vec![plane; self.params.channels as usize],
            pts,
            time_base: self.time_base,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packets_interleave_in_time_order() {
        let backend = SyntheticBackend::new(SyntheticSpec::av().with_packets(40));
        let mut source = backend
            .open_source("synthetic://av", &SourceOptions::default())
            .unwrap();
        let mut last = i64::MIN;
        let mut count = 0;
        while let Some(packet) = source.read_packet().unwrap() {
            let tb = source.streams()[packet.stream_index()].time_base();
            let at = rescale(packet.pts().unwrap(), tb, COMPARE_BASE);
            assert!(at >= last);
            last = at;
            count += 1;
        }
        assert_eq!(count, 40);
        source.close();
        assert!(backend.recording().lock().unwrap().source_closed);
    }

    #[test]
    fn test_video_decoder_has_one_packet_latency() {
        let backend = SyntheticBackend::new(SyntheticSpec::video_only());
        let source = backend.open_source("synthetic://v", &SourceOptions::default()).unwrap();
        let stream = source.streams()[0].clone();
        let mut decoder = backend.open_decoder(&source, &stream).unwrap();

        decoder.send_packet(&Packet::new(0, vec![0]).with_pts(Some(0))).unwrap();
        assert!(matches!(decoder.receive_frame(), Ok(DecodeStatus::NeedMoreInput)));
        decoder.send_packet(&Packet::new(0, vec![0]).with_pts(Some(1))).unwrap();
        // output pending: a third packet is refused
        assert!(matches!(
            decoder.send_packet(&Packet::new(0, vec![0]).with_pts(Some(2))),
            Err(DecodeError::NotReady)
        ));
        match decoder.receive_frame() {
            Ok(DecodeStatus::Frame(frame)) => assert_eq!(frame.pts(), Some(0)),
            _ => panic!("expected a frame"),
        }
        decoder.send_eof().unwrap();
        match decoder.receive_frame() {
            Ok(DecodeStatus::Frame(frame)) => assert_eq!(frame.pts(), Some(1)),
            _ => panic!("expected the buffered frame"),
        }
        assert!(matches!(decoder.receive_frame(), Ok(DecodeStatus::EndOfStream)));
    }

    #[test]
    fn test_audio_frame_matches_packet_duration() {
        let backend = SyntheticBackend::new(SyntheticSpec::av());
        let source = backend.open_source("synthetic://av", &SourceOptions::default()).unwrap();
        let stream = source.streams()[1].clone();
        let mut decoder = backend.open_decoder(&source, &stream).unwrap();
        decoder
            .send_packet(&Packet::new(1, vec![0]).with_pts(Some(2048)).with_duration(1024))
            .unwrap();
        match decoder.receive_frame() {
            Ok(DecodeStatus::Frame(DecodedFrame::Audio(frame))) => {
                assert_eq!(frame.samples, 1024);
                assert_eq!(frame.planes.len(), 2);
                assert_eq!(frame.planes[0].len(), 1024 * 4);
                assert_eq!(frame.pts, Some(2048));
            }
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn test_open_failure_and_unavailable_codec() {
        let backend =
            SyntheticBackend::new(SyntheticSpec::av().with_open_failure("connection refused"));
        assert!(matches!(
            backend.open_source("rtmp://nowhere/live", &SourceOptions::default()),
            Err(PipelineError::OpenFailed { .. })
        ));

        let backend = SyntheticBackend::new(SyntheticSpec::av().with_unavailable_codec("aac"));
        let source = backend.open_source("synthetic://av", &SourceOptions::default()).unwrap();
        let stream = source.streams()[1].clone();
        assert!(matches!(
            backend.open_decoder(&source, &stream),
            Err(PipelineError::DecoderUnavailable(_))
        ));
    }
}

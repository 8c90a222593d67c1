use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::MediaBackend,
    classify::{Role, RoleTable},
    config::PipelineConfig,
    decoder::{DecodeStage, FrameDecoder},
    error::{ConvertError, PipelineError, Result},
    frame::{AudioFrame, DecodedFrame, VideoFrame},
    output::RemuxStage,
    packet::Packet,
    pipeline::{PipelineState, PipelineStats, SessionEnd, SessionSummary, Shared},
    resampler::AudioConverter,
    scaler::VideoConverter,
    sink::PipelineSink,
    source::PacketSource,
};

/// What the worker thread owns for one session.
pub(crate) struct SessionContext<B: MediaBackend> {
    pub(crate) config: PipelineConfig,
    pub(crate) backend: Arc<B>,
    pub(crate) sink: Arc<dyn PipelineSink>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) cancel: CancellationToken,
}

impl<B: MediaBackend> SessionContext<B> {
    fn status(&self, message: impl Into<String>) {
        self.sink.on_status_message(message.into());
    }

    fn stats(&self) -> &PipelineStats {
        &self.shared.stats
    }
}

struct VideoPath<D: FrameDecoder> {
    stage: DecodeStage<D>,
    converter: VideoConverter,
    last_error: Option<ConvertError>,
}

struct AudioPath<D: FrameDecoder> {
    stage: DecodeStage<D>,
    converter: AudioConverter,
    last_error: Option<ConvertError>,
}

struct Session<B: MediaBackend> {
    source: B::Source,
    roles: RoleTable,
    remux: RemuxStage<B::Writer>,
    video: Option<VideoPath<B::Decoder>>,
    audio: Option<AudioPath<B::Decoder>>,
}

/// Runs one session to completion on the calling (blocking) thread. `ready` resolves
/// when the session is streaming or failed to get there.
pub(crate) fn run<B: MediaBackend>(
    ctx: SessionContext<B>,
    ready: oneshot::Sender<Result<()>>,
) -> SessionSummary {
    ctx.status(format!("connecting to {}", ctx.config.input));

    let mut session = match Session::prepare(&ctx) {
        Ok(session) => session,
        Err(e) => {
            log::error!("pipeline startup failed: {}", e);
            ctx.status(format!("startup failed: {}", e));
            ctx.shared.set_connected(false);
            ctx.sink.on_connection_state(false);
            ctx.shared.set_state(PipelineState::Closed);
            let _ = ready.send(Err(e));
            return SessionSummary {
                end: SessionEnd::Stopped,
                stats: ctx.stats().snapshot(),
            };
        }
    };

    ctx.shared.set_state(PipelineState::Streaming);
    ctx.shared.set_connected(true);
    ctx.sink.on_connection_state(true);
    ctx.status(format!(
        "streaming, recording to {}",
        ctx.config.output.display()
    ));
    if ready.send(Ok(())).is_err() {
        log::warn!("pipeline start was abandoned, stopping");
        ctx.cancel.cancel();
    }

    let end = session.pump(&ctx);
    match &end {
        SessionEnd::EndOfStream => ctx.status("end of stream"),
        SessionEnd::Stopped => ctx.status("stopping"),
        SessionEnd::ReadFailed(reason) => ctx.status(format!("input lost: {}", reason)),
        SessionEnd::OutputLost(reason) => ctx.status(format!("recording lost: {}", reason)),
    }

    ctx.shared.set_state(PipelineState::Stopping);
    session.shutdown(&ctx);

    let stats = ctx.stats().snapshot();
    log::info!(
        "session closed ({:?}): read={} written={} write_failures={} video={} audio={} dropped={}",
        end,
        stats.packets_read,
        stats.packets_written,
        stats.write_failures,
        stats.video_frames,
        stats.audio_buffers,
        stats.frames_dropped
    );
    ctx.status(format!(
        "closed: {} packets recorded",
        stats.packets_written
    ));
    ctx.shared.set_connected(false);
    ctx.sink.on_connection_state(false);
    ctx.shared.set_state(PipelineState::Closed);

    SessionSummary { end, stats }
}

impl<B: MediaBackend> Session<B> {
    fn prepare(ctx: &SessionContext<B>) -> Result<Self> {
        let config = &ctx.config;
        let mut source = ctx.backend.open_source(&config.input, &config.source)?;
        log::info!("input {} opened with {} streams", config.input, source.streams().len());
        for stream in source.streams() {
            log::info!("  {}", stream);
        }
        ctx.status(format!("input opened, {} streams", source.streams().len()));

        match Self::assemble(ctx, &source) {
            Ok((roles, video, audio, remux)) => Ok(Self {
                source,
                roles,
                remux,
                video,
                audio,
            }),
            Err(e) => {
                source.close();
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn assemble(
        ctx: &SessionContext<B>,
        source: &B::Source,
    ) -> Result<(
        RoleTable,
        Option<VideoPath<B::Decoder>>,
        Option<AudioPath<B::Decoder>>,
        RemuxStage<B::Writer>,
    )> {
        let config = &ctx.config;
        let streams = source.streams();
        let roles = RoleTable::classify(streams, config.requirement)?;

        // decoders first, so a missing codec never leaves an empty recording behind
        let find = |index: Option<usize>| {
            index.and_then(|i| streams.iter().find(|s| s.index() == i))
        };
        let video = match find(roles.video_index()) {
            Some(stream) => {
                let decoder = ctx.backend.open_decoder(source, stream)?;
                let mut converter = VideoConverter::new(config.preview_format);
                if let Some(params) = stream.video_params() {
                    if let Err(e) = converter.prime(params) {
                        log::warn!("video converter not primed: {}", e);
                    }
                }
                Some(VideoPath {
                    stage: DecodeStage::new(Role::Video, stream.codec(), decoder),
                    converter,
                    last_error: None,
                })
            }
            None => None,
        };
        let audio = match find(roles.audio_index()) {
            Some(stream) => {
                let decoder = ctx.backend.open_decoder(source, stream)?;
                Some(AudioPath {
                    stage: DecodeStage::new(Role::Audio, stream.codec(), decoder),
                    converter: AudioConverter::new(config.audio_sink),
                    last_error: None,
                })
            }
            None => None,
        };

        let writer = ctx.backend.create_output(&config.output, source)?;
        let remux = RemuxStage::new(writer, streams)?;
        log::info!("recording to {}", config.output.display());

        Ok((roles, video, audio, remux))
    }

    fn pump(&mut self, ctx: &SessionContext<B>) -> SessionEnd {
        loop {
            if ctx.cancel.is_cancelled() {
                return SessionEnd::Stopped;
            }

            let packet = match self.source.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    log::info!("input reached end of stream");
                    return SessionEnd::EndOfStream;
                }
                Err(e) => {
                    log::error!("{}", e);
                    return SessionEnd::ReadFailed(e.to_string());
                }
            };
            PipelineStats::incr(&ctx.stats().packets_read);

            let index = packet.stream_index();
            let Some(role) = self.roles.role(index) else {
                log::debug!("skipping packet of unknown stream {}", index);
                PipelineStats::incr(&ctx.stats().packets_skipped);
                continue;
            };

            if let Some(end) = self.record(ctx, packet.clone()) {
                return end;
            }

            match role {
                Role::Video => self.decode_video(ctx, &packet),
                Role::Audio => self.decode_audio(ctx, &packet),
                Role::Other => {}
            }
        }
    }

    fn record(&mut self, ctx: &SessionContext<B>, packet: Packet) -> Option<SessionEnd> {
        match self.remux.write_packet(packet) {
            Ok(()) => {
                PipelineStats::incr(&ctx.stats().packets_written);
                None
            }
            Err(PipelineError::OutputLost(reason)) => {
                PipelineStats::incr(&ctx.stats().write_failures);
                log::error!("output lost: {}", reason);
                Some(SessionEnd::OutputLost(reason))
            }
            Err(e) => {
                PipelineStats::incr(&ctx.stats().write_failures);
                log::warn!("{}", e);
                ctx.status(e.to_string());
                None
            }
        }
    }

    fn decode_video(&mut self, ctx: &SessionContext<B>, packet: &Packet) {
        let Some(path) = self.video.as_mut() else {
            return;
        };
        if !path.stage.is_active() {
            return;
        }
        let VideoPath {
            stage,
            converter,
            last_error,
        } = path;

        match stage.submit(packet) {
            Ok(true) => {}
            Ok(false) => PipelineStats::incr(&ctx.stats().decoder_not_ready),
            Err(e) => return report_decode_failure(ctx, e),
        }
        for item in stage.drain() {
            match item {
                Ok(DecodedFrame::Video(frame)) => deliver_video(ctx, converter, last_error, &frame),
                Ok(DecodedFrame::Audio(_)) => {}
                Err(e) => report_decode_failure(ctx, e),
            }
        }
    }

    fn decode_audio(&mut self, ctx: &SessionContext<B>, packet: &Packet) {
        let Some(path) = self.audio.as_mut() else {
            return;
        };
        if !path.stage.is_active() {
            return;
        }
        let AudioPath {
            stage,
            converter,
            last_error,
        } = path;

        match stage.submit(packet) {
            Ok(true) => {}
            Ok(false) => PipelineStats::incr(&ctx.stats().decoder_not_ready),
            Err(e) => return report_decode_failure(ctx, e),
        }
        for item in stage.drain() {
            match item {
                Ok(DecodedFrame::Audio(frame)) => deliver_audio(ctx, converter, last_error, &frame),
                Ok(DecodedFrame::Video(_)) => {}
                Err(e) => report_decode_failure(ctx, e),
            }
        }
    }

    /// Flushes the decoders, finishes the recording, then closes the input.
    fn shutdown(mut self, ctx: &SessionContext<B>) {
        if let Some(VideoPath {
            stage,
            converter,
            last_error,
        }) = self.video.as_mut()
        {
            for item in stage.flush() {
                match item {
                    Ok(DecodedFrame::Video(frame)) => {
                        deliver_video(ctx, converter, last_error, &frame)
                    }
                    Ok(_) => {}
                    Err(e) => report_decode_failure(ctx, e),
                }
            }
        }
        if let Some(AudioPath {
            stage,
            converter,
            last_error,
        }) = self.audio.as_mut()
        {
            for item in stage.flush() {
                match item {
                    Ok(DecodedFrame::Audio(frame)) => {
                        deliver_audio(ctx, converter, last_error, &frame)
                    }
                    Ok(_) => {}
                    Err(e) => report_decode_failure(ctx, e),
                }
            }
        }

        if let Err(e) = self.remux.close() {
            log::error!("finishing output: {}", e);
            ctx.status(format!("failed to finish recording: {}", e));
        }
        self.source.close();
        self.video = None;
        self.audio = None;
    }
}

fn report_decode_failure<B: MediaBackend>(ctx: &SessionContext<B>, error: PipelineError) {
    ctx.status(format!("{}, recording continues", error));
}

/// Reports a conversion failure once per distinct error, so a stream stuck in an
/// unsupported format does not flood the status channel.
fn report_convert_failure<B: MediaBackend>(
    ctx: &SessionContext<B>,
    kind: &str,
    last_error: &mut Option<ConvertError>,
    error: ConvertError,
) {
    PipelineStats::incr(&ctx.stats().frames_dropped);
    if last_error.as_ref() != Some(&error) {
        log::warn!("dropping {} frame: {}", kind, error);
        ctx.status(format!("dropping {} frames: {}", kind, error));
        *last_error = Some(error);
    }
}

fn deliver_video<B: MediaBackend>(
    ctx: &SessionContext<B>,
    converter: &mut VideoConverter,
    last_error: &mut Option<ConvertError>,
    frame: &VideoFrame,
) {
    match converter.convert(frame) {
        Ok(buffer) => {
            *last_error = None;
            PipelineStats::incr(&ctx.stats().video_frames);
            ctx.sink.on_video_frame(buffer);
        }
        Err(e) => report_convert_failure(ctx, "video", last_error, e),
    }
}

fn deliver_audio<B: MediaBackend>(
    ctx: &SessionContext<B>,
    converter: &mut AudioConverter,
    last_error: &mut Option<ConvertError>,
    frame: &AudioFrame,
) {
    match converter.convert(frame) {
        Ok(buffer) => {
            *last_error = None;
            if buffer.frames == 0 {
                return;
            }
            PipelineStats::incr(&ctx.stats().audio_buffers);
            ctx.sink.on_audio_samples(buffer);
        }
        Err(e) => report_convert_failure(ctx, "audio", last_error, e),
    }
}

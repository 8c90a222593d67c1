use std::sync::Arc;

use anyhow::Context as _;
use ffmpeg_pipe::{MediaBackend, Pipeline, SessionEnd};
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod preview;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_pipe", log::LevelFilter::Debug)
        .filter_module("live_recorder", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::AppConfig::from_args()?;

    #[cfg(feature = "ffmpeg")]
    {
        ffmpeg_pipe::ffmpeg::init().context("ffmpeg init")?;
        run(config, ffmpeg_pipe::ffmpeg::FfmpegBackend).await
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        use ffmpeg_pipe::synthetic::{SyntheticBackend, SyntheticSpec};
        log::warn!("built without ffmpeg, {} is replaced by a synthetic stream", config.input);
        let spec = SyntheticSpec::av()
            .endless()
            .with_packet_interval(std::time::Duration::from_millis(10));
        run(config, SyntheticBackend::new(spec)).await
    }
}

async fn run<B: MediaBackend>(config: config::AppConfig, backend: B) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (pipeline, events) = Pipeline::with_event_queue(config.pipeline()?, backend);
    let pipeline = Arc::new(pipeline);
    let monitor = Arc::new(preview::Monitor::default());
    let consumer = preview::spawn(events.clone(), monitor.clone(), config.preview_dir.clone());

    if let Some(port) = config.api_port {
        api::start_api_server(port, pipeline.clone(), monitor.clone(), cancel.clone());
    }

    let started = pipeline.start().await;
    let result = match started {
        Ok(()) => {
            let mut waiter = tokio::spawn({
                let pipeline = pipeline.clone();
                async move { pipeline.wait().await }
            });
            let summary = tokio::select! {
                summary = &mut waiter => summary,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupted, finishing the recording");
                    pipeline.request_stop();
                    waiter.await
                }
            };
            summary
                .context("pipeline worker panicked")?
                .context("waiting for pipeline")
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("cannot start recording from {}", config.input))),
    };

    events.close();
    cancel.cancel();
    if let Err(e) = consumer.await {
        log::warn!("event consumer failed: {}", e);
    }

    let summary = result?;
    let stats = summary.stats;
    log::info!(
        "session ended ({:?}): {} packets read, {} written, {} write failures, \
         {} video frames, {} audio buffers",
        summary.end,
        stats.packets_read,
        stats.packets_written,
        stats.write_failures,
        stats.video_frames,
        stats.audio_buffers
    );
    match summary.end {
        SessionEnd::EndOfStream | SessionEnd::Stopped => Ok(()),
        other => anyhow::bail!("recording ended early: {:?}", other),
    }
}

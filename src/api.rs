use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use ffmpeg_pipe::{MediaBackend, Pipeline, PipelineState, StatsSnapshot};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::preview::Monitor;

/// Read side of a pipeline, independent of its backend.
pub(crate) trait PipelineStatus: Send + Sync {
    fn state(&self) -> PipelineState;
    fn is_connected(&self) -> bool;
    fn stats(&self) -> StatsSnapshot;
    fn input(&self) -> &str;
}

impl<B: MediaBackend> PipelineStatus for Pipeline<B> {
    fn state(&self) -> PipelineState {
        Pipeline::state(self)
    }

    fn is_connected(&self) -> bool {
        Pipeline::is_connected(self)
    }

    fn stats(&self) -> StatsSnapshot {
        Pipeline::stats(self)
    }

    fn input(&self) -> &str {
        &self.config().input
    }
}

#[derive(Clone)]
struct ApiState {
    pipeline: Arc<dyn PipelineStatus>,
    monitor: Arc<Monitor>,
}

#[derive(Serialize)]
struct StatusResponse {
    input: String,
    state: String,
    connected: bool,
    last_status: Option<String>,
    frame_size: Option<(u32, u32)>,
    audio_peak_db: Option<f32>,
    snapshots: u64,
    counters: Counters,
}

#[derive(Serialize)]
struct Counters {
    packets_read: u64,
    packets_written: u64,
    write_failures: u64,
    packets_skipped: u64,
    decoder_not_ready: u64,
    video_frames: u64,
    audio_buffers: u64,
    frames_dropped: u64,
    events_dropped: u64,
}

impl From<StatsSnapshot> for Counters {
    fn from(s: StatsSnapshot) -> Self {
        Self {
            packets_read: s.packets_read,
            packets_written: s.packets_written,
            write_failures: s.write_failures,
            packets_skipped: s.packets_skipped,
            decoder_not_ready: s.decoder_not_ready,
            video_frames: s.video_frames,
            audio_buffers: s.audio_buffers,
            frames_dropped: s.frames_dropped,
            events_dropped: s.events_dropped,
        }
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .with_state(state)
}

pub(crate) fn start_api_server(
    port: u16,
    pipeline: Arc<dyn PipelineStatus>,
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let app = router(ApiState { pipeline, monitor });

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("cannot bind status endpoint on port {}: {}", port, e);
                return;
            }
        };
        log::info!("status endpoint listening on port {}", port);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("status endpoint failed: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down status endpoint");
}

async fn index() -> &'static str {
    "live-recorder"
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let monitor = &state.monitor;
    Json(StatusResponse {
        input: state.pipeline.input().to_string(),
        state: state.pipeline.state().to_string(),
        connected: state.pipeline.is_connected(),
        last_status: monitor.last_status(),
        frame_size: monitor.frame_size(),
        audio_peak_db: monitor.audio_peak_db().filter(|db| db.is_finite()),
        snapshots: monitor.snapshots(),
        counters: state.pipeline.stats().into(),
    })
}

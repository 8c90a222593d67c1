use std::{
    fmt::{Display, Formatter},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::MediaBackend,
    config::PipelineConfig,
    error::{PipelineError, Result},
    session::{self, SessionContext},
    sink::{EventQueue, PipelineSink},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Preparing = 1,
    Streaming = 2,
    Stopping = 3,
    Closed = 4,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Preparing,
            2 => PipelineState::Streaming,
            3 => PipelineState::Stopping,
            4 => PipelineState::Closed,
            _ => PipelineState::Idle,
        }
    }

    /// A session is running (or about to).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Preparing | PipelineState::Streaming | PipelineState::Stopping
        )
    }
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Preparing => "preparing",
            PipelineState::Streaming => "streaming",
            PipelineState::Stopping => "stopping",
            PipelineState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Counters of the current session. Reset by `start`.
#[derive(Default)]
pub struct PipelineStats {
    pub(crate) packets_read: AtomicU64,
    pub(crate) packets_written: AtomicU64,
    pub(crate) write_failures: AtomicU64,
    pub(crate) packets_skipped: AtomicU64,
    pub(crate) decoder_not_ready: AtomicU64,
    pub(crate) video_frames: AtomicU64,
    pub(crate) audio_buffers: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_read: u64,
    pub packets_written: u64,
    pub write_failures: u64,
    /// Packets of a stream the input never announced.
    pub packets_skipped: u64,
    /// Packets a decoder refused while it still had output pending.
    pub decoder_not_ready: u64,
    pub video_frames: u64,
    pub audio_buffers: u64,
    /// Decoded frames the converters could not handle.
    pub frames_dropped: u64,
    /// Events the sink queue evicted; zero when the pipeline has no queue.
    pub events_dropped: u64,
}

impl PipelineStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.packets_read,
            &self.packets_written,
            &self.write_failures,
            &self.packets_skipped,
            &self.decoder_not_ready,
            &self.video_frames,
            &self.audio_buffers,
            &self.frames_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            packets_skipped: self.packets_skipped.load(Ordering::Relaxed),
            decoder_not_ready: self.decoder_not_ready.load(Ordering::Relaxed),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_buffers: self.audio_buffers.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            events_dropped: 0,
        }
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    Stopped,
    ReadFailed(String),
    OutputLost(String),
}

#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub stats: StatsSnapshot,
}

/// State readable from any thread while the worker runs.
#[derive(Default)]
pub(crate) struct Shared {
    state: AtomicU8,
    connected: AtomicBool,
    pub(crate) stats: PipelineStats,
}

impl Shared {
    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        log::debug!("pipeline state -> {}", state);
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn try_begin(&self) -> bool {
        [PipelineState::Idle, PipelineState::Closed].into_iter().any(|from| {
            self.state
                .compare_exchange(
                    from as u8,
                    PipelineState::Preparing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }
}

/// Live capture pipeline: one input fanned out to a stream-copy recording, a video
/// preview path and an audio playback path.
///
/// At most one session runs at a time, on a dedicated blocking worker. A session that
/// reached `Closed` can be followed by a fresh one with another `start`.
pub struct Pipeline<B: MediaBackend> {
    config: PipelineConfig,
    backend: Arc<B>,
    sink: Arc<dyn PipelineSink>,
    events: Option<Arc<EventQueue>>,
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<SessionSummary>>>,
}

impl<B: MediaBackend> Pipeline<B> {
    pub fn new(config: PipelineConfig, backend: B, sink: Arc<dyn PipelineSink>) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            sink,
            events: None,
            shared: Arc::new(Shared::default()),
            cancel: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Pipeline delivering into a bounded [`EventQueue`] sized by the configuration.
    pub fn with_event_queue(config: PipelineConfig, backend: B) -> (Self, Arc<EventQueue>) {
        let queue = EventQueue::new(config.queue_capacity);
        let mut pipeline = Self::new(config, backend, queue.clone());
        pipeline.events = Some(queue.clone());
        (pipeline, queue)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.shared.stats.snapshot();
        if let Some(events) = &self.events {
            snapshot.events_dropped = events.dropped();
        }
        snapshot
    }

    /// Starts a new session. Resolves once the pipeline is streaming, or with the error
    /// that stopped it from getting there.
    pub async fn start(&self) -> Result<()> {
        // the state change and the token swap happen under one lock, so a concurrent
        // request_stop sees either the old state or the new token
        let cancel = {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.shared.try_begin() {
                return Err(PipelineError::AlreadyRunning);
            }
            let cancel = CancellationToken::new();
            *slot = Some(cancel.clone());
            cancel
        };
        self.shared.stats.reset();
        self.shared.set_connected(false);

        if let Some(previous) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            // the previous session reached Closed, its worker is done
            previous.abort();
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let context = SessionContext {
            config: self.config.clone(),
            backend: self.backend.clone(),
            sink: self.sink.clone(),
            shared: self.shared.clone(),
            cancel,
        };
        log::info!("starting pipeline {} -> {}", self.config.input, self.config.output.display());
        let handle = tokio::task::spawn_blocking(move || session::run(context, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e)
            }
            Err(_) => {
                let reason = match handle.await {
                    Err(e) => e.to_string(),
                    Ok(_) => "worker exited before reporting".to_string(),
                };
                self.shared.set_state(PipelineState::Closed);
                Err(PipelineError::WorkerFailed(reason))
            }
        }
    }

    /// Asks the running session to stop. The worker notices before its next read, so the
    /// stop completes within one packet plus one read timeout. No-op when nothing runs.
    pub fn request_stop(&self) {
        let slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(self.state(), PipelineState::Preparing | PipelineState::Streaming) {
            return;
        }
        if let Some(cancel) = slot.as_ref() {
            log::info!("stop requested");
            cancel.cancel();
        }
    }

    /// Waits for the current session to reach `Closed`.
    pub async fn wait(&self) -> Result<SessionSummary> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PipelineError::NotStarted)?;
        handle.await.map_err(|e| {
            self.shared.set_state(PipelineState::Closed);
            PipelineError::WorkerFailed(e.to_string())
        })
    }
}

impl<B: MediaBackend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;

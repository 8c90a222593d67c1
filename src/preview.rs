use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ffmpeg_pipe::{EventQueue, PipelineEvent, PixelBuffer, PreviewFormat, SampleBuffer};
use futures::StreamExt;
use jpeg_encoder::{ColorType, Encoder};
use tokio::task::JoinHandle;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_QUALITY: u8 = 80;
const SNAPSHOT_FILE: &str = "latest.jpg";

/// What the consumers saw so far, read by the status endpoint.
#[derive(Default)]
pub struct Monitor {
    connected: AtomicBool,
    last_status: Mutex<Option<String>>,
    video_frames: AtomicU64,
    audio_buffers: AtomicU64,
    snapshots: AtomicU64,
    /// Peak level of the last second of audio, dBFS.
    audio_peak_db: Mutex<Option<f32>>,
    frame_size: Mutex<Option<(u32, u32)>>,
}

impl Monitor {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn last_status(&self) -> Option<String> {
        self.last_status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_buffers(&self) -> u64 {
        self.audio_buffers.load(Ordering::Relaxed)
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }

    pub fn audio_peak_db(&self) -> Option<f32> {
        *self.audio_peak_db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        *self.frame_size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Running peak over a window of audio time.
#[derive(Debug, Default)]
pub struct PeakMeter {
    peak: f32,
    // sample frames in the current window
    window_frames: u64,
}

impl PeakMeter {
    /// Adds a buffer. Returns the window's peak in dBFS once a second of audio went by.
    pub fn push(&mut self, samples: &SampleBuffer) -> Option<f32> {
        let peak = samples.to_f32().iter().fold(0f32, |acc, s| acc.max(s.abs()));
        self.peak = self.peak.max(peak);
        self.window_frames += samples.frames as u64;
        let rate = u64::from(samples.format.sample_rate);
        if rate == 0 || self.window_frames < rate {
            return None;
        }
        let db = to_dbfs(self.peak);
        self.peak = 0.0;
        self.window_frames -= rate;
        Some(db)
    }
}

pub fn to_dbfs(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * amplitude.log10()
}

pub fn write_snapshot(frame: &PixelBuffer, path: &Path) -> anyhow::Result<()> {
    let width = u16::try_from(frame.width)?;
    let height = u16::try_from(frame.height)?;
    let color = match frame.format {
        PreviewFormat::Rgba => ColorType::Rgba,
        PreviewFormat::Bgra => ColorType::Bgra,
    };
    // write next to the target and rename so readers never see a partial file
    let tmp = path.with_extension("jpg.tmp");
    let encoder = Encoder::new_file(&tmp, SNAPSHOT_QUALITY)?;
    encoder.encode(&frame.data, width, height, color)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Drains the event queue until it closes: logs status and connection changes, meters
/// audio and snapshots the newest frame into `preview_dir` once per interval.
pub fn spawn(
    events: Arc<EventQueue>,
    monitor: Arc<Monitor>,
    preview_dir: Option<PathBuf>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(dir) = &preview_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                log::error!("cannot create preview dir {}: {}", dir.display(), e);
            }
        }
        let snapshot_path = preview_dir.map(|d| d.join(SNAPSHOT_FILE));
        let mut last_snapshot: Option<Instant> = None;
        let mut meter = PeakMeter::default();
        let mut stream = events.stream();

        while let Some(event) = stream.next().await {
            match event {
                PipelineEvent::Connection(connected) => {
                    log::info!("connection {}", if connected { "up" } else { "down" });
                    monitor.connected.store(connected, Ordering::Relaxed);
                }
                PipelineEvent::Status(message) => {
                    log::info!("status: {}", message);
                    *monitor
                        .last_status
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(message);
                }
                PipelineEvent::Video(frame) => {
                    monitor.video_frames.fetch_add(1, Ordering::Relaxed);
                    let size = (frame.width, frame.height);
                    *monitor.frame_size.lock().unwrap_or_else(PoisonError::into_inner) = Some(size);
                    let Some(path) = &snapshot_path else {
                        continue;
                    };
                    if last_snapshot.is_some_and(|t| t.elapsed() < SNAPSHOT_INTERVAL) {
                        continue;
                    }
                    last_snapshot = Some(Instant::now());
                    let path = path.clone();
                    match tokio::task::spawn_blocking(move || write_snapshot(&frame, &path)).await {
                        Ok(Ok(())) => {
                            monitor.snapshots.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => log::warn!("snapshot failed: {}", e),
                        Err(e) => log::warn!("snapshot task failed: {}", e),
                    }
                }
                PipelineEvent::Audio(samples) => {
                    monitor.audio_buffers.fetch_add(1, Ordering::Relaxed);
                    if let Some(db) = meter.push(&samples) {
                        log::debug!("audio peak {:.1} dBFS", db);
                        *monitor
                            .audio_peak_db
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(db);
                    }
                }
            }
        }
        log::debug!("event consumer finished");
    })
}

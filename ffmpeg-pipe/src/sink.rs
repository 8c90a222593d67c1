use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::Stream;
use tokio::sync::Notify;

use crate::frame::{PixelBuffer, SampleBuffer};

/// Consumer side of a running pipeline. Called from the pump worker, so implementations
/// must return quickly and never block on the consumer.
pub trait PipelineSink: Send + Sync {
    fn on_video_frame(&self, frame: PixelBuffer);

    fn on_audio_samples(&self, samples: SampleBuffer);

    fn on_status_message(&self, message: String);

    fn on_connection_state(&self, connected: bool);
}

#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Connection(bool),
    Status(String),
    Video(PixelBuffer),
    Audio(SampleBuffer),
}

impl PipelineEvent {
    fn is_media(&self) -> bool {
        matches!(self, PipelineEvent::Video(_) | PipelineEvent::Audio(_))
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub type EventStream = Pin<Box<dyn Stream<Item = PipelineEvent> + Send>>;

/// Bounded FIFO handing pipeline events to an async consumer.
///
/// Pushing never blocks. When the queue is full the oldest media event is evicted, then
/// the oldest status message; connection events are never evicted, so the queue may
/// briefly exceed its capacity by those alone.
pub struct EventQueue {
    events: Mutex<VecDeque<PipelineEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn push(&self, event: PipelineEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            if events.len() >= self.capacity {
                let victim = events
                    .iter()
                    .position(PipelineEvent::is_media)
                    .or_else(|| events.iter().position(|e| matches!(e, PipelineEvent::Status(_))));
                match victim {
                    Some(i) => {
                        events.remove(i);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    None if event.is_media() => {
                        // only connection events queued; the newcomer goes instead
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    None => {}
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn try_recv(&self) -> Option<PipelineEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Next event, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<PipelineEvent> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stops accepting events; receivers drain what is left and then end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stream(self: Arc<Self>) -> EventStream {
        Box::pin(futures::stream::unfold(self, |queue| async move {
            queue.recv().await.map(|event| (event, queue))
        }))
    }
}

impl PipelineSink for EventQueue {
    fn on_video_frame(&self, frame: PixelBuffer) {
        self.push(PipelineEvent::Video(frame));
    }

    fn on_audio_samples(&self, samples: SampleBuffer) {
        self.push(PipelineEvent::Audio(samples));
    }

    fn on_status_message(&self, message: String) {
        self.push(PipelineEvent::Status(message));
    }

    fn on_connection_state(&self, connected: bool) {
        self.push(PipelineEvent::Connection(connected));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;
    use crate::frame::PreviewFormat;

    fn video(pts: i64) -> PipelineEvent {
        PipelineEvent::Video(PixelBuffer {
            width: 1,
            height: 1,
            format: PreviewFormat::Rgba,
            data: Bytes::from_static(&[0, 0, 0, 255]),
            pts_ms: Some(pts),
        })
    }

    fn pts(event: &PipelineEvent) -> Option<i64> {
        match event {
            PipelineEvent::Video(frame) => frame.pts_ms,
            _ => None,
        }
    }

    #[test]
    fn test_full_queue_drops_oldest_media() {
        let queue = EventQueue::new(3);
        queue.push(PipelineEvent::Connection(true));
        queue.push(video(1));
        queue.push(video(2));
        queue.push(video(3));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        assert!(matches!(queue.try_recv(), Some(PipelineEvent::Connection(true))));
        assert_eq!(pts(&queue.try_recv().unwrap()), Some(2));
        assert_eq!(pts(&queue.try_recv().unwrap()), Some(3));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_status_evicted_after_media() {
        let queue = EventQueue::new(2);
        queue.push(PipelineEvent::Status("a".to_string()));
        queue.push(video(1));
        queue.push(PipelineEvent::Status("b".to_string()));
        // the video went first
        assert!(matches!(queue.try_recv(), Some(PipelineEvent::Status(s)) if s == "a"));
        assert!(matches!(queue.try_recv(), Some(PipelineEvent::Status(s)) if s == "b"));

        queue.push(PipelineEvent::Status("c".to_string()));
        queue.push(PipelineEvent::Status("d".to_string()));
        queue.push(PipelineEvent::Status("e".to_string()));
        assert!(matches!(queue.try_recv(), Some(PipelineEvent::Status(s)) if s == "d"));
    }

    #[test]
    fn test_connection_events_never_evicted() {
        let queue = EventQueue::new(1);
        queue.push(PipelineEvent::Connection(true));
        queue.push(video(1));
        queue.push(PipelineEvent::Connection(false));

        assert_eq!(queue.dropped(), 1);
        assert!(matches!(queue.try_recv(), Some(PipelineEvent::Connection(true))));
        assert!(matches!(queue.try_recv(), Some(PipelineEvent::Connection(false))));
    }

    #[tokio::test]
    async fn test_stream_ends_after_close() {
        let queue = EventQueue::new(8);
        let producer = queue.clone();
        tokio::spawn(async move {
            producer.on_connection_state(true);
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.on_status_message("streaming".to_string());
            producer.on_connection_state(false);
            producer.close();
            producer.on_status_message("ignored".to_string());
        });

        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(5), queue.stream().collect())
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], PipelineEvent::Connection(false)));
    }
}

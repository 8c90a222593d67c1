use std::collections::HashMap;

use thiserror::Error;

use crate::{
    error::{PipelineError, Result},
    packet::Packet,
    stream::StreamDescriptor,
    timebase::Timebase,
};

#[derive(Error, Debug)]
pub enum WriteError {
    /// This packet was rejected; later packets may still be written.
    #[error("{0}")]
    Packet(String),
    /// The destination is gone (closed socket, full disk, ...).
    #[error("{0}")]
    Fatal(String),
}

/// Container writer whose header has already been written, one output stream per input
/// stream with the same index.
pub trait PacketWriter: Send {
    /// Timebase the muxer chose for an output stream.
    fn time_base(&self, stream_index: usize) -> Option<Timebase>;

    fn write_interleaved(&mut self, packet: Packet) -> std::result::Result<(), WriteError>;

    fn write_trailer(&mut self) -> std::result::Result<(), WriteError>;

    /// Releases the destination. Called once, after the trailer.
    fn close(&mut self);
}

/// Stream copy of every input packet into the output container.
///
/// Once constructed the output is always finished: `close` (or drop) writes the trailer
/// and then releases the writer, exactly once.
pub struct RemuxStage<W: PacketWriter> {
    writer: Option<W>,
    // input index -> (input timebase, output timebase)
    timebases: HashMap<usize, (Timebase, Timebase)>,
    written: u64,
    failed: u64,
}

impl<W: PacketWriter> RemuxStage<W> {
    pub fn new(writer: W, streams: &[StreamDescriptor]) -> Result<Self> {
        let mut timebases = HashMap::with_capacity(streams.len());
        for stream in streams {
            let out = writer.time_base(stream.index()).ok_or_else(|| {
                PipelineError::HeaderWriteFailed(format!(
                    "no output stream for input stream {}",
                    stream.index()
                ))
            })?;
            log::debug!(
                "remux stream {} ({}): {} -> {}",
                stream.index(),
                stream.codec(),
                stream.time_base(),
                out
            );
            timebases.insert(stream.index(), (stream.time_base(), out));
        }
        Ok(Self {
            writer: Some(writer),
            timebases,
            written: 0,
            failed: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Whether the output has a stream for this input index.
    pub fn has_stream(&self, stream_index: usize) -> bool {
        self.timebases.contains_key(&stream_index)
    }

    /// Rescales the packet into its output stream's timebase and writes it interleaved.
    ///
    /// `WriteFailed` leaves the output usable; `OutputLost` means it is not.
    pub fn write_packet(&mut self, mut packet: Packet) -> Result<()> {
        let index = packet.stream_index();
        let Some(writer) = self.writer.as_mut() else {
            return Err(PipelineError::OutputLost("output already closed".to_string()));
        };
        let Some(&(from, to)) = self.timebases.get(&index) else {
            self.failed += 1;
            return Err(PipelineError::WriteFailed {
                stream_index: index,
                reason: "no output stream".to_string(),
            });
        };

        packet.rescale_ts(from, to);
        packet.reset_position();
        log::trace!(
            "write packet stream={} pts={:?} dts={:?} size={}",
            index,
            packet.pts(),
            packet.dts(),
            packet.size()
        );
        match writer.write_interleaved(packet) {
            Ok(()) => {
                self.written += 1;
                Ok(())
            }
            Err(WriteError::Packet(reason)) => {
                self.failed += 1;
                Err(PipelineError::WriteFailed {
                    stream_index: index,
                    reason,
                })
            }
            Err(WriteError::Fatal(reason)) => {
                self.failed += 1;
                Err(PipelineError::OutputLost(reason))
            }
        }
    }

    /// Writes the trailer, then releases the writer. No-op after the first call.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let trailer = writer.write_trailer();
        writer.close();
        log::info!(
            "output closed: {} packets written, {} failed",
            self.written,
            self.failed
        );
        trailer.map_err(|e| PipelineError::OutputLost(format!("trailer: {}", e)))
    }
}

impl<W: PacketWriter> Drop for RemuxStage<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("finishing output on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        frame::{PixelFormat, SampleFormat, SampleLayout},
        stream::{AudioParams, VideoParams},
    };

    #[derive(Default)]
    struct Log {
        packets: Vec<Packet>,
        calls: Vec<&'static str>,
    }

    struct MemoryWriter {
        log: Arc<Mutex<Log>>,
        fail_next: Option<WriteError>,
    }

    impl PacketWriter for MemoryWriter {
        fn time_base(&self, stream_index: usize) -> Option<Timebase> {
            match stream_index {
                0 => Some(Timebase::new(1, 90000)),
                1 => Some(Timebase::new(1, 48000)),
                _ => None,
            }
        }

        fn write_interleaved(&mut self, packet: Packet) -> std::result::Result<(), WriteError> {
            if let Some(err) = self.fail_next.take() {
                return Err(err);
            }
            self.log.lock().unwrap().packets.push(packet);
            Ok(())
        }

        fn write_trailer(&mut self) -> std::result::Result<(), WriteError> {
            self.log.lock().unwrap().calls.push("trailer");
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().calls.push("close");
        }
    }

    fn streams() -> Vec<StreamDescriptor> {
        vec![
            StreamDescriptor::video(
                0,
                "h264",
                Timebase::new(1, 30),
                VideoParams {
                    width: 320,
                    height: 240,
                    pixel_format: PixelFormat::Yuv420p,
                },
            ),
            StreamDescriptor::audio(
                1,
                "aac",
                Timebase::new(1, 1000),
                AudioParams {
                    sample_rate: 48000,
                    channels: 2,
                    sample_format: SampleFormat::F32(SampleLayout::Planar),
                },
            ),
        ]
    }

    fn stage(log: &Arc<Mutex<Log>>) -> RemuxStage<MemoryWriter> {
        let writer = MemoryWriter {
            log: log.clone(),
            fail_next: None,
        };
        RemuxStage::new(writer, &streams()).unwrap()
    }

    #[test]
    fn test_write_rescales_and_resets_position() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut remux = stage(&log);

        let packet = Packet::new(0, vec![9, 9])
            .with_pts(Some(3))
            .with_dts(Some(2))
            .with_duration(1)
            .with_position(Some(1234));
        remux.write_packet(packet).unwrap();
        remux
            .write_packet(Packet::new(1, vec![7]).with_pts(Some(21)).with_duration(21))
            .unwrap();

        let log = log.lock().unwrap();
        let video = &log.packets[0];
        assert_eq!(video.pts(), Some(9000));
        assert_eq!(video.dts(), Some(6000));
        assert_eq!(video.duration(), 3000);
        assert_eq!(video.position(), None);
        assert_eq!(video.data().as_ref(), &[9, 9]);
        assert_eq!(log.packets[1].pts(), Some(1008));
        assert_eq!(log.packets[1].duration(), 1008);
    }

    #[test]
    fn test_packet_failure_is_recoverable() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut remux = stage(&log);
        remux.writer.as_mut().unwrap().fail_next = Some(WriteError::Packet("einval".to_string()));

        let err = remux.write_packet(Packet::new(0, vec![1]).with_pts(Some(0))).unwrap_err();
        assert!(matches!(err, PipelineError::WriteFailed { stream_index: 0, .. }));
        remux.write_packet(Packet::new(0, vec![1]).with_pts(Some(1))).unwrap();
        assert_eq!(remux.written(), 1);
        assert_eq!(remux.failed(), 1);
    }

    #[test]
    fn test_fatal_failure_is_output_lost() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut remux = stage(&log);
        remux.writer.as_mut().unwrap().fail_next =
            Some(WriteError::Fatal("broken pipe".to_string()));
        let err = remux.write_packet(Packet::new(1, vec![1])).unwrap_err();
        assert!(matches!(err, PipelineError::OutputLost(_)));
    }

    #[test]
    fn test_unknown_stream_is_rejected() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut remux = stage(&log);
        assert!(!remux.has_stream(5));
        assert!(remux.write_packet(Packet::new(5, vec![1])).is_err());
        assert!(log.lock().unwrap().packets.is_empty());
    }

    #[test]
    fn test_close_is_ordered_and_idempotent() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut remux = stage(&log);
        remux.close().unwrap();
        remux.close().unwrap();
        drop(remux);
        assert_eq!(log.lock().unwrap().calls, vec!["trailer", "close"]);
    }

    #[test]
    fn test_drop_finishes_output() {
        let log = Arc::new(Mutex::new(Log::default()));
        {
            let _remux = stage(&log);
        }
        assert_eq!(log.lock().unwrap().calls, vec!["trailer", "close"]);
    }
}

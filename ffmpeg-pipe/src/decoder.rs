use thiserror::Error;

use crate::{
    classify::Role,
    error::PipelineError,
    frame::DecodedFrame,
    packet::Packet,
};

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The decoder wants its pending output drained before taking more input.
    #[error("decoder not ready for input")]
    NotReady,
    #[error("malformed bitstream: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Failed(String),
}

pub enum DecodeStatus {
    Frame(DecodedFrame),
    /// Nothing buffered; feed the next packet.
    NeedMoreInput,
    /// The decoder has been fully flushed.
    EndOfStream,
}

/// Send/receive decoder, one instance per stream.
pub trait FrameDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError>;

    fn send_eof(&mut self) -> Result<(), DecodeError>;

    fn receive_frame(&mut self) -> Result<DecodeStatus, DecodeError>;
}

/// Decode path of one role. A fatal error releases the decoder and leaves the stage
/// inactive for the rest of the session.
pub struct DecodeStage<D: FrameDecoder> {
    role: Role,
    codec: String,
    decoder: Option<D>,
    submitted: u64,
    decoded: u64,
    not_ready: u64,
    failure: Option<String>,
}

impl<D: FrameDecoder> DecodeStage<D> {
    pub fn new(role: Role, codec: impl Into<String>, decoder: D) -> Self {
        Self {
            role,
            codec: codec.into(),
            decoder: Some(decoder),
            submitted: 0,
            decoded: 0,
            not_ready: 0,
            failure: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn is_active(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Packets the decoder accepted.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Packets dropped because the decoder was not ready for them.
    pub fn not_ready(&self) -> u64 {
        self.not_ready
    }

    /// Hands one packet to the decoder. Returns `Ok(false)` when the decoder refused it
    /// as not ready: the packet is dropped for this path, never resubmitted.
    pub fn submit(&mut self, packet: &Packet) -> Result<bool, PipelineError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(false);
        };
        match decoder.send_packet(packet) {
            Ok(()) => {
                self.submitted += 1;
                Ok(true)
            }
            Err(DecodeError::NotReady) => {
                self.not_ready += 1;
                log::debug!(
                    "{} decoder not ready, dropping packet pts={:?}",
                    self.role,
                    packet.pts()
                );
                Ok(false)
            }
            Err(e) => Err(self.disable(e.to_string())),
        }
    }

    /// Frames ready after the last `submit`. The sequence ends when the decoder needs more
    /// input; an error item means the stage has just been disabled.
    pub fn drain(&mut self) -> Drain<'_, D> {
        Drain {
            stage: self,
            flushing: false,
            done: false,
            pending: None,
        }
    }

    /// Signals end of input and yields whatever the decoder still buffers.
    /// A decoder refusing end of input is disabled and the sequence yields that error.
    pub fn flush(&mut self) -> Drain<'_, D> {
        let (done, pending) = match self.decoder.as_mut().map(|d| d.send_eof()) {
            Some(Ok(())) => (false, None),
            Some(Err(e)) => (true, Some(self.disable(format!("flush failed: {}", e)))),
            None => (true, None),
        };
        Drain {
            stage: self,
            flushing: true,
            done,
            pending,
        }
    }

    fn disable(&mut self, reason: String) -> PipelineError {
        log::error!("{} decoder ({}) disabled: {}", self.role, self.codec, reason);
        self.decoder = None;
        self.failure = Some(reason.clone());
        PipelineError::DecodeFatal {
            role: self.role,
            reason,
        }
    }
}

pub struct Drain<'a, D: FrameDecoder> {
    stage: &'a mut DecodeStage<D>,
    flushing: bool,
    done: bool,
    pending: Option<PipelineError>,
}

impl<D: FrameDecoder> Iterator for Drain<'_, D> {
    type Item = Result<DecodedFrame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.pending.take() {
            return Some(Err(error));
        }
        if self.done {
            return None;
        }
        let Some(decoder) = self.stage.decoder.as_mut() else {
            self.done = true;
            return None;
        };
        match decoder.receive_frame() {
            Ok(DecodeStatus::Frame(frame)) => {
                self.stage.decoded += 1;
                Some(Ok(frame))
            }
            Ok(DecodeStatus::NeedMoreInput) | Err(DecodeError::NotReady) => {
                self.done = true;
                None
            }
            Ok(DecodeStatus::EndOfStream) => {
                self.done = true;
                if self.flushing {
                    None
                } else {
                    Some(Err(self.stage.disable("decoder reached end of stream".to_string())))
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(self.stage.disable(e.to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use super::*;
    use crate::{
        frame::{AudioFrame, SampleFormat, SampleLayout},
        timebase::Timebase,
    };

    #[derive(Default)]
    struct ScriptedDecoder {
        // statuses returned by receive_frame, in order; NeedMoreInput when empty
        script: VecDeque<Result<DecodeStatus, DecodeError>>,
        send_results: VecDeque<Result<(), DecodeError>>,
        eof_result: Option<DecodeError>,
        sent: usize,
        eof: bool,
    }

    impl FrameDecoder for ScriptedDecoder {
        fn send_packet(&mut self, _packet: &Packet) -> Result<(), DecodeError> {
            self.sent += 1;
            self.send_results.pop_front().unwrap_or(Ok(()))
        }

        fn send_eof(&mut self) -> Result<(), DecodeError> {
            self.eof = true;
            match self.eof_result.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn receive_frame(&mut self) -> Result<DecodeStatus, DecodeError> {
            match self.script.pop_front() {
                Some(status) => status,
                None if self.eof => Ok(DecodeStatus::EndOfStream),
                None => Ok(DecodeStatus::NeedMoreInput),
            }
        }
    }

    fn frame() -> DecodedFrame {
        DecodedFrame::Audio(AudioFrame {
            sample_rate: 48000,
            channels: 1,
            format: SampleFormat::I16(SampleLayout::Packed),
            samples: 1,
            planes: vec![Bytes::from_static(&[0, 0])],
            pts: Some(0),
            time_base: Timebase::new(1, 48000),
        })
    }

    fn packet() -> Packet {
        Packet::new(1, vec![0u8; 4]).with_pts(Some(0))
    }

    #[test]
    fn test_drain_stops_on_need_more_input() {
        let mut decoder = ScriptedDecoder::default();
        decoder.script.push_back(Ok(DecodeStatus::Frame(frame())));
        decoder.script.push_back(Ok(DecodeStatus::Frame(frame())));
        let mut stage = DecodeStage::new(Role::Audio, "pcm", decoder);

        assert!(stage.submit(&packet()).unwrap());
        let frames: Vec<_> = stage.drain().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.is_ok()));
        assert!(stage.is_active());
        assert_eq!(stage.decoded(), 2);

        // nothing buffered: empty drain, still active
        assert_eq!(stage.drain().count(), 0);
        assert!(stage.is_active());
    }

    #[test]
    fn test_not_ready_packet_is_dropped_not_resubmitted() {
        let mut decoder = ScriptedDecoder::default();
        decoder.send_results.push_back(Err(DecodeError::NotReady));
        let mut stage = DecodeStage::new(Role::Video, "h264", decoder);

        assert!(!stage.submit(&packet()).unwrap());
        assert!(stage.submit(&packet()).unwrap());
        assert_eq!(stage.submitted(), 1);
        assert_eq!(stage.not_ready(), 1);
        assert_eq!(stage.decoder.as_ref().unwrap().sent, 2);
    }

    #[test]
    fn test_end_of_stream_while_streaming_disables_stage() {
        let mut decoder = ScriptedDecoder::default();
        decoder.script.push_back(Ok(DecodeStatus::Frame(frame())));
        decoder.script.push_back(Ok(DecodeStatus::EndOfStream));
        let mut stage = DecodeStage::new(Role::Audio, "aac", decoder);

        stage.submit(&packet()).unwrap();
        let results: Vec<_> = stage.drain().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(PipelineError::DecodeFatal { role: Role::Audio, .. })
        ));
        assert!(!stage.is_active());
        assert!(stage.failure().is_some());
        // disabled stage ignores further input
        assert!(!stage.submit(&packet()).unwrap());
        assert_eq!(stage.drain().count(), 0);
    }

    #[test]
    fn test_malformed_data_disables_stage() {
        let mut decoder = ScriptedDecoder::default();
        decoder
            .script
            .push_back(Err(DecodeError::InvalidData("bad nal".to_string())));
        let mut stage = DecodeStage::new(Role::Video, "h264", decoder);

        stage.submit(&packet()).unwrap();
        let err = stage.drain().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("bad nal"));
        assert!(!stage.is_active());
    }

    #[test]
    fn test_submit_failure_disables_stage() {
        let mut decoder = ScriptedDecoder::default();
        decoder
            .send_results
            .push_back(Err(DecodeError::Failed("codec exploded".to_string())));
        let mut stage = DecodeStage::new(Role::Video, "h264", decoder);
        assert!(stage.submit(&packet()).is_err());
        assert!(!stage.is_active());
    }

    #[test]
    fn test_flush_yields_buffered_frames_then_stops() {
        let mut decoder = ScriptedDecoder::default();
        decoder.script.push_back(Ok(DecodeStatus::Frame(frame())));
        let mut stage = DecodeStage::new(Role::Audio, "aac", decoder);

        let results: Vec<_> = stage.flush().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        // end of stream during flush is expected
        assert!(stage.is_active());
    }

    #[test]
    fn test_flush_failure_is_reported_and_disables_stage() {
        let mut decoder = ScriptedDecoder::default();
        decoder.eof_result = Some(DecodeError::Failed("device lost".to_string()));
        let mut stage = DecodeStage::new(Role::Video, "h264", decoder);

        let results: Vec<_> = stage.flush().collect();
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::DecodeFatal { role: Role::Video, .. }));
        assert!(err.to_string().contains("device lost"));
        assert!(!stage.is_active());
        assert!(stage.flush().next().is_none());
    }
}

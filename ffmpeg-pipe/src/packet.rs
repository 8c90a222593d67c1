use bytes::Bytes;

use crate::timebase::{Timebase, rescale, rescale_opt};

/// One demuxed, still-encoded access unit.
///
/// The payload is reference counted, so handing a packet to both the remux and a decode
/// path never copies it.
#[derive(Clone, Debug)]
pub struct Packet {
    stream_index: usize,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    // byte offset in the source container, None once it no longer applies
    position: Option<i64>,
    is_key: bool,
    data: Bytes,
}

impl Packet {
    pub fn new(stream_index: usize, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            position: None,
            is_key: false,
            data: data.into(),
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: Option<i64>) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_position(mut self, position: Option<i64>) -> Self {
        self.position = position;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn position(&self) -> Option<i64> {
        self.position
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn set_stream_index(&mut self, stream_index: usize) {
        self.stream_index = stream_index;
    }

    /// Moves pts, dts and duration from `from` ticks to `to` ticks.
    pub fn rescale_ts(&mut self, from: Timebase, to: Timebase) {
        self.pts = rescale_opt(self.pts, from, to);
        self.dts = rescale_opt(self.dts, from, to);
        self.duration = rescale(self.duration, from, to);
    }

    pub fn reset_position(&mut self) {
        self.position = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_ts_keeps_missing_timestamps() {
        let mut packet = Packet::new(0, vec![1, 2, 3])
            .with_pts(Some(10))
            .with_dts(None)
            .with_duration(1)
            .with_position(Some(4096));
        packet.rescale_ts(Timebase::new(1, 30), Timebase::new(1, 90000));
        assert_eq!(packet.pts(), Some(30000));
        assert_eq!(packet.dts(), None);
        assert_eq!(packet.duration(), 3000);
        // position is only reset explicitly
        assert_eq!(packet.position(), Some(4096));
        packet.reset_position();
        assert_eq!(packet.position(), None);
        assert_eq!(packet.data().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_clone_shares_payload() {
        let packet = Packet::new(1, Bytes::from_static(b"payload")).with_key(true);
        let copy = packet.clone();
        assert_eq!(packet.data().as_ptr(), copy.data().as_ptr());
        assert!(copy.is_key());
        assert_eq!(copy.size(), 7);
    }
}

use std::time::Duration;

use crate::{error::Result, packet::Packet, stream::StreamDescriptor};

/// Default connect and read timeout for live inputs.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceOptions {
    /// Bound on connect and handshake.
    pub connect_timeout: Duration,
    /// Bound on a single blocking read.
    pub read_timeout: Duration,
    /// Wait for a publisher instead of connecting out (RTMP server mode).
    pub listen: bool,
    /// Max bytes read while probing stream info.
    pub probe_size: Option<u32>,
    /// Max media duration analyzed while probing stream info.
    pub analyze_duration: Option<Duration>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            listen: false,
            probe_size: None,
            analyze_duration: None,
        }
    }
}

/// Ordered packet input.
pub trait PacketSource: Send {
    /// One descriptor per elementary stream, indexed by stream index.
    fn streams(&self) -> &[StreamDescriptor];

    /// Next packet, `Ok(None)` at end of stream. Must return within the read timeout.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Releases the input. Calling it again is a no-op.
    fn close(&mut self);
}

//! Pipeline error types.

use thiserror::Error;

use crate::{classify::Role, stream::MediaKind};

/// Pipeline error type.
///
/// Startup errors (`OpenFailed` through `DecoderOpenFailed`) abort the session before
/// any packet is written. Streaming errors are handled per kind by the pump loop.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The input could not be opened (connect, handshake or timeout).
    #[error("failed to open input {url}: {reason}")]
    OpenFailed { url: String, reason: String },

    /// Not enough data to describe the input streams.
    #[error("failed to probe stream info: {0}")]
    ProbeFailed(String),

    /// A stream role the configuration requires is absent.
    #[error("required {0} stream missing from input")]
    RequiredStreamMissing(MediaKind),

    /// The output container could not be allocated.
    #[error("failed to create output {path}: {reason}")]
    OutputCreateFailed { path: String, reason: String },

    /// The output destination could not be opened for writing.
    #[error("failed to open output {path}: {reason}")]
    OutputOpenFailed { path: String, reason: String },

    /// The container header was rejected.
    #[error("failed to write container header: {0}")]
    HeaderWriteFailed(String),

    /// No decoder implementation for the codec.
    #[error("no decoder available for codec {0}")]
    DecoderUnavailable(String),

    /// A decoder was found but could not be opened.
    #[error("failed to open {codec} decoder: {reason}")]
    DecoderOpenFailed { codec: String, reason: String },

    /// A decode path failed and has been shut down.
    #[error("{role} decoding failed: {reason}")]
    DecodeFatal { role: Role, reason: String },

    /// Reading from the input failed.
    #[error("failed to read packet: {0}")]
    ReadFailed(String),

    /// A single packet could not be written; the output is still usable.
    #[error("failed to write packet on stream {stream_index}: {reason}")]
    WriteFailed { stream_index: usize, reason: String },

    /// The output is no longer writable.
    #[error("output lost: {0}")]
    OutputLost(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start` was called while a session is active.
    #[error("pipeline already running")]
    AlreadyRunning,

    /// `wait` was called without a session to wait for.
    #[error("pipeline not started")]
    NotStarted,

    /// The pump worker panicked or was cancelled by the runtime.
    #[error("pipeline worker failed: {0}")]
    WorkerFailed(String),
}

impl PipelineError {
    /// True for errors that can only happen while preparing a session.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::OpenFailed { .. }
                | Self::ProbeFailed(_)
                | Self::RequiredStreamMissing(_)
                | Self::OutputCreateFailed { .. }
                | Self::OutputOpenFailed { .. }
                | Self::HeaderWriteFailed(_)
                | Self::DecoderUnavailable(_)
                | Self::DecoderOpenFailed { .. }
        )
    }
}

/// Pipeline result type.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Per-frame conversion failure. The frame is dropped and the path keeps running.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error("unsupported {0}")]
    Unsupported(String),
    #[error("plane {plane} too short: {len} < {expected}")]
    ShortPlane {
        plane: usize,
        len: usize,
        expected: usize,
    },
    #[error("invalid frame geometry {0}")]
    InvalidGeometry(String),
    #[error("{0}")]
    Backend(String),
}

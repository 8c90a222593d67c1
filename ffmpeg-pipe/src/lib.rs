//! Live ingest pipeline: one network or file input is stream-copied into a local
//! container while its video and audio are decoded for preview and playback sinks.

pub mod backend;
pub mod classify;
pub mod config;
pub mod decoder;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod resampler;
pub mod scaler;
mod session;
pub mod sink;
pub mod source;
pub mod stream;
pub mod synthetic;
pub mod timebase;

pub use backend::MediaBackend;
pub use classify::{Role, StreamRequirement};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ConvertError, PipelineError, Result};
pub use frame::{PixelBuffer, PreviewFormat, SampleBuffer, SinkFormat};
pub use pipeline::{Pipeline, PipelineState, SessionEnd, SessionSummary, StatsSnapshot};
pub use sink::{EventQueue, PipelineEvent, PipelineSink};
pub use timebase::Timebase;

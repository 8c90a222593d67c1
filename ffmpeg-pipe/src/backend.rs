use std::path::Path;

use crate::{
    decoder::FrameDecoder,
    error::Result,
    output::PacketWriter,
    source::{PacketSource, SourceOptions},
    stream::StreamDescriptor,
};

/// Media library behind a pipeline: demuxer, muxer and decoders.
pub trait MediaBackend: Send + Sync + 'static {
    type Source: PacketSource + 'static;
    type Writer: PacketWriter + 'static;
    type Decoder: FrameDecoder + 'static;

    /// Connects to the input and probes its streams.
    fn open_source(&self, url: &str, options: &SourceOptions) -> Result<Self::Source>;

    /// Creates the output container with one stream per source stream, in the same order,
    /// and writes its header.
    fn create_output(&self, path: &Path, source: &Self::Source) -> Result<Self::Writer>;

    fn open_decoder(&self, source: &Self::Source, stream: &StreamDescriptor)
    -> Result<Self::Decoder>;
}

use std::{path::PathBuf, time::Duration};

use crate::{
    classify::StreamRequirement,
    error::{PipelineError, Result},
    frame::{PreviewFormat, SinkFormat},
    sink::DEFAULT_QUEUE_CAPACITY,
    source::SourceOptions,
};

/// Everything a session needs, fixed once `start` is called.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub input: String,
    pub output: PathBuf,
    pub requirement: StreamRequirement,
    pub source: SourceOptions,
    pub preview_format: PreviewFormat,
    pub audio_sink: SinkFormat,
    pub queue_capacity: usize,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    input: Option<String>,
    output: Option<PathBuf>,
    requirement: StreamRequirement,
    source: SourceOptions,
    preview_format: PreviewFormat,
    audio_sink: Option<SinkFormat>,
    queue_capacity: Option<usize>,
}

impl PipelineConfigBuilder {
    /// Input URL, e.g. `rtmp://host/app/key` or a local file path.
    pub fn input(mut self, url: impl Into<String>) -> Self {
        self.input = Some(url.into());
        self
    }

    /// Destination of the stream copy. The container is picked from the extension.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn video_only(mut self) -> Self {
        self.requirement = StreamRequirement::VideoOnly;
        self
    }

    pub fn requirement(mut self, requirement: StreamRequirement) -> Self {
        self.requirement = requirement;
        self
    }

    /// Connect and read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.source.connect_timeout = timeout;
        self.source.read_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.source.read_timeout = timeout;
        self
    }

    /// Accept an incoming publisher on the input URL instead of connecting to it.
    pub fn listen(mut self, listen: bool) -> Self {
        self.source.listen = listen;
        self
    }

    pub fn probe_size(mut self, bytes: u32) -> Self {
        self.source.probe_size = Some(bytes);
        self
    }

    pub fn analyze_duration(mut self, duration: Duration) -> Self {
        self.source.analyze_duration = Some(duration);
        self
    }

    pub fn preview_format(mut self, format: PreviewFormat) -> Self {
        self.preview_format = format;
        self
    }

    pub fn audio_sink(mut self, format: SinkFormat) -> Self {
        self.audio_sink = Some(format);
        self
    }

    /// Capacity of the event queue handed out by `Pipeline::with_event_queue`.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let input = self
            .input
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PipelineError::InvalidConfig("input is required".to_string()))?;
        let output = self
            .output
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| PipelineError::InvalidConfig("output is required".to_string()))?;
        if self.source.connect_timeout.is_zero() || self.source.read_timeout.is_zero() {
            return Err(PipelineError::InvalidConfig("timeout must be positive".to_string()));
        }
        let audio_sink = self
            .audio_sink
            .map(|f| SinkFormat::new(f.sample_rate, f.channels, f.sample_format))
            .unwrap_or_default();
        if audio_sink.sample_rate == 0
            || audio_sink.channels == 0
            || audio_sink.sample_format.bytes_per_sample().is_none()
        {
            return Err(PipelineError::InvalidConfig(format!(
                "unusable audio sink format {:?}",
                audio_sink
            )));
        }
        let queue_capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig("queue capacity must be positive".to_string()));
        }

        Ok(PipelineConfig {
            input,
            output,
            requirement: self.requirement,
            source: self.source,
            preview_format: self.preview_format,
            audio_sink,
            queue_capacity,
        })
    }
}

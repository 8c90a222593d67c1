use std::path::{Path, PathBuf};

use futures::StreamExt;

use super::FfmpegBackend;
use crate::{
    config::PipelineConfig,
    pipeline::{Pipeline, SessionEnd},
    sink::PipelineEvent,
};

/// Sample clip with one video and one audio stream, set through LIVE_RECORDER_TEST_INPUT.
fn test_input() -> Option<PathBuf> {
    std::env::var_os("LIVE_RECORDER_TEST_INPUT")
        .map(PathBuf::from)
        .filter(|p| p.exists())
}

#[tokio::test]
async fn test_file_input_is_recorded_and_previewed() -> anyhow::Result<()> {
    let Some(input) = test_input() else {
        eprintln!("skip: LIVE_RECORDER_TEST_INPUT not set");
        return Ok(());
    };
    super::init()?;

    let output = std::env::temp_dir().join("live-recorder-ffmpeg-test.mkv");
    if output.exists() {
        std::fs::remove_file(&output)?;
    }

    let config = PipelineConfig::builder()
        .input(input.to_string_lossy())
        .output(&output)
        .queue_capacity(1024)
        .build()?;
    let (pipeline, events) = Pipeline::with_event_queue(config, FfmpegBackend);
    pipeline.start().await?;

    let consumer = tokio::spawn(async move {
        let mut stream = events.stream();
        let (mut video, mut audio) = (0usize, 0usize);
        while let Some(event) = stream.next().await {
            match event {
                PipelineEvent::Video(frame) => {
                    assert_eq!(frame.data.len(), frame.stride() * frame.height as usize);
                    video += 1;
                }
                PipelineEvent::Audio(samples) => {
                    assert_eq!(samples.format.channels, 2);
                    audio += 1;
                }
                PipelineEvent::Connection(false) => break,
                _ => {}
            }
        }
        (video, audio)
    });

    let summary = pipeline.wait().await?;
    assert_eq!(summary.end, SessionEnd::EndOfStream);
    assert_eq!(summary.stats.packets_read, summary.stats.packets_written);
    let (video, audio) = consumer.await?;
    assert!(video > 0, "expected preview frames");
    assert!(audio > 0, "expected audio buffers");

    verify_output(&input, &output)
}

#[tokio::test]
async fn test_unreachable_input_fails_startup() -> anyhow::Result<()> {
    super::init()?;
    let output = std::env::temp_dir().join("live-recorder-unreachable.mkv");
    let config = PipelineConfig::builder()
        .input("/nonexistent/live.flv")
        .output(&output)
        .build()?;
    let (pipeline, _events) = Pipeline::with_event_queue(config, FfmpegBackend);

    let err = pipeline.start().await.err().expect("start should fail");
    assert!(err.is_startup());
    assert!(!output.exists());
    Ok(())
}

/// The recording has the same streams as the input and at least one packet per stream.
fn verify_output(input: &Path, output: &Path) -> anyhow::Result<()> {
    assert!(output.exists(), "recording should exist");
    let source = ffmpeg_next::format::input(&input)
        .map_err(|e| anyhow::anyhow!("input should open: {}", e))?;
    let mut recorded = ffmpeg_next::format::input(&output)
        .map_err(|e| anyhow::anyhow!("recording should be a valid container: {}", e))?;
    assert_eq!(source.nb_streams(), recorded.nb_streams());

    let mut counts = vec![0usize; recorded.nb_streams() as usize];
    for (stream, _packet) in recorded.packets() {
        counts[stream.index()] += 1;
    }
    assert!(counts.iter().all(|&c| c > 0), "every stream should have packets: {:?}", counts);
    Ok(())
}

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use ffmpeg_pipe::{PipelineConfig, PreviewFormat};
use serde::Deserialize;

pub const DEFAULT_API_PORT: u16 = 8080;

/// Settings read from `--config`. Command line flags take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub input: Option<String>,
    pub output: Option<PathBuf>,
    pub video_only: Option<bool>,
    pub timeout: Option<u64>,
    pub listen: Option<bool>,
    pub preview_dir: Option<PathBuf>,
    pub api_port: Option<u16>,
    pub preview_format: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub input: String,
    pub output: PathBuf,
    pub video_only: bool,
    pub timeout: Duration,
    pub listen: bool,
    pub preview_dir: Option<PathBuf>,
    /// `None` disables the status endpoint.
    pub api_port: Option<u16>,
    pub preview_format: PreviewFormat,
}

pub fn command() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Records a live stream to a file while previewing its video and audio")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("URL")
                .help("Input URL (rtmp://, srt://, http://) or local file."),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Recording path, the container follows the extension."),
        )
        .arg(
            Arg::new("video-only")
                .long("video-only")
                .action(ArgAction::SetTrue)
                .help("Accept inputs without an audio stream."),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECS")
                .value_parser(value_parser!(u64).range(1..))
                .help("Connect and read timeout in seconds [default: 10]."),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .action(ArgAction::SetTrue)
                .help("Wait for a publisher on the input URL instead of connecting to it."),
        )
        .arg(
            Arg::new("preview-dir")
                .long("preview-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Write a JPEG snapshot of the latest frame to this directory."),
        )
        .arg(
            Arg::new("api-port")
                .long("api-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Port of the status endpoint, 0 disables it [default: 8080]."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("JSON file with the same settings."),
        )
}

impl AppConfig {
    pub fn from_args() -> anyhow::Result<Self> {
        Self::from_matches(&command().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let file = match matches.get_one::<PathBuf>("config") {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(matches, file)
    }

    fn merge(matches: &ArgMatches, file: FileConfig) -> anyhow::Result<Self> {
        let input = matches
            .get_one::<String>("input")
            .cloned()
            .or(file.input)
            .context("no input given, pass --input or set it in the config file")?;
        let output = matches
            .get_one::<PathBuf>("output")
            .cloned()
            .or(file.output)
            .context("no output given, pass --output or set it in the config file")?;
        let timeout = matches
            .get_one::<u64>("timeout")
            .copied()
            .or(file.timeout)
            .map(Duration::from_secs)
            .unwrap_or(ffmpeg_pipe::source::DEFAULT_TIMEOUT);
        let api_port = matches
            .get_one::<u16>("api-port")
            .copied()
            .or(file.api_port)
            .unwrap_or(DEFAULT_API_PORT);
        let preview_format = match file.preview_format.as_deref() {
            None | Some("rgba") => PreviewFormat::Rgba,
            Some("bgra") => PreviewFormat::Bgra,
            Some(other) => {
                anyhow::bail!("unknown preview format {:?}, expected rgba or bgra", other)
            }
        };

        Ok(Self {
            input,
            output,
            video_only: matches.get_flag("video-only") || file.video_only.unwrap_or(false),
            timeout,
            listen: matches.get_flag("listen") || file.listen.unwrap_or(false),
            preview_dir: matches.get_one::<PathBuf>("preview-dir").cloned().or(file.preview_dir),
            api_port: (api_port != 0).then_some(api_port),
            preview_format,
        })
    }

    pub fn pipeline(&self) -> anyhow::Result<PipelineConfig> {
        let builder = PipelineConfig::builder()
            .input(self.input.as_str())
            .output(self.output.as_path())
            .timeout(self.timeout)
            .listen(self.listen)
            .preview_format(self.preview_format);
        let builder = if self.video_only { builder.video_only() } else { builder };
        builder.build().context("invalid pipeline configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_pipe::StreamRequirement;

    fn parse(args: &[&str]) -> anyhow::Result<AppConfig> {
        let matches = command()
            .try_get_matches_from(std::iter::once("live-recorder").chain(args.iter().copied()))?;
        AppConfig::merge(&matches, FileConfig::default())
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--input", "rtmp://127.0.0.1/live/a", "--output", "out.flv"]).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.api_port, Some(DEFAULT_API_PORT));
        assert!(!config.video_only);
        assert!(!config.listen);
        assert!(config.preview_dir.is_none());

        let pipeline = config.pipeline().unwrap();
        assert_eq!(pipeline.requirement, StreamRequirement::AudioVideo);
        assert_eq!(pipeline.source.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_flags() {
        let config = parse(&[
            "-i",
            "rtmp://0.0.0.0/live/a",
            "-o",
            "out.mkv",
            "--video-only",
            "--listen",
            "--timeout",
            "3",
            "--api-port",
            "0",
            "--preview-dir",
            "/tmp/preview",
        ])
        .unwrap();
        assert!(config.video_only && config.listen);
        assert_eq!(config.api_port, None);
        assert_eq!(config.preview_dir, Some(PathBuf::from("/tmp/preview")));

        let pipeline = config.pipeline().unwrap();
        assert_eq!(pipeline.requirement, StreamRequirement::VideoOnly);
        assert_eq!(pipeline.source.read_timeout, Duration::from_secs(3));
        assert!(pipeline.source.listen);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(parse(&["-i", "a.flv", "-o", "b.mp4", "--timeout", "0"]).is_err());
    }

    #[test]
    fn test_missing_input() {
        let err = parse(&["--output", "out.flv"]).unwrap_err();
        assert!(err.to_string().contains("no input"));
    }

    #[test]
    fn test_command_line_overrides_file() {
        let file: FileConfig = serde_json::from_str(
            r#"{
                "input": "srt://10.0.0.1:9000",
                "output": "file.ts",
                "timeout": 5,
                "video_only": true,
                "preview_format": "bgra"
            }"#,
        )
        .unwrap();
        let matches = command()
            .try_get_matches_from(["live-recorder", "--output", "cli.mp4"])
            .unwrap();
        let config = AppConfig::merge(&matches, file).unwrap();
        assert_eq!(config.input, "srt://10.0.0.1:9000");
        assert_eq!(config.output, PathBuf::from("cli.mp4"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.video_only);
        assert_eq!(config.preview_format, PreviewFormat::Bgra);
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        assert!(serde_json::from_str::<FileConfig>(r#"{"inptu": "x"}"#).is_err());
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join("live-recorder-config-test.json");
        std::fs::write(
            &path,
            r#"{"input": "a.flv", "output": "b.mp4", "api_port": 9090}"#,
        )
        .unwrap();
        let matches = command()
            .try_get_matches_from(["live-recorder", "--config", path.to_str().unwrap()])
            .unwrap();
        let config = AppConfig::from_matches(&matches).unwrap();
        assert_eq!(config.api_port, Some(9090));
        assert_eq!(config.input, "a.flv");
    }
}

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, warn};

use crate::config::AudioConfig;
use crate::error::{compact_diagnostics, PipelineError, Result, DIAGNOSTIC_TAIL_CHARS};

/// Captured result of one media tool invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Process exit code (None if killed by a signal)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit code with signal deaths mapped to -1
    pub fn code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }
}

/// Transcoding and probing tool (ffmpeg/ffprobe compatible argument lists).
///
/// Exit codes and stderr text are the only error signal these tools give us.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Run the transcoder
    async fn transcode(&self, args: &[String]) -> Result<ToolOutput>;

    /// Run the prober
    async fn probe(&self, args: &[String]) -> Result<ToolOutput>;
}

/// Media tool backed by the ffmpeg/ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegCli {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegCli {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.ffprobe_path.clone())
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput> {
        debug!("Executing command: {} {}", program, args.join(" "));

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::FFmpeg(format!("Failed to spawn {}: {}", program, e)))?;

        let result = ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            debug!(
                "{} exited with {}: {}",
                program,
                result.code(),
                compact_diagnostics(&result.stderr, DIAGNOSTIC_TAIL_CHARS)
            );
        }

        Ok(result)
    }
}

impl Default for FfmpegCli {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

#[async_trait]
impl MediaTool for FfmpegCli {
    async fn transcode(&self, args: &[String]) -> Result<ToolOutput> {
        self.run(&self.ffmpeg_path, args).await
    }

    async fn probe(&self, args: &[String]) -> Result<ToolOutput> {
        self.run(&self.ffprobe_path, args).await
    }
}

/// Lossy string form of a path for tool argument lists
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Build an owned argument list from string slices
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|p| p.as_ref().to_string()).collect()
}

/// Measured container duration in seconds, None when it cannot be measured
pub async fn probe_duration(tool: &dyn MediaTool, path: &Path) -> Option<f64> {
    let probe_args = args([
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "json",
    ])
    .into_iter()
    .chain(std::iter::once(path_arg(path)))
    .collect::<Vec<_>>();

    match tool.probe(&probe_args).await {
        Ok(output) if output.success() => parse_duration_json(&output.stdout),
        Ok(output) => {
            debug!(
                "Duration probe failed for {}: {}",
                path.display(),
                compact_diagnostics(&output.stderr, DIAGNOSTIC_TAIL_CHARS)
            );
            None
        }
        Err(e) => {
            warn!("Duration probe could not run for {}: {}", path.display(), e);
            None
        }
    }
}

/// Absolute indices of the audio streams in a container (empty if unknown)
pub async fn probe_audio_streams(tool: &dyn MediaTool, path: &Path) -> Vec<u32> {
    let probe_args = args([
        "-v",
        "error",
        "-select_streams",
        "a",
        "-show_entries",
        "stream=index",
        "-of",
        "json",
    ])
    .into_iter()
    .chain(std::iter::once(path_arg(path)))
    .collect::<Vec<_>>();

    match tool.probe(&probe_args).await {
        Ok(output) if output.success() => parse_stream_indices(&output.stdout),
        Ok(output) => {
            warn!(
                "Audio stream probe failed for {}, using default stream: {}",
                path.display(),
                compact_diagnostics(&output.stderr, DIAGNOSTIC_TAIL_CHARS)
            );
            Vec::new()
        }
        Err(e) => {
            warn!("Audio stream probe could not run for {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Parse `format.duration` out of ffprobe JSON output
pub fn parse_duration_json(json: &str) -> Option<f64> {
    let data: serde_json::Value = serde_json::from_str(json).ok()?;
    let duration = &data["format"]["duration"];
    let seconds = duration
        .as_str()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .or_else(|| duration.as_f64())?;
    (seconds.is_finite() && seconds > 0.0).then_some(seconds)
}

/// Parse `streams[].index` out of ffprobe JSON output
pub fn parse_stream_indices(json: &str) -> Vec<u32> {
    let Ok(data) = serde_json::from_str::<serde_json::Value>(json) else {
        return Vec::new();
    };
    let mut indices: Vec<u32> = data["streams"]
        .as_array()
        .map(|streams| {
            streams
                .iter()
                .filter_map(|s| s["index"].as_u64())
                .filter_map(|i| u32::try_from(i).ok())
                .collect()
        })
        .unwrap_or_default();
    indices.sort_unstable();
    indices.dedup();
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_json() {
        let json = r#"{"format":{"duration":"601.344000"}}"#;
        assert_eq!(parse_duration_json(json), Some(601.344));
        assert_eq!(parse_duration_json(r#"{"format":{"duration":"N/A"}}"#), None);
        assert_eq!(parse_duration_json(r#"{"format":{}}"#), None);
        assert_eq!(parse_duration_json("not json"), None);
        assert_eq!(parse_duration_json(r#"{"format":{"duration":"0.0"}}"#), None);
    }

    #[test]
    fn test_parse_stream_indices() {
        let json = r#"{"programs":[],"streams":[{"index":2},{"index":1},{"index":2}]}"#;
        assert_eq!(parse_stream_indices(json), vec![1, 2]);
        assert!(parse_stream_indices(r#"{"streams":[]}"#).is_empty());
        assert!(parse_stream_indices("garbage").is_empty());
    }

    #[test]
    fn test_tool_output_code() {
        let killed = ToolOutput::default();
        assert!(!killed.success());
        assert_eq!(killed.code(), -1);

        let ok = ToolOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());
    }

    #[tokio::test]
    async fn test_missing_binary_is_ffmpeg_error() {
        let tool = FfmpegCli::new("definitely-not-a-real-ffmpeg", "definitely-not-a-real-ffprobe");
        let result = tool.transcode(&args(["-version"])).await;
        assert!(matches!(result, Err(PipelineError::FFmpeg(_))));
    }
}

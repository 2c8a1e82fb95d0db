use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{compact_diagnostics, PipelineError, Result, DIAGNOSTIC_TAIL_CHARS};
use crate::ffmpeg::{args, path_arg, probe_duration, MediaTool, ToolOutput};

/// One bounded-duration slice of the cleaned audio track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFile {
    pub index: usize,
    pub path: PathBuf,
    /// Measured duration in seconds, None when the probe failed
    pub duration: Option<f64>,
}

/// Which segmentation pass produced the files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    StreamCopy,
    Reencode,
}

/// Splits audio into fixed-length segment files
#[derive(Clone)]
pub struct AudioSegmenter {
    tool: Arc<dyn MediaTool>,
    sample_rate: u32,
}

impl AudioSegmenter {
    pub fn new(tool: Arc<dyn MediaTool>, sample_rate: u32) -> Self {
        Self { tool, sample_rate }
    }

    fn segment_args(
        &self,
        audio: &Path,
        pattern: &Path,
        segment_seconds: u32,
        mode: SegmentMode,
        bitrate: &str,
    ) -> Vec<String> {
        let mut cmd = args(["-hide_banner", "-nostdin", "-y", "-i"]);
        cmd.push(path_arg(audio));
        cmd.extend(args(["-map", "0:a:0", "-vn"]));
        match mode {
            SegmentMode::StreamCopy => cmd.extend(args(["-c", "copy"])),
            SegmentMode::Reencode => {
                cmd.extend(args(["-ac", "1", "-ar"]));
                cmd.push(self.sample_rate.to_string());
                cmd.extend(args(["-c:a", "libmp3lame", "-b:a", bitrate]));
            }
        }
        cmd.extend(args(["-f", "segment", "-segment_time"]));
        cmd.push(segment_seconds.to_string());
        cmd.extend(args(["-reset_timestamps", "1"]));
        cmd.push(path_arg(pattern));
        cmd
    }

    async fn attempt(
        &self,
        audio: &Path,
        out_dir: &Path,
        prefix: &str,
        segment_seconds: u32,
        mode: SegmentMode,
        bitrate: &str,
    ) -> Result<(Vec<PathBuf>, String)> {
        let pattern = out_dir.join(format!("{}_%04d.mp3", prefix));
        let cmd = self.segment_args(audio, &pattern, segment_seconds, mode, bitrate);
        let output = match self.tool.transcode(&cmd).await {
            Ok(output) => output,
            Err(e) => ToolOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        };
        let files = discover_segments(out_dir, prefix).await?;
        let diagnostics = format!(
            "{:?} exit {}: {}",
            mode,
            output.code(),
            compact_diagnostics(&output.stderr, DIAGNOSTIC_TAIL_CHARS)
        );
        Ok((files, diagnostics))
    }

    /// Segment by stream copy, falling back to a full re-encode when copy yields nothing
    pub async fn segment(
        &self,
        audio: &Path,
        out_dir: &Path,
        segment_seconds: u32,
        fallback_bitrate: &str,
        prefix: &str,
    ) -> Result<Vec<SegmentFile>> {
        tokio::fs::create_dir_all(out_dir).await?;

        let (mut files, copy_diagnostics) = self
            .attempt(audio, out_dir, prefix, segment_seconds, SegmentMode::StreamCopy, fallback_bitrate)
            .await?;

        if files.is_empty() {
            warn!(
                "⚠️ Stream-copy segmentation produced no files, re-encoding at {}",
                fallback_bitrate
            );
            let (encoded, encode_diagnostics) = self
                .attempt(audio, out_dir, prefix, segment_seconds, SegmentMode::Reencode, fallback_bitrate)
                .await?;
            if encoded.is_empty() {
                return Err(PipelineError::SegmentationFailed(format!(
                    "{} | {}",
                    copy_diagnostics, encode_diagnostics
                )));
            }
            files = encoded;
        }

        let mut segments = Vec::with_capacity(files.len());
        for (index, path) in files.into_iter().enumerate() {
            let duration = probe_duration(self.tool.as_ref(), &path).await;
            segments.push(SegmentFile { index, path, duration });
        }

        info!(
            "✂️ Split {} into {} segments of ~{}s",
            audio.display(),
            segments.len(),
            segment_seconds
        );
        Ok(segments)
    }
}

/// Segment files `<prefix>_NNNN.mp3` in `dir`, in chronological order
pub async fn discover_segments(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let pattern = Regex::new(&format!(r"^{}_\d{{4}}\.mp3$", regex::escape(prefix)))
        .map_err(|e| PipelineError::SegmentationFailed(format!("bad segment prefix {}: {}", prefix, e)))?;

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if pattern.is_match(&name.to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::{compact_diagnostics, PipelineError, Result, DIAGNOSTIC_TAIL_CHARS};
use crate::ffmpeg::{args, path_arg, probe_duration, MediaTool};

/// Flags asking the transcoder to decode as much as it can instead of bailing out
const TOLERANT_INPUT_FLAGS: [&str; 4] = ["-err_detect", "ignore_err", "-fflags", "+discardcorrupt+genpts"];

/// Durations closer than this are considered equal when ranking candidates
const DURATION_TOLERANCE_SECS: f64 = 1.0;

/// Audio filter strategy applied to every targeted stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionProfile {
    /// Plain mono downmix of all channels
    Downmix,
    /// Keep only the first channel (rescues tracks with a dead or inverted channel)
    FirstChannel,
}

impl ExtractionProfile {
    pub const ALL: [ExtractionProfile; 2] = [ExtractionProfile::Downmix, ExtractionProfile::FirstChannel];

    pub fn name(&self) -> &'static str {
        match self {
            ExtractionProfile::Downmix => "downmix",
            ExtractionProfile::FirstChannel => "first_channel",
        }
    }

    fn filter_args(&self) -> Vec<String> {
        match self {
            ExtractionProfile::Downmix => args(["-af", "aresample=async=1", "-ac", "1"]),
            ExtractionProfile::FirstChannel => args(["-af", "pan=mono|c0=c0,aresample=async=1"]),
        }
    }
}

/// Result of one (stream, profile) extraction attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioCandidate {
    pub path: PathBuf,
    /// Explicit stream index, None for the transcoder's default stream
    pub stream: Option<u32>,
    pub profile: ExtractionProfile,
    pub exit_code: i32,
    /// Compacted tail of the transcoder's stderr
    pub diagnostics: String,
    pub decode_warnings: usize,
    pub bytes: u64,
    pub duration: Option<f64>,
}

impl AudioCandidate {
    pub fn label(&self) -> String {
        let stream = self
            .stream
            .map(|s| s.to_string())
            .unwrap_or_else(|| "default".to_string());
        format!("{}/{}", stream, self.profile.name())
    }

    /// Stable key used to put candidates in a canonical order before ranking
    fn canonical_key(&self) -> (Option<u32>, ExtractionProfile) {
        (self.stream, self.profile)
    }
}

/// Rank two candidates; `Ordering::Greater` means `a` is the better one.
///
/// Precedence: clean exit, then longer duration (beyond a one second
/// tolerance), then fewer decode warnings, then the default stream, then size.
pub fn compare_candidates(a: &AudioCandidate, b: &AudioCandidate) -> Ordering {
    let a_clean = a.exit_code == 0;
    let b_clean = b.exit_code == 0;
    if a_clean != b_clean {
        return a_clean.cmp(&b_clean);
    }

    let a_duration = a.duration.unwrap_or(0.0);
    let b_duration = b.duration.unwrap_or(0.0);
    if (a_duration - b_duration).abs() > DURATION_TOLERANCE_SECS {
        return a_duration.partial_cmp(&b_duration).unwrap_or(Ordering::Equal);
    }

    if a.decode_warnings != b.decode_warnings {
        return b.decode_warnings.cmp(&a.decode_warnings);
    }

    if a.stream.is_none() != b.stream.is_none() {
        return a.stream.is_none().cmp(&b.stream.is_none());
    }

    a.bytes.cmp(&b.bytes)
}

/// Pick the best candidate independent of the order they were produced in
pub fn select_best(mut candidates: Vec<AudioCandidate>) -> Option<(AudioCandidate, Vec<AudioCandidate>)> {
    candidates.sort_by_key(AudioCandidate::canonical_key);

    let mut best_index = 0;
    for (index, candidate) in candidates.iter().enumerate().skip(1) {
        if compare_candidates(candidate, &candidates[best_index]) == Ordering::Greater {
            best_index = index;
        }
    }

    if candidates.is_empty() {
        return None;
    }
    let best = candidates.remove(best_index);
    Some((best, candidates))
}

fn decode_warning_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(error while decoding|invalid data found|corrupt|concealing|non[- ]monoton|header missing|invalid frame size|decode_slice|packet too small)",
        )
        .expect("valid decode warning pattern")
    })
}

/// Number of stderr lines that look like decoder complaints
pub fn count_decode_warnings(stderr: &str) -> usize {
    let pattern = decode_warning_pattern();
    stderr.lines().filter(|line| pattern.is_match(line)).count()
}

/// Produces mono speech-ready audio candidates and keeps the best one
#[derive(Clone)]
pub struct AudioExtractor {
    tool: Arc<dyn MediaTool>,
    /// Output sample rate
    pub sample_rate: u32,
    /// Outputs at or below this size count as "no audio"
    pub min_audio_bytes: u64,
}

impl AudioExtractor {
    pub fn new(tool: Arc<dyn MediaTool>, config: &AudioConfig) -> Self {
        Self {
            tool,
            sample_rate: config.sample_rate,
            min_audio_bytes: config.min_audio_bytes,
        }
    }

    fn extraction_args(
        &self,
        source: &Path,
        stream: Option<u32>,
        profile: ExtractionProfile,
        bitrate: &str,
        output: &Path,
    ) -> Vec<String> {
        let mut cmd = args(["-hide_banner", "-nostdin", "-y"]);
        cmd.extend(args(TOLERANT_INPUT_FLAGS));
        cmd.extend(["-i".to_string(), path_arg(source)]);
        if let Some(index) = stream {
            cmd.extend(["-map".to_string(), format!("0:{}", index)]);
        }
        cmd.extend(args(["-vn", "-sn", "-dn"]));
        cmd.extend(profile.filter_args());
        cmd.extend(["-ar".to_string(), self.sample_rate.to_string()]);
        cmd.extend(args(["-c:a", "libmp3lame", "-b:a", bitrate]));
        cmd.push(path_arg(output));
        cmd
    }

    async fn run_candidate(
        &self,
        source: &Path,
        work_dir: &Path,
        stream: Option<u32>,
        profile: ExtractionProfile,
        bitrate: &str,
    ) -> AudioCandidate {
        let stream_label = stream
            .map(|s| s.to_string())
            .unwrap_or_else(|| "default".to_string());
        let path = work_dir.join(format!("candidate_{}_{}.mp3", stream_label, profile.name()));
        let cmd = self.extraction_args(source, stream, profile, bitrate, &path);

        let (exit_code, stderr) = match self.tool.transcode(&cmd).await {
            Ok(output) => (output.code(), output.stderr),
            Err(e) => (-1, e.to_string()),
        };

        let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let duration = if bytes > self.min_audio_bytes {
            probe_duration(self.tool.as_ref(), &path).await
        } else {
            None
        };

        AudioCandidate {
            path,
            stream,
            profile,
            exit_code,
            decode_warnings: count_decode_warnings(&stderr),
            diagnostics: compact_diagnostics(&stderr, DIAGNOSTIC_TAIL_CHARS),
            bytes,
            duration,
        }
    }

    /// Try every (stream, profile) combination and keep the best output.
    ///
    /// An empty `streams` list means "default stream only". Every losing or
    /// discarded candidate file is removed before returning.
    pub async fn extract_best(
        &self,
        source: &Path,
        work_dir: &Path,
        bitrate: &str,
        streams: &[u32],
    ) -> Result<AudioCandidate> {
        info!("🎵 Extracting audio candidates: {}", source.display());
        tokio::fs::create_dir_all(work_dir).await?;

        let targets: Vec<Option<u32>> = std::iter::once(None)
            .chain(streams.iter().copied().map(Some))
            .collect();

        let mut usable = Vec::new();
        let mut rejected = Vec::new();
        for stream in targets {
            for profile in ExtractionProfile::ALL {
                let candidate = self.run_candidate(source, work_dir, stream, profile, bitrate).await;
                if candidate.bytes > self.min_audio_bytes {
                    debug!(
                        "Candidate {}: exit={} duration={:?} warnings={} bytes={}",
                        candidate.label(),
                        candidate.exit_code,
                        candidate.duration,
                        candidate.decode_warnings,
                        candidate.bytes
                    );
                    usable.push(candidate);
                } else {
                    debug!(
                        "Candidate {} discarded ({} bytes): {}",
                        candidate.label(),
                        candidate.bytes,
                        candidate.diagnostics
                    );
                    rejected.push(candidate);
                }
            }
        }

        for candidate in &rejected {
            remove_quietly(&candidate.path).await;
        }

        let Some((best, losers)) = select_best(usable) else {
            let details = rejected
                .iter()
                .map(|c| format!("[{} exit {}] {}", c.label(), c.exit_code, c.diagnostics))
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(PipelineError::ExtractionFailed(compact_diagnostics(
                &details,
                DIAGNOSTIC_TAIL_CHARS * 2,
            )));
        };

        for loser in &losers {
            remove_quietly(&loser.path).await;
        }

        info!(
            "✅ Selected audio candidate {} ({:.1}s, {} bytes, {} decode warnings)",
            best.label(),
            best.duration.unwrap_or(0.0),
            best.bytes,
            best.decode_warnings
        );
        Ok(best)
    }

    /// Decode a file to 16-bit PCM WAV for services that reject compressed input
    pub async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<()> {
        let mut cmd = args(["-hide_banner", "-nostdin", "-y"]);
        cmd.extend(args(TOLERANT_INPUT_FLAGS));
        cmd.extend(["-i".to_string(), path_arg(input)]);
        cmd.extend(args(["-vn", "-af", "aresample=async=1", "-ac", "1"]));
        cmd.extend(["-ar".to_string(), self.sample_rate.to_string()]);
        cmd.extend(args(["-c:a", "pcm_s16le", "-f", "wav"]));
        cmd.push(path_arg(output));

        let result = self.tool.transcode(&cmd).await?;
        let bytes = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if !result.success() || bytes == 0 {
            return Err(PipelineError::FFmpeg(format!(
                "WAV decode exited with {}: {}",
                result.code(),
                compact_diagnostics(&result.stderr, DIAGNOSTIC_TAIL_CHARS)
            )));
        }
        Ok(())
    }
}

/// Best-effort removal of a temporary file
pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::ToolOutput;
    use async_trait::async_trait;
    use rand::seq::SliceRandom;
    use std::collections::HashMap;

    fn candidate(stream: Option<u32>, profile: ExtractionProfile) -> AudioCandidate {
        AudioCandidate {
            path: PathBuf::from(format!("{:?}-{:?}.mp3", stream, profile)),
            stream,
            profile,
            exit_code: 0,
            diagnostics: String::new(),
            decode_warnings: 0,
            bytes: 10_000,
            duration: Some(100.0),
        }
    }

    #[test]
    fn test_each_rule_in_precedence_order() {
        let base = candidate(None, ExtractionProfile::Downmix);

        let mut failed = candidate(None, ExtractionProfile::FirstChannel);
        failed.exit_code = 1;
        failed.duration = Some(500.0);
        assert_eq!(compare_candidates(&base, &failed), Ordering::Greater);

        let mut longer = candidate(Some(1), ExtractionProfile::Downmix);
        longer.duration = Some(102.0);
        longer.decode_warnings = 10;
        assert_eq!(compare_candidates(&longer, &base), Ordering::Greater);

        let mut barely_longer = candidate(None, ExtractionProfile::FirstChannel);
        barely_longer.duration = Some(100.9);
        barely_longer.decode_warnings = 2;
        assert_eq!(compare_candidates(&base, &barely_longer), Ordering::Greater);

        let mut explicit = candidate(Some(2), ExtractionProfile::Downmix);
        explicit.bytes = 50_000;
        assert_eq!(compare_candidates(&base, &explicit), Ordering::Greater);

        let mut bigger = candidate(None, ExtractionProfile::FirstChannel);
        bigger.bytes = 20_000;
        assert_eq!(compare_candidates(&bigger, &base), Ordering::Greater);
    }

    #[test]
    fn test_unmeasured_duration_loses_to_measured() {
        let measured = candidate(Some(1), ExtractionProfile::Downmix);
        let mut unmeasured = candidate(None, ExtractionProfile::Downmix);
        unmeasured.duration = None;
        assert_eq!(compare_candidates(&measured, &unmeasured), Ordering::Greater);
    }

    #[test]
    fn test_shuffled_generation_order_keeps_winner() {
        let mut pool = Vec::new();
        for stream in [None, Some(1), Some(2), Some(3)] {
            for profile in ExtractionProfile::ALL {
                pool.push(candidate(stream, profile));
            }
        }
        pool[1].decode_warnings = 3;
        pool[2].duration = Some(99.5);
        pool[2].bytes = 12_000;
        pool[5].bytes = 12_000;
        pool[6].exit_code = 255;
        pool[6].duration = Some(400.0);
        pool[7].duration = Some(100.8);

        let (expected, _) = select_best(pool.clone()).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut shuffled = pool.clone();
            shuffled.shuffle(&mut rng);
            let (winner, losers) = select_best(shuffled).unwrap();
            assert_eq!(winner.path, expected.path);
            assert_eq!(losers.len(), pool.len() - 1);
        }
    }

    #[test]
    fn test_count_decode_warnings() {
        let stderr = "\
[mp3float @ 0x1] Header missing\n\
Input #0, matroska\n\
[aac @ 0x2] Error while decoding stream #0:1: Invalid data found when processing input\n\
[h264 @ 0x3] concealing 120 DC errors\n\
size=    1024kB time=00:01:00.00";
        assert_eq!(count_decode_warnings(stderr), 3);
        assert_eq!(count_decode_warnings(""), 0);
    }

    /// Writes a fixed number of bytes per output name and reports fixed durations
    struct ScriptedTool {
        sizes: HashMap<String, usize>,
        durations: HashMap<String, f64>,
    }

    #[async_trait]
    impl MediaTool for ScriptedTool {
        async fn transcode(&self, args: &[String]) -> Result<ToolOutput> {
            let output = PathBuf::from(args.last().unwrap());
            let name = output.file_name().unwrap().to_string_lossy().to_string();
            let size = self.sizes.get(&name).copied().unwrap_or(0);
            if size > 0 {
                tokio::fs::write(&output, vec![0u8; size]).await?;
            }
            Ok(ToolOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }

        async fn probe(&self, args: &[String]) -> Result<ToolOutput> {
            let path = PathBuf::from(args.last().unwrap());
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            let duration = self.durations.get(&name).copied().unwrap_or(0.0);
            Ok(ToolOutput {
                exit_code: Some(0),
                stdout: format!(r#"{{"format":{{"duration":"{}"}}}}"#, duration),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_extract_best_deletes_losers() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ScriptedTool {
            sizes: HashMap::from([
                ("candidate_default_downmix.mp3".to_string(), 4096),
                ("candidate_default_first_channel.mp3".to_string(), 4096),
                ("candidate_2_downmix.mp3".to_string(), 8192),
                ("candidate_2_first_channel.mp3".to_string(), 16),
            ]),
            durations: HashMap::from([
                ("candidate_default_downmix.mp3".to_string(), 30.0),
                ("candidate_default_first_channel.mp3".to_string(), 30.0),
                ("candidate_2_downmix.mp3".to_string(), 300.0),
            ]),
        };
        let extractor = AudioExtractor::new(Arc::new(tool), &crate::config::Config::default().audio);

        let best = extractor
            .extract_best(Path::new("in.mkv"), dir.path(), "64k", &[2])
            .await
            .unwrap();

        assert_eq!(best.stream, Some(2));
        assert_eq!(best.profile, ExtractionProfile::Downmix);
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["candidate_2_downmix.mp3".to_string()]);
    }

    #[tokio::test]
    async fn test_extract_best_fails_without_usable_audio() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ScriptedTool {
            sizes: HashMap::from([("candidate_default_downmix.mp3".to_string(), 100)]),
            durations: HashMap::new(),
        };
        let extractor = AudioExtractor::new(Arc::new(tool), &crate::config::Config::default().audio);

        let result = extractor
            .extract_best(Path::new("in.mkv"), dir.path(), "64k", &[])
            .await;
        assert!(matches!(result, Err(PipelineError::ExtractionFailed(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

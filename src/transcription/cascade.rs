//! Per-segment transcription with an ordered fallback cascade.
//!
//! A direct call runs first. When it fails, each [`FallbackStrategy`] in
//! [`FALLBACK_CASCADE`] is checked against the latest error and applied if
//! its predicate matches; the first success wins.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::audio::{remove_quietly, AudioExtractor};
use crate::config::SegmentationConfig;
use crate::error::{PipelineError, Result, ServiceError};
use crate::segmenter::AudioSegmenter;
use crate::transcription::normalize::{merge_into_slice, TranscriptionSlice};
use crate::transcription::retry::DirectTranscriber;

/// Recovery step tried after a failed direct call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Re-upload as decoded PCM WAV
    DecodeToWav,
    /// Split the segment into smaller parts and transcribe each
    FinerSplit,
}

/// Strategies in the order they are considered
pub const FALLBACK_CASCADE: [FallbackStrategy; 2] =
    [FallbackStrategy::DecodeToWav, FallbackStrategy::FinerSplit];

impl FallbackStrategy {
    pub fn applies_to(&self, error: &ServiceError) -> bool {
        match self {
            FallbackStrategy::DecodeToWav => error.is_unsupported_decode() || error.is_empty_content(),
            FallbackStrategy::FinerSplit => error.is_payload_too_large() || error.is_upstream_timeout(),
        }
    }
}

/// Part length for a finer split: max(floor, min(ceiling, duration / 2))
pub fn finer_split_target(duration: Option<f64>, ceiling: u32, floor: u32) -> u32 {
    let ceiling = ceiling.max(1) as f64;
    let floor = floor as f64;
    let target = match duration {
        Some(d) if d.is_finite() && d > 0.0 => floor.max(ceiling.min(d / 2.0)),
        _ => ceiling,
    };
    target.round().max(1.0) as u32
}

/// Transcribes one segment file, falling back as its errors dictate
#[derive(Clone)]
pub struct SegmentTranscriber {
    direct: DirectTranscriber,
    extractor: AudioExtractor,
    segmenter: AudioSegmenter,
    fallback_segment_seconds: u32,
    min_fallback_segment_seconds: u32,
    fallback_bitrate: String,
}

impl SegmentTranscriber {
    pub fn new(
        direct: DirectTranscriber,
        extractor: AudioExtractor,
        segmenter: AudioSegmenter,
        config: &SegmentationConfig,
    ) -> Self {
        Self {
            direct,
            extractor,
            segmenter,
            fallback_segment_seconds: config.fallback_segment_seconds,
            min_fallback_segment_seconds: config.min_fallback_segment_seconds,
            fallback_bitrate: config.fallback_bitrate.clone(),
        }
    }

    /// Transcribe a segment; timestamps in the result are relative to its start
    pub async fn transcribe_segment(
        &self,
        segment: &Path,
        duration: Option<f64>,
        language: Option<&str>,
        work_dir: &Path,
    ) -> Result<TranscriptionSlice> {
        let mut last_error: PipelineError = match self.direct.transcribe(segment, language).await {
            Ok(slice) => return Ok(slice),
            Err(e) => e.into(),
        };

        for strategy in FALLBACK_CASCADE {
            let trigger = match last_error.as_service() {
                Some(e) if strategy.applies_to(e) => e.clone(),
                _ => continue,
            };

            info!(
                "🔁 {} failed ({}), trying {:?}",
                segment.display(),
                trigger,
                strategy
            );

            let attempt = match strategy {
                FallbackStrategy::DecodeToWav => self.retry_as_wav(segment, language, work_dir, &trigger).await,
                FallbackStrategy::FinerSplit => {
                    self.transcribe_in_parts(segment, duration, language, work_dir).await
                }
            };

            match attempt {
                Ok(slice) => return Ok(slice),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    async fn retry_as_wav(
        &self,
        segment: &Path,
        language: Option<&str>,
        work_dir: &Path,
        trigger: &ServiceError,
    ) -> Result<TranscriptionSlice> {
        let wav_path = work_dir.join(format!("{}_fallback.wav", file_stem(segment)));

        let result = match self.extractor.decode_to_wav(segment, &wav_path).await {
            Ok(()) => self
                .direct
                .transcribe(&wav_path, language)
                .await
                .map_err(PipelineError::from),
            Err(e) => {
                warn!("WAV fallback conversion failed for {}: {}", segment.display(), e);
                Err(PipelineError::Service(trigger.clone()))
            }
        };

        remove_quietly(&wav_path).await;
        result
    }

    async fn transcribe_in_parts(
        &self,
        segment: &Path,
        duration: Option<f64>,
        language: Option<&str>,
        work_dir: &Path,
    ) -> Result<TranscriptionSlice> {
        let target = finer_split_target(
            duration,
            self.fallback_segment_seconds,
            self.min_fallback_segment_seconds,
        );
        let parts_dir: PathBuf = work_dir.join(format!("{}_parts", file_stem(segment)));

        let result = self.transcribe_parts_in(segment, &parts_dir, target, language).await;

        if let Err(e) = tokio::fs::remove_dir_all(&parts_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", parts_dir.display(), e);
            }
        }
        result
    }

    async fn transcribe_parts_in(
        &self,
        segment: &Path,
        parts_dir: &Path,
        target: u32,
        language: Option<&str>,
    ) -> Result<TranscriptionSlice> {
        let parts = self
            .segmenter
            .segment(segment, parts_dir, target, &self.fallback_bitrate, "part")
            .await
            .map_err(|e| PipelineError::SegmentedUploadFailed(Box::new(e)))?;

        info!("✂️ Retrying {} as {} parts of ~{}s", segment.display(), parts.len(), target);

        let mut offset = 0.0;
        let mut successes = Vec::new();
        let mut first_error: Option<ServiceError> = None;

        for part in &parts {
            match self.direct.transcribe(&part.path, language).await {
                Ok(slice) => successes.push((slice, offset)),
                Err(e) => {
                    warn!("⚠️ Skipping part {} of {}: {}", part.index, segment.display(), e);
                    first_error.get_or_insert(e);
                }
            }
            offset += part.duration.unwrap_or(target as f64);
        }

        if successes.is_empty() {
            let cause = first_error
                .map(PipelineError::Service)
                .unwrap_or_else(|| PipelineError::SegmentationFailed("no parts produced".into()));
            return Err(PipelineError::SegmentedUploadFailed(Box::new(cause)));
        }

        Ok(merge_into_slice(successes))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segment".to_string())
}

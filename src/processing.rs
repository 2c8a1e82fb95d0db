use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::AudioExtractor;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::ffmpeg::{probe_audio_streams, FfmpegCli, MediaTool};
use crate::segmenter::AudioSegmenter;
use crate::source::{LocalFileSource, SourceFetcher};
use crate::transcription::{
    merge_slices, DirectTranscriber, HttpSpeechToText, RetryPolicy, SegmentTranscriber, SpeechToText,
    Transcript,
};

pub const STAGE_DOWNLOADING: &str = "downloading source";
pub const STAGE_EXTRACTING: &str = "extracting audio";
pub const STAGE_SEGMENTING: &str = "segmenting audio";
pub const STAGE_MERGING: &str = "merging transcript";
pub const STAGE_COMPLETE: &str = "complete";

/// Progress patch emitted by a running pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: String,
    pub progress: u8,
    pub total_chunks: Option<usize>,
    pub completed_chunks: Option<usize>,
}

impl ProgressUpdate {
    pub fn stage(stage: impl Into<String>, progress: u8) -> Self {
        Self {
            stage: stage.into(),
            progress,
            total_chunks: None,
            completed_chunks: None,
        }
    }

    pub fn chunks(stage: impl Into<String>, progress: u8, completed: usize, total: usize) -> Self {
        Self {
            stage: stage.into(),
            progress,
            total_chunks: Some(total),
            completed_chunks: Some(completed),
        }
    }
}

/// Progress for `completed` of `total` segments, spread over 10..=95
pub fn segment_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 95;
    }
    (10 + 85 * completed.min(total) / total) as u8
}

/// Everything a pipeline needs to know about one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub session_id: String,
    pub source_ref: String,
    pub language: Option<String>,
}

/// Runs one job end to end
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: JobRequest, progress: mpsc::Sender<ProgressUpdate>) -> Result<Transcript>;
}

/// Source → audio → segments → per-segment transcription → merged transcript
#[derive(Clone)]
pub struct TranscriptionPipeline {
    config: Arc<Config>,
    tool: Arc<dyn MediaTool>,
    source: Arc<dyn SourceFetcher>,
    extractor: AudioExtractor,
    segmenter: AudioSegmenter,
    transcriber: SegmentTranscriber,
}

impl TranscriptionPipeline {
    pub fn new(
        config: Arc<Config>,
        tool: Arc<dyn MediaTool>,
        stt: Arc<dyn SpeechToText>,
        source: Arc<dyn SourceFetcher>,
    ) -> Self {
        let extractor = AudioExtractor::new(tool.clone(), &config.audio);
        let segmenter = AudioSegmenter::new(tool.clone(), config.audio.sample_rate);
        let direct = DirectTranscriber::new(stt, RetryPolicy::from_config(&config.transcription));
        let transcriber = SegmentTranscriber::new(
            direct,
            extractor.clone(),
            segmenter.clone(),
            &config.segmentation,
        );

        Self {
            config,
            tool,
            source,
            extractor,
            segmenter,
            transcriber,
        }
    }

    /// Production wiring: ffmpeg binaries, HTTP speech service, local files
    /// (confined to `source_root` when one is configured)
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let tool = Arc::new(FfmpegCli::from_config(&config.audio));
        let stt = Arc::new(HttpSpeechToText::new(&config.transcription)?);
        let source = Arc::new(match &config.source_root {
            Some(root) => LocalFileSource::with_root(root.clone()),
            None => LocalFileSource::new(),
        });
        Ok(Self::new(config, tool, stt, source))
    }

    pub async fn process(
        &self,
        request: &JobRequest,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> Result<Transcript> {
        let start_time = Instant::now();
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let work = tempfile::Builder::new()
            .prefix(&format!("job-{}-", request.job_id))
            .tempdir_in(&self.config.work_dir)?;

        info!("🚀 Job {} started for session {}", request.job_id, request.session_id);
        let result = self.process_in(request, work.path(), progress).await;

        if let Err(e) = work.close() {
            warn!("Failed to remove job directory: {}", e);
        }

        match &result {
            Ok(transcript) => info!(
                "✅ Job {} finished in {:.1}s: {} segments",
                request.job_id,
                start_time.elapsed().as_secs_f64(),
                transcript.segments.len()
            ),
            Err(e) => error!("❌ Job {} failed: {}", request.job_id, e),
        }
        result
    }

    async fn process_in(
        &self,
        request: &JobRequest,
        work_dir: &Path,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> Result<Transcript> {
        report(progress, ProgressUpdate::stage(STAGE_DOWNLOADING, 2)).await;
        let source = self.source.fetch(&request.source_ref, work_dir).await?;

        report(progress, ProgressUpdate::stage(STAGE_EXTRACTING, 5)).await;
        let streams = probe_audio_streams(self.tool.as_ref(), &source).await;
        let audio = self
            .extractor
            .extract_best(&source, work_dir, &self.config.audio.extraction_bitrate, &streams)
            .await?;

        report(progress, ProgressUpdate::stage(STAGE_SEGMENTING, 10)).await;
        let segment_seconds = self.config.segmentation.segment_seconds;
        let segments = self
            .segmenter
            .segment(
                &audio.path,
                &work_dir.join("segments"),
                segment_seconds,
                &self.config.segmentation.fallback_bitrate,
                "segment",
            )
            .await?;

        let total = segments.len();
        report(progress, ProgressUpdate::chunks(STAGE_SEGMENTING, 10, 0, total)).await;

        let language = request.language.as_deref();
        let mut offset = 0.0;
        let mut successes = Vec::new();
        let mut first_error: Option<PipelineError> = None;

        for segment in &segments {
            match self
                .transcriber
                .transcribe_segment(&segment.path, segment.duration, language, work_dir)
                .await
            {
                Ok(slice) => successes.push((slice, offset)),
                Err(e) if e.is_connection_class() && successes.is_empty() => {
                    error!(
                        "🔌 Segment {} hit a connection failure before any success, aborting",
                        segment.index
                    );
                    return Err(PipelineError::NoSegmentsTranscribed(Box::new(e)));
                }
                Err(e) => {
                    warn!("⚠️ Skipping segment {}/{}: {}", segment.index + 1, total, e);
                    first_error.get_or_insert(e);
                }
            }

            offset += segment.duration.unwrap_or(segment_seconds as f64);
            let completed = segment.index + 1;
            report(
                progress,
                ProgressUpdate::chunks(
                    format!("transcribed segment {}/{}", completed, total),
                    segment_progress(completed, total),
                    completed,
                    total,
                ),
            )
            .await;
        }

        if successes.is_empty() {
            let cause = first_error
                .unwrap_or_else(|| PipelineError::SegmentationFailed("no segments to transcribe".into()));
            return Err(PipelineError::NoSegmentsTranscribed(Box::new(cause)));
        }

        report(progress, ProgressUpdate::chunks(STAGE_MERGING, 97, total, total)).await;
        Ok(merge_slices(successes))
    }
}

#[async_trait]
impl JobRunner for TranscriptionPipeline {
    async fn run(&self, request: JobRequest, progress: mpsc::Sender<ProgressUpdate>) -> Result<Transcript> {
        self.process(&request, &progress).await
    }
}

async fn report(progress: &mpsc::Sender<ProgressUpdate>, update: ProgressUpdate) {
    // A dropped receiver only means nobody is watching
    let _ = progress.send(update).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_progress_spans_milestones() {
        assert_eq!(segment_progress(0, 4), 10);
        assert_eq!(segment_progress(2, 4), 52);
        assert_eq!(segment_progress(4, 4), 95);
        assert_eq!(segment_progress(9, 4), 95);
        assert_eq!(segment_progress(0, 0), 95);
    }

    #[test]
    fn test_progress_update_serializes_camel_case() {
        let json = serde_json::to_value(ProgressUpdate::chunks("x", 52, 2, 4)).unwrap();
        assert_eq!(json["totalChunks"], 4);
        assert_eq!(json["completedChunks"], 2);
    }

    #[tokio::test]
    async fn test_configured_source_root_confines_fetches() {
        let root = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("talk.mp4"), b"video").unwrap();

        let config = crate::config::ConfigBuilder::new()
            .with_endpoint("http://127.0.0.1:9/v1/audio/transcriptions")
            .with_source_root(root.path().to_path_buf())
            .build();
        let pipeline = TranscriptionPipeline::from_config(Arc::new(config)).unwrap();

        assert!(pipeline.source.fetch("talk.mp4", work_dir.path()).await.is_ok());
        let escaped = pipeline.source.fetch("/etc/hosts", work_dir.path()).await;
        assert!(matches!(escaped, Err(PipelineError::Source(_))));
    }
}

//! Speech Pipeline
//!
//! Turns arbitrary video/audio files into time-coherent transcripts: picks the
//! cleanest audio track, splits it into segments, transcribes each segment
//! through an external speech-to-text service with layered fallbacks, and
//! merges the results. Jobs run through an in-process bounded queue.

pub mod audio;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod processing;
pub mod queue;
pub mod segmenter;
pub mod source;
pub mod state;
pub mod transcription;

#[cfg(feature = "api")]
pub mod api;

// Re-export main types for easy access
pub use crate::audio::{AudioCandidate, AudioExtractor, ExtractionProfile};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{PipelineError, Result, ServiceError};
pub use crate::ffmpeg::{FfmpegCli, MediaTool};
pub use crate::processing::{JobRequest, JobRunner, ProgressUpdate, TranscriptionPipeline};
pub use crate::queue::JobManager;
pub use crate::segmenter::{AudioSegmenter, SegmentFile};
pub use crate::source::{LocalFileSource, SourceFetcher};
pub use crate::state::{Job, JobStatus, QueueStats};
pub use crate::transcription::{SpeechToText, Transcript, TranscriptionSlice};

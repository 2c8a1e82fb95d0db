pub mod cascade;
pub mod client;
pub mod normalize;
pub mod retry;
pub mod srt;

pub use cascade::{FallbackStrategy, SegmentTranscriber, FALLBACK_CASCADE};
pub use client::{HttpSpeechToText, SpeechToText};
pub use normalize::{
    merge_slices, normalize, RawTranscription, Transcript, TranscriptSegment, TranscriptWord,
    TranscriptionSlice,
};
pub use retry::{DirectTranscriber, RetryPolicy};

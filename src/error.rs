//! Error types and failure classification for the transcription pipeline.
//!
//! Failures coming back from the speech service carry no structured error
//! codes we can rely on, so classification is done from the HTTP status and
//! message text alone.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Default tail length kept from subprocess diagnostics
pub const DIAGNOSTIC_TAIL_CHARS: usize = 600;

/// Error types for pipeline operations
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("Audio extraction produced no usable output: {0}")]
    ExtractionFailed(String),

    #[error("Audio segmentation failed: {0}")]
    SegmentationFailed(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Segmented upload transcription failed: {0}")]
    SegmentedUploadFailed(Box<PipelineError>),

    #[error("Unable to transcribe any audio segments: {0}")]
    NoSegmentsTranscribed(Box<PipelineError>),

    #[error("Source fetch failed: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Whether the root cause is a transport-level failure worth a job-level retry
    pub fn is_connection_class(&self) -> bool {
        match self {
            PipelineError::Service(e) => e.is_connection_class(),
            PipelineError::SegmentedUploadFailed(inner)
            | PipelineError::NoSegmentsTranscribed(inner) => inner.is_connection_class(),
            _ => false,
        }
    }

    /// The speech-service error behind this failure, if there is one
    pub fn as_service(&self) -> Option<&ServiceError> {
        match self {
            PipelineError::Service(e) => Some(e),
            _ => None,
        }
    }
}

/// How a speech-service call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The service answered with a non-success HTTP status
    Http,
    /// The request never completed at the transport layer
    Transport,
    /// Our own request deadline elapsed
    TimedOut,
    /// 2xx response without any usable transcript content
    EmptyContent,
    /// The audio file could not be read before uploading
    LocalFile,
}

/// Failure reported by (or on the way to) the speech-to-text service
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ServiceError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Http,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Transport,
            status: None,
            message: message.into(),
        }
    }

    pub fn timed_out(after_secs: u64) -> Self {
        Self {
            kind: ServiceErrorKind::TimedOut,
            status: None,
            message: format!("request timed out after {}s", after_secs),
        }
    }

    pub fn empty_content() -> Self {
        Self {
            kind: ServiceErrorKind::EmptyContent,
            status: Some(200),
            message: "response contained no segments, words or text".to_string(),
        }
    }

    pub fn local_file(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::LocalFile,
            status: None,
            message: message.into(),
        }
    }

    fn status_in(&self, codes: &[u16]) -> bool {
        self.status.map_or(false, |s| codes.contains(&s))
    }

    fn never_retried(&self) -> bool {
        matches!(self.kind, ServiceErrorKind::EmptyContent | ServiceErrorKind::LocalFile)
    }

    fn is_server_error(&self) -> bool {
        self.status.map_or(false, |s| (500..600).contains(&s))
    }

    /// 408/429/5xx or a DNS/socket/reset/unreachable style message
    pub fn is_connection_class(&self) -> bool {
        if self.never_retried() {
            return false;
        }
        self.kind == ServiceErrorKind::Transport
            || self.status_in(&[408, 429])
            || self.is_server_error()
            || connection_pattern().is_match(&self.message)
    }

    /// Eligible for another attempt under the base or connection budget
    pub fn is_retryable(&self) -> bool {
        if self.never_retried() {
            return false;
        }
        self.kind == ServiceErrorKind::TimedOut
            || self.is_connection_class()
            || retryable_pattern().is_match(&self.message)
    }

    pub fn is_payload_too_large(&self) -> bool {
        self.status_in(&[413]) || payload_pattern().is_match(&self.message)
    }

    pub fn is_upstream_timeout(&self) -> bool {
        self.kind == ServiceErrorKind::TimedOut
            || self.status_in(&[408, 504])
            || upstream_timeout_pattern().is_match(&self.message)
    }

    pub fn is_unsupported_decode(&self) -> bool {
        self.status_in(&[400]) && decode_pattern().is_match(&self.message)
    }

    pub fn is_empty_content(&self) -> bool {
        self.kind == ServiceErrorKind::EmptyContent
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ServiceErrorKind::Http => write!(
                f,
                "Transcription service error {}: {}",
                self.status.unwrap_or_default(),
                self.message
            ),
            ServiceErrorKind::Transport => {
                write!(f, "Transcription service unreachable: {}", self.message)
            }
            ServiceErrorKind::TimedOut => write!(f, "Transcription {}", self.message),
            ServiceErrorKind::EmptyContent => {
                write!(f, "Transcription service returned empty content: {}", self.message)
            }
            ServiceErrorKind::LocalFile => write!(f, "Cannot read audio for upload: {}", self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

fn connection_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(enotfound|eai_again|dns|getaddrinfo|socket|econnreset|connection reset|econnrefused|connection refused|connection closed|broken pipe|unreachable|network|etimedout|epipe)",
        )
        .expect("valid connection pattern")
    })
}

fn retryable_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(timeout|timed out|network|rate.?limit|too many requests|temporarily unavailable|overloaded)",
        )
        .expect("valid retryable pattern")
    })
}

fn payload_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(payload too large|entity too large|content.?size|size limit|maximum (file |content |upload )?size|exceeds? the (maximum|limit)|file too large)",
        )
        .expect("valid payload pattern")
    })
}

fn upstream_timeout_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(request timeout|timed out|deadline exceeded|gateway timeout)")
            .expect("valid timeout pattern")
    })
}

fn decode_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(could not be decoded|could not decode|failed to decode|unable to decode|unsupported (audio |file )?format|invalid file format|unrecognized file format|format is not supported|not a valid audio)",
        )
        .expect("valid decode pattern")
    })
}

/// Collapse whitespace and keep the tail of noisy tool output
pub fn compact_diagnostics(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let total = collapsed.chars().count();
    if total <= max_chars {
        return collapsed;
    }
    let tail: String = collapsed.chars().skip(total - max_chars).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ServiceError::http(503, "busy").is_connection_class());
        assert!(ServiceError::http(429, "slow down").is_retryable());
        assert!(ServiceError::http(413, "nope").is_payload_too_large());
        assert!(ServiceError::http(504, "upstream").is_upstream_timeout());
        assert!(!ServiceError::http(401, "bad key").is_retryable());
    }

    #[test]
    fn test_message_classification() {
        let reset = ServiceError::transport("read ECONNRESET");
        assert!(reset.is_connection_class());
        assert!(reset.is_retryable());

        let dns = ServiceError::http(418, "getaddrinfo ENOTFOUND api.example");
        assert!(dns.is_connection_class());

        let rate = ServiceError::http(400, "Rate limit reached for requests");
        assert!(rate.is_retryable());
        assert!(!rate.is_connection_class());

        let decode = ServiceError::http(400, "Audio file could not be decoded or its format is not supported.");
        assert!(decode.is_unsupported_decode());
        assert!(!decode.is_retryable());

        let size = ServiceError::http(400, "Maximum content size limit (26214400) exceeded");
        assert!(size.is_payload_too_large());
    }

    #[test]
    fn test_timeout_and_empty_kinds() {
        let timeout = ServiceError::timed_out(300);
        assert!(timeout.is_retryable());
        assert!(timeout.is_upstream_timeout());
        assert!(!timeout.is_connection_class());

        let empty = ServiceError::empty_content();
        assert!(!empty.is_retryable());
        assert!(!empty.is_connection_class());
        assert!(empty.is_empty_content());

        let unreadable = ServiceError::local_file("segment_0000.mp3: No such file or directory");
        assert!(!unreadable.is_retryable());
        assert!(!unreadable.is_connection_class());
        assert!(!unreadable.is_unsupported_decode());
    }

    #[test]
    fn test_connection_class_propagates_through_wrappers() {
        let inner = PipelineError::Service(ServiceError::transport("connection refused"));
        let wrapped = PipelineError::NoSegmentsTranscribed(Box::new(
            PipelineError::SegmentedUploadFailed(Box::new(inner)),
        ));
        assert!(wrapped.is_connection_class());
        assert!(!PipelineError::SegmentationFailed("x".into()).is_connection_class());
    }

    #[test]
    fn test_compact_diagnostics_keeps_tail() {
        let noisy = "line one\n\n   line two\tend";
        assert_eq!(compact_diagnostics(noisy, 100), "line one line two end");

        let long = "a".repeat(50) + " tail-marker";
        let compacted = compact_diagnostics(&long, 11);
        assert_eq!(compacted, "...tail-marker");
    }
}

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::config::TranscriptionConfig;
use crate::error::{compact_diagnostics, PipelineError, ServiceError, DIAGNOSTIC_TAIL_CHARS};
use crate::transcription::normalize::RawTranscription;

/// External speech-to-text service
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Upload one audio file and return the raw service response.
    ///
    /// Implementations must not retry; the retry policy wraps this call.
    async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> std::result::Result<RawTranscription, ServiceError>;
}

/// Multipart upload client for Whisper-compatible transcription endpoints
pub struct HttpSpeechToText {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    response_format: String,
}

impl HttpSpeechToText {
    pub fn new(config: &TranscriptionConfig) -> crate::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| PipelineError::Configuration("transcription endpoint not configured".into()))?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            response_format: config.response_format.clone(),
        })
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> std::result::Result<RawTranscription, ServiceError> {
        let audio_data = tokio::fs::read(audio_path)
            .await
            .map_err(|e| ServiceError::local_file(format!("{}: {}", audio_path.display(), e)))?;

        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());

        debug!("🌐 Uploading {} ({} bytes) to {}", file_name, audio_data.len(), self.endpoint);

        let part = reqwest::multipart::Part::bytes(audio_data)
            .file_name(file_name)
            .mime_str(mime_for(audio_path))
            .map_err(|e| ServiceError::transport(error_chain(&e)))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", self.response_format.clone())
            .text("timestamp_granularities[]", "segment")
            .text("timestamp_granularities[]", "word");

        if let Some(language) = language.filter(|l| !l.trim().is_empty()) {
            form = form.text("language", language.to_string());
        }

        let mut request = self.client.post(&self.endpoint);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| ServiceError::transport(error_chain(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::transport(error_chain(&e)))?;

        if !status.is_success() {
            return Err(ServiceError::http(
                status.as_u16(),
                compact_diagnostics(&extract_error_message(&body), DIAGNOSTIC_TAIL_CHARS),
            ));
        }

        let raw: RawTranscription = serde_json::from_str(&body).map_err(|e| {
            ServiceError::http(
                status.as_u16(),
                format!("invalid response body: {}", e),
            )
        })?;

        info!(
            "✅ Transcription response received: {} characters",
            raw.text.as_deref().map_or(0, str::len)
        );
        Ok(raw)
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        _ => "audio/mpeg",
    }
}

/// Pull `error.message` (or `message`) out of a JSON error body, else keep the body
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["error"].as_str())
                .or_else(|| v["message"].as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

/// Join an error with its sources; transport causes live deep in the chain
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ServiceErrorKind;

    #[test]
    fn test_client_requires_endpoint() {
        let config = Config::default();
        assert!(matches!(
            HttpSpeechToText::new(&config.transcription),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_extract_error_message() {
        let openai = r#"{"error":{"message":"Maximum content size limit (26214400) exceeded","type":"invalid_request_error"}}"#;
        assert_eq!(
            extract_error_message(openai),
            "Maximum content size limit (26214400) exceeded"
        );
        assert_eq!(extract_error_message(r#"{"message":"busy"}"#), "busy");
        assert_eq!(extract_error_message("<html>502</html>"), "<html>502</html>");
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(Path::new("a/segment_0000.mp3")), "audio/mpeg");
        assert_eq!(mime_for(Path::new("fallback.WAV")), "audio/wav");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_class() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("clip.mp3");
        std::fs::write(&audio, b"not really audio").unwrap();

        let mut config = Config::default().transcription;
        config.endpoint = Some("http://127.0.0.1:9/v1/audio/transcriptions".to_string());
        let client = HttpSpeechToText::new(&config).unwrap();

        let err = client.transcribe(&audio, Some("en")).await.unwrap_err();
        assert!(err.is_connection_class(), "{err}");
    }

    #[tokio::test]
    async fn test_unreadable_audio_is_local_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default().transcription;
        config.endpoint = Some("http://127.0.0.1:9/v1/audio/transcriptions".to_string());
        let client = HttpSpeechToText::new(&config).unwrap();

        let err = client
            .transcribe(&dir.path().join("missing.mp3"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::LocalFile);
        assert_eq!(err.status, None);
        assert!(!err.is_retryable());
        assert!(!err.is_connection_class());
    }
}

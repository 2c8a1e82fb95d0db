use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::TranscriptionConfig;
use crate::error::ServiceError;
use crate::transcription::client::SpeechToText;
use crate::transcription::normalize::{normalize, RawTranscription, TranscriptionSlice};

/// Bounded retries with a per-call deadline and two attempt budgets
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    /// Cap for ordinary retryable failures
    pub max_attempts: u32,
    /// Cap for connection-class failures
    pub connection_max_attempts: u32,
    pub short_delay: Duration,
    pub long_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_attempts: config.max_attempts.max(1),
            connection_max_attempts: config.connection_max_attempts.max(config.max_attempts).max(1),
            short_delay: Duration::from_millis(config.short_retry_delay_ms),
            long_delay: Duration::from_millis(config.long_retry_delay_ms),
            backoff_base: Duration::from_millis(config.connection_backoff_base_ms),
            backoff_max: Duration::from_millis(config.connection_backoff_max_ms),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
        }
    }

    /// Attempt budget that applies to this failure
    pub fn attempt_cap(&self, error: &ServiceError) -> u32 {
        if error.is_connection_class() {
            self.connection_max_attempts
        } else {
            self.max_attempts
        }
    }

    /// Wait before retrying after the given failed attempt (1-based), without jitter
    pub fn base_delay(&self, attempt: u32, error: &ServiceError) -> Duration {
        if error.is_connection_class() {
            let exponent = attempt.saturating_sub(1).min(16);
            self.backoff_base
                .saturating_mul(1u32 << exponent)
                .min(self.backoff_max)
        } else if attempt <= 1 {
            self.short_delay
        } else {
            self.long_delay
        }
    }

    fn delay(&self, attempt: u32, error: &ServiceError) -> Duration {
        let base = self.base_delay(attempt, error);
        if !error.is_connection_class() || self.jitter_max.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter_max.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Run `op` until it succeeds, fails non-retryably, or the relevant budget runs out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 1u32;
        loop {
            let result = match tokio::time::timeout(self.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::timed_out(self.request_timeout.as_secs())),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            let cap = self.attempt_cap(&error);
            if attempt >= cap {
                warn!("❌ {} failed after {} attempts: {}", label, attempt, error);
                return Err(error);
            }

            let delay = self.delay(attempt, &error);
            warn!(
                "⚠️ {} attempt {}/{} failed, retrying in {:?}: {}",
                label, attempt, cap, delay, error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// One speech-service call under the retry policy, with empty responses rejected
#[derive(Clone)]
pub struct DirectTranscriber {
    stt: Arc<dyn SpeechToText>,
    policy: RetryPolicy,
}

impl DirectTranscriber {
    pub fn new(stt: Arc<dyn SpeechToText>, policy: RetryPolicy) -> Self {
        Self { stt, policy }
    }

    pub async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<TranscriptionSlice, ServiceError> {
        let label = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| audio_path.display().to_string());

        let raw: RawTranscription = self
            .policy
            .run(&label, || self.stt.transcribe(audio_path, language))
            .await?;

        let slice = normalize(raw);
        if !slice.has_content() {
            return Err(ServiceError::empty_content());
        }
        Ok(slice)
    }
}

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the speech pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Audio extraction settings
    pub audio: AudioConfig,

    /// Segmentation settings
    pub segmentation: SegmentationConfig,

    /// Transcription service settings
    pub transcription: TranscriptionConfig,

    /// Job queue settings
    pub queue: QueueConfig,

    /// Root directory for per-job working directories
    pub work_dir: PathBuf,

    /// Source references must resolve inside this directory when set
    #[serde(default)]
    pub source_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Transcoder binary
    pub ffmpeg_path: String,

    /// Prober binary
    pub ffprobe_path: String,

    /// MP3 bitrate for extracted candidates
    pub extraction_bitrate: String,

    /// Output sample rate
    pub sample_rate: u32,

    /// Candidates at or below this size are treated as "no audio"
    pub min_audio_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Target segment length in seconds
    pub segment_seconds: u32,

    /// Upper bound for finer re-segmentation of a rejected segment
    pub fallback_segment_seconds: u32,

    /// Lower bound for finer re-segmentation
    pub min_fallback_segment_seconds: u32,

    /// Bitrate used whenever segments are re-encoded
    pub fallback_bitrate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Speech-to-text endpoint accepting multipart uploads
    pub endpoint: Option<String>,

    /// Bearer token for the endpoint
    pub api_key: Option<String>,

    /// Model name sent with each request
    pub model: String,

    /// Requested response format
    pub response_format: String,

    /// Hard timeout per request (seconds)
    pub request_timeout_secs: u64,

    /// Attempts for ordinary retryable failures
    pub max_attempts: u32,

    /// Attempts for connection-class failures
    pub connection_max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub short_retry_delay_ms: u64,

    /// Delay before later retries (milliseconds)
    pub long_retry_delay_ms: u64,

    /// Exponential backoff base for connection-class failures (milliseconds)
    pub connection_backoff_base_ms: u64,

    /// Exponential backoff cap for connection-class failures (milliseconds)
    pub connection_backoff_max_ms: u64,

    /// Upper bound on random jitter added to connection backoff (milliseconds)
    pub jitter_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pipelines allowed to run at once
    pub max_concurrency: usize,

    /// Whole-job retries after connection-class failures
    pub transient_retry_limit: u32,

    /// Base delay before a job is re-queued (seconds)
    pub retry_base_delay_secs: u64,

    /// Cap on the re-queue delay (seconds)
    pub retry_max_delay_secs: u64,

    /// How long finished jobs stay queryable (seconds)
    pub retention_secs: u64,
}

impl TranscriptionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl QueueConfig {
    /// Re-queue delay after the given retry: base * 2^(retry-1), capped
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let secs = self
            .retry_base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_secs);
        Duration::from_secs(secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_paths = [
            "speech-pipeline.toml",
            "config/speech-pipeline.toml",
            "/etc/speech-pipeline/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config.with_env_overrides());
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Self::from_env()
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read config {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&config_str)
            .map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config.with_env_overrides())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::default().with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("SPEECH_PIPELINE_ENDPOINT") {
            self.transcription.endpoint = Some(endpoint);
        }

        if let Ok(api_key) = std::env::var("SPEECH_PIPELINE_API_KEY") {
            self.transcription.api_key = Some(api_key);
        }

        if let Ok(workers) = std::env::var("SPEECH_PIPELINE_MAX_CONCURRENCY") {
            match workers.parse() {
                Ok(n) => self.queue.max_concurrency = n,
                Err(_) => tracing::warn!("Ignoring invalid SPEECH_PIPELINE_MAX_CONCURRENCY: {}", workers),
            }
        }

        if let Ok(seconds) = std::env::var("SPEECH_PIPELINE_SEGMENT_SECONDS") {
            match seconds.parse() {
                Ok(n) => self.segmentation.segment_seconds = n,
                Err(_) => tracing::warn!("Ignoring invalid SPEECH_PIPELINE_SEGMENT_SECONDS: {}", seconds),
            }
        }

        if let Ok(work_dir) = std::env::var("SPEECH_PIPELINE_WORK_DIR") {
            self.work_dir = PathBuf::from(work_dir);
        }

        if let Ok(root) = std::env::var("SPEECH_PIPELINE_SOURCE_ROOT") {
            self.source_root = Some(PathBuf::from(root));
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)
            .map_err(|e| anyhow!("Cannot write config {}: {}", path.display(), e))?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be greater than 0"));
        }

        if self.segmentation.segment_seconds == 0 || self.segmentation.fallback_segment_seconds == 0 {
            return Err(anyhow!("segment lengths must be greater than 0"));
        }

        if self.segmentation.min_fallback_segment_seconds > self.segmentation.fallback_segment_seconds {
            return Err(anyhow!(
                "min_fallback_segment_seconds ({}) exceeds fallback_segment_seconds ({})",
                self.segmentation.min_fallback_segment_seconds,
                self.segmentation.fallback_segment_seconds
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow!("sample_rate must be greater than 0"));
        }

        let t = &self.transcription;
        if t.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than 0"));
        }
        if t.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be greater than 0"));
        }
        if t.connection_max_attempts < t.max_attempts {
            return Err(anyhow!("connection_max_attempts must be at least max_attempts"));
        }
        if t.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
            return Err(anyhow!("Transcription endpoint required"));
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Speech Pipeline Configuration:\n\
            - Max concurrent jobs: {}\n\
            - Segment length: {}s (fallback {}s)\n\
            - Extraction bitrate: {}\n\
            - Endpoint: {}\n\
            - Attempts: {} (connection {})\n\
            - Work directory: {}\n\
            - Source root: {}",
            self.queue.max_concurrency,
            self.segmentation.segment_seconds,
            self.segmentation.fallback_segment_seconds,
            self.audio.extraction_bitrate,
            self.transcription.endpoint.as_deref().unwrap_or("<unset>"),
            self.transcription.max_attempts,
            self.transcription.connection_max_attempts,
            self.work_dir.display(),
            self.source_root
                .as_deref()
                .map_or_else(|| "<unrestricted>".to_string(), |p| p.display().to_string())
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                ffprobe_path: "ffprobe".to_string(),
                extraction_bitrate: "64k".to_string(),
                sample_rate: 16000,
                min_audio_bytes: 1024,
            },
            segmentation: SegmentationConfig {
                segment_seconds: 600,
                fallback_segment_seconds: 120,
                min_fallback_segment_seconds: 45,
                fallback_bitrate: "48k".to_string(),
            },
            transcription: TranscriptionConfig {
                endpoint: None,
                api_key: None,
                model: "whisper-1".to_string(),
                response_format: "verbose_json".to_string(),
                request_timeout_secs: 300,
                max_attempts: 3,
                connection_max_attempts: 6,
                short_retry_delay_ms: 1500,
                long_retry_delay_ms: 4000,
                connection_backoff_base_ms: 2000,
                connection_backoff_max_ms: 30_000,
                jitter_max_ms: 1200,
            },
            queue: QueueConfig {
                max_concurrency: num_cpus::get().clamp(1, 4),
                transient_retry_limit: 3,
                retry_base_delay_secs: 5,
                retry_max_delay_secs: 60,
                retention_secs: 30 * 60,
            },
            work_dir: std::env::temp_dir().join("speech-pipeline"),
            source_root: None,
        }
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.transcription.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.config.queue.max_concurrency = workers;
        self
    }

    pub fn with_segment_seconds(mut self, seconds: u32) -> Self {
        self.config.segmentation.segment_seconds = seconds;
        self
    }

    pub fn with_work_dir(mut self, dir: PathBuf) -> Self {
        self.config.work_dir = dir;
        self
    }

    pub fn with_source_root(mut self, root: PathBuf) -> Self {
        self.config.source_root = Some(root);
        self
    }

    pub fn with_attempts(mut self, base: u32, connection: u32) -> Self {
        self.config.transcription.max_attempts = base;
        self.config.transcription.connection_max_attempts = connection;
        self
    }

    pub fn with_transient_retry_limit(mut self, limit: u32) -> Self {
        self.config.queue.transient_retry_limit = limit;
        self
    }

    /// Zero every retry and backoff delay (tests and dry runs)
    pub fn without_delays(mut self) -> Self {
        let t = &mut self.config.transcription;
        t.short_retry_delay_ms = 0;
        t.long_retry_delay_ms = 0;
        t.connection_backoff_base_ms = 0;
        t.connection_backoff_max_ms = 0;
        t.jitter_max_ms = 0;
        self.config.queue.retry_base_delay_secs = 0;
        self.config.queue.retry_max_delay_secs = 0;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.segmentation.min_fallback_segment_seconds, 45);
        assert!(config.transcription.connection_max_attempts > config.transcription.max_attempts);
        assert!(config.queue.max_concurrency >= 1);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_endpoint("http://localhost:9000/v1/audio/transcriptions")
            .with_max_concurrency(8)
            .with_segment_seconds(300)
            .without_delays()
            .build();

        assert_eq!(config.queue.max_concurrency, 8);
        assert_eq!(config.segmentation.segment_seconds, 300);
        assert_eq!(config.transcription.jitter_max_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_err());

        let bad_attempts = ConfigBuilder::new()
            .with_endpoint("http://localhost")
            .with_attempts(4, 2)
            .build();
        assert!(bad_attempts.validate().is_err());

        let no_workers = ConfigBuilder::new()
            .with_endpoint("http://localhost")
            .with_max_concurrency(0)
            .build();
        assert!(no_workers.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = ConfigBuilder::new().with_endpoint("http://localhost").build();
        config.transcription.request_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[test]
    fn test_validation_rejects_inverted_fallback_lengths() {
        let mut config = ConfigBuilder::new().with_endpoint("http://localhost").build();
        config.segmentation.fallback_segment_seconds = 30;
        config.segmentation.min_fallback_segment_seconds = 45;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_fallback_segment_seconds"));

        config.segmentation.min_fallback_segment_seconds = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let queue = QueueConfig {
            max_concurrency: 1,
            transient_retry_limit: 5,
            retry_base_delay_secs: 5,
            retry_max_delay_secs: 30,
            retention_secs: 60,
        };
        assert_eq!(queue.retry_delay(1), Duration::from_secs(5));
        assert_eq!(queue.retry_delay(2), Duration::from_secs(10));
        assert_eq!(queue.retry_delay(3), Duration::from_secs(20));
        assert_eq!(queue.retry_delay(4), Duration::from_secs(30));
        assert_eq!(queue.retry_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ConfigBuilder::new().with_endpoint("http://stt").build();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.transcription.endpoint.as_deref(), Some("http://stt"));
        assert_eq!(parsed.segmentation.fallback_bitrate, "48k");
        assert_eq!(parsed.source_root, None);
    }

    #[test]
    fn test_save_then_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech-pipeline.toml");
        let config = ConfigBuilder::new()
            .with_endpoint("http://stt")
            .with_source_root(PathBuf::from("/srv/media"))
            .with_max_concurrency(3)
            .build();

        config.save(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();

        assert_eq!(loaded.source_root, Some(PathBuf::from("/srv/media")));
        assert_eq!(loaded.queue.max_concurrency, 3);
    }
}

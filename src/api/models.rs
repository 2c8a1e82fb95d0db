//! API data models

use serde::{Deserialize, Serialize};

use crate::state::{Job, QueueStats};

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Body of `POST /api/jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub session_id: String,
    pub source_ref: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl EnqueueRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.session_id.trim().is_empty() {
            return Err("sessionId is required".to_string());
        }
        if self.source_ref.trim().is_empty() {
            return Err("sourceRef is required".to_string());
        }
        Ok(())
    }
}

/// Health payload
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    pub version: String,
    pub queue: QueueStats,
}

/// Messages pushed over the live-updates socket
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum LiveMessage {
    QueueStatus { status: QueueStats },
    JobUpdate { job: Box<Job> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_request_accepts_camel_case() {
        let request: EnqueueRequest =
            serde_json::from_str(r#"{"sessionId":"abc","sourceRef":"file:///tmp/a.mp4"}"#).unwrap();
        assert_eq!(request.session_id, "abc");
        assert!(request.language.is_none());
        assert!(request.validate().is_ok());

        let blank: EnqueueRequest = serde_json::from_str(r#"{"sessionId":" ","sourceRef":"x"}"#).unwrap();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_live_message_is_tagged() {
        let json = serde_json::to_value(LiveMessage::QueueStatus {
            status: QueueStats::default(),
        })
        .unwrap();
        assert_eq!(json["type"], "QueueStatus");
    }
}

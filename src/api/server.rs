//! HTTP server implementation for the API

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use super::models::{ApiResponse, EnqueueRequest, HealthInfo, LiveMessage};
use crate::queue::JobManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
}

/// Build the router without binding a socket
pub fn router(manager: JobManager) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/api/jobs", post(enqueue_handler))
        .route("/api/jobs/:session_id", get(job_status_handler))
        .route("/api/status", get(queue_status_handler))
        .route("/ws", get(websocket_handler))
        .with_state(AppState { manager })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Configure and start the HTTP server
pub async fn start_http_server(manager: JobManager, port: u16) -> Result<()> {
    let app = router(manager);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("🌐 API server listening on http://0.0.0.0:{}", port);
    info!("🔗 WebSocket endpoint available at ws://0.0.0.0:{}/ws", port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let info = HealthInfo {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue: state.manager.stats(),
    };
    (StatusCode::OK, Json(info))
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueRequest>,
) -> impl IntoResponse {
    if let Err(message) = payload.validate() {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::error(message))).into_response();
    }

    let language = payload.language.filter(|l| !l.trim().is_empty());
    let job = state
        .manager
        .enqueue(payload.session_id.trim(), payload.source_ref.trim(), language);
    (StatusCode::ACCEPTED, Json(ApiResponse::success(job))).into_response()
}

async fn job_status_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_status(&session_id) {
        Some(job) => (StatusCode::OK, Json(ApiResponse::success(job))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error(format!("no job for session {}", session_id))),
        )
            .into_response(),
    }
}

async fn queue_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(ApiResponse::success(state.manager.stats())))
}

#[derive(Debug, Deserialize)]
struct LiveFilter {
    session: Option<String>,
}

/// WebSocket handler for real-time updates
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(filter): Query<LiveFilter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket_connection(socket, state, filter.session))
}

async fn send_live(socket: &mut WebSocket, message: &LiveMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode live message: {}", e);
            true
        }
    }
}

/// Push job snapshots (optionally for one session) plus periodic queue stats
async fn websocket_connection(mut socket: WebSocket, state: AppState, session: Option<String>) {
    info!("🔌 New WebSocket connection established");
    let mut updates = state.manager.subscribe();

    if let Some(job) = session.as_deref().and_then(|s| state.manager.get_status(s)) {
        if !send_live(&mut socket, &LiveMessage::JobUpdate { job: Box::new(job) }).await {
            return;
        }
    }

    let mut ticker = interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if socket.send(Message::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            update = updates.recv() => {
                match update {
                    Ok(job) => {
                        let wanted = session.as_deref().map_or(true, |s| s == job.session_id);
                        if wanted && !send_live(&mut socket, &LiveMessage::JobUpdate { job: Box::new(job) }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket subscriber lagged, skipped {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ticker.tick() => {
                let status = LiveMessage::QueueStatus { status: state.manager.stats() };
                if !send_live(&mut socket, &status).await {
                    break;
                }
            }
        }
    }

    info!("🔌 WebSocket connection ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::processing::{JobRequest, JobRunner, ProgressUpdate};
    use crate::transcription::Transcript;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct IdleRunner;

    #[async_trait]
    impl JobRunner for IdleRunner {
        async fn run(&self, _request: JobRequest, _progress: mpsc::Sender<ProgressUpdate>) -> crate::Result<Transcript> {
            std::future::pending().await
        }
    }

    fn manager() -> JobManager {
        JobManager::new(
            Arc::new(IdleRunner),
            QueueConfig {
                max_concurrency: 1,
                transient_retry_limit: 0,
                retry_base_delay_secs: 0,
                retry_max_delay_secs: 0,
                retention_secs: 60,
            },
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_then_poll_status() {
        let app = router(manager());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sessionId":"abc","sourceRef":"/tmp/a.mp4","language":"en"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let created = body_json(response).await;
        assert_eq!(created["data"]["sessionId"], "abc");

        let response = app
            .oneshot(Request::get("/api/jobs/abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert_eq!(status["data"]["jobId"], created["data"]["jobId"]);
        assert_eq!(status["data"]["status"], "processing");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let response = router(manager())
            .oneshot(Request::get("/api/jobs/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blank_session_is_rejected() {
        let response = router(manager())
            .oneshot(
                Request::post("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sessionId":"","sourceRef":"/tmp/a.mp4"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

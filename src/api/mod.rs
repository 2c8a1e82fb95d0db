//! HTTP front for the job queue: enqueue, status polling and live updates.

use anyhow::Result;
use tracing::info;

use crate::queue::JobManager;

pub mod models;
pub mod server;

/// API Server for handling REST requests and WebSocket connections
#[derive(Clone)]
pub struct ApiServer {
    manager: JobManager,
    port: u16,
}

impl ApiServer {
    pub fn new(manager: JobManager, port: u16) -> Self {
        Self { manager, port }
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        info!("🚀 Starting API server on port {}", self.port);
        server::start_http_server(self.manager, self.port).await
    }
}

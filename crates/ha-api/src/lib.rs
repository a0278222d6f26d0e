//! Home Assistant backup API
//!
//! Serves the backup WebSocket commands and the archive download/upload
//! endpoints using axum.
//! Based on: https://developers.home-assistant.io/docs/api/websocket

pub mod backup;
mod websocket;

use axum::{
    routing::{get, post},
    Json, Router,
};
use ha_backup::BackupManager;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use websocket::{agent_errors_json, error_code};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BackupManager>,
}

impl AppState {
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self { manager }
    }
}

/// API status response
#[derive(Serialize)]
struct ApiStatus {
    message: &'static str,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSocket endpoint
        .route("/api/websocket", get(websocket::ws_handler))
        // Status endpoint
        .route("/api/", get(api_status))
        // Health check
        .route("/api/health", get(health_check))
        // Archive transfer
        .route(
            "/api/backup/download/:backup_id",
            get(backup::download_backup),
        )
        .route("/api/backup/upload", post(backup::upload_backup))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the API server, serving until `shutdown` resolves
pub async fn start_server(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

// ==================== Handlers ====================

/// GET /api/ - Returns API status
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.",
    })
}

/// GET /api/health - Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

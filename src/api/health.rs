//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Gateway status
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub active_sessions: usize,
    pub devices: Vec<String>,
    pub recognition: String,
    pub generation: String,
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Live sessions and configured backends
async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let config = state.manager.config();
    let devices = state.manager.devices().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: devices.len(),
        devices,
        recognition: config.recognition.provider.clone(),
        generation: config.generation.provider.clone(),
    })
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build status router
pub fn status_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .with_state(state)
}

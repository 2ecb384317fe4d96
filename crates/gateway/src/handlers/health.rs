//! Health check handlers

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: careforge_common::VERSION,
    })
}

/// Readiness probe: the orchestrator's store must answer
pub async fn ready(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state
        .orchestrator
        .store()
        .list(careforge_common::db::DocumentFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
    {
        Ok(_) => "ready",
        Err(_) => "degraded",
    };

    Json(HealthResponse {
        status,
        version: careforge_common::VERSION,
    })
}

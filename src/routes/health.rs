//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::cache::CacheStats;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    cache: CacheStats,
}

/// Service health plus artifact cache counters.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        cache: state.service.stats(),
    })
}

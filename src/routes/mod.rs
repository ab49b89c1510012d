//! Route definitions for the preview service.
//!
//! ## Routes
//!
//! - `POST /api/preview` - Render a payload and return the preview envelope
//! - `GET /api/preview/{fingerprint}` - Serve a cached preview document
//! - `GET /health` - Health check with cache counters (JSON)

mod health;
mod preview;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;

use crate::config::ServiceConfig;
use crate::sandbox::ResourcePolicy;
use crate::service::PreviewService;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PreviewService>,
    /// Content-Security-Policy sent with served documents.
    pub csp: HeaderValue,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(service: Arc<PreviewService>, config: &ServiceConfig) -> anyhow::Result<Self> {
        let policy = ResourcePolicy::new(config.sandbox.allowed_origins.clone());
        let csp = HeaderValue::from_str(&policy.content_security_policy())
            .context("allowed origins produce an invalid Content-Security-Policy header")?;
        Ok(Self {
            service,
            csp,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

/// Build the complete preview service router.
pub fn router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route(
            "/api/preview",
            post(preview::create_preview).layer(body_limit),
        )
        .route("/api/preview/{fingerprint}", get(preview::preview_document))
        .route("/health", get(health::health_check))
        .with_state(state)
}

//! Preview orchestration: Validator → Cache → Renderer.
//!
//! Per-request states:
//!
//! ```text
//! Received -> Validated -> CacheHit ---------------------> Completed
//!     |                 \-> CacheMiss -> Rendering -> Completed | Failed
//!     \-> Failed (validation)
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::Instrument;

use crate::artifact::PreviewArtifact;
use crate::cache::{ArtifactCache, CacheStats, Lookup};
use crate::config::ServiceConfig;
use crate::error::PreviewError;
use crate::request::Fingerprint;
use crate::sandbox::{HtmlEngine, MarkupEngine, SandboxRenderer};
use crate::validate::{validate, ValidationLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    CacheHit,
    CacheMiss,
    Rendering,
    Completed,
    Failed,
}

impl RequestState {
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Failed)
                | (Validated, CacheHit)
                | (Validated, CacheMiss)
                | (CacheHit, Completed)
                | (CacheMiss, Rendering)
                | (Rendering, Completed)
                | (Rendering, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// The states a request passed through, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trail(Vec<RequestState>);

impl Trail {
    fn new() -> Self {
        tracing::debug!(state = ?RequestState::Received, "request state");
        Self(vec![RequestState::Received])
    }

    fn current(&self) -> RequestState {
        self.0.last().copied().unwrap_or(RequestState::Received)
    }

    fn advance(&mut self, next: RequestState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(next),
            "illegal transition {current:?} -> {next:?}"
        );
        tracing::debug!(from = ?current, to = ?next, "request state");
        self.0.push(next);
    }

    pub fn states(&self) -> &[RequestState] {
        &self.0
    }
}

/// Successful outcome of [`PreviewService::preview`].
#[derive(Debug, Clone)]
pub struct PreviewReport {
    pub artifact: Arc<PreviewArtifact>,
    pub fingerprint: Fingerprint,
    pub lookup: Lookup,
    pub trail: Trail,
}

pub struct PreviewService<E = HtmlEngine> {
    validation: ValidationLimits,
    renderer: SandboxRenderer<E>,
    cache: ArtifactCache,
}

impl PreviewService<HtmlEngine> {
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_engine(config, HtmlEngine)
    }
}

impl<E: MarkupEngine> PreviewService<E> {
    pub fn with_engine(config: &ServiceConfig, engine: E) -> Self {
        tracing::info!(
            cache_capacity = config.cache_capacity.get(),
            render_timeout_ms = config.sandbox.timeout.as_millis() as u64,
            max_concurrent_renders = config.sandbox.max_concurrent_renders,
            "preview service initialized"
        );
        Self {
            validation: config.validation,
            renderer: SandboxRenderer::with_engine(config.sandbox.clone(), engine),
            cache: ArtifactCache::new(config.cache_capacity),
        }
    }

    /// Run one request through the pipeline.
    ///
    /// # Errors
    /// - `PreviewError::Validation` if the payload fails the schema (nothing is rendered)
    /// - `PreviewError::Render` if the sandbox failed; the failure is not cached
    pub async fn preview(&self, raw: &Value) -> Result<PreviewReport, PreviewError> {
        let span = tracing::debug_span!("preview", request_id = %uuid::Uuid::new_v4());
        self.preview_inner(raw).instrument(span).await
    }

    async fn preview_inner(&self, raw: &Value) -> Result<PreviewReport, PreviewError> {
        let started = Instant::now();
        let mut trail = Trail::new();

        let request = match validate(raw, &self.validation) {
            Ok(request) => request,
            Err(err) => {
                trail.advance(RequestState::Failed);
                tracing::debug!(kind = %err.kind, detail = %err.detail, "validation failed");
                return Err(err.into());
            }
        };
        trail.advance(RequestState::Validated);

        let fingerprint = request.fingerprint();
        let result = self
            .cache
            .get_or_render(fingerprint, || {
                trail.advance(RequestState::CacheMiss);
                trail.advance(RequestState::Rendering);
                self.renderer.render(request)
            })
            .await;

        match result {
            Ok((artifact, lookup)) => {
                match lookup {
                    Lookup::Hit => trail.advance(RequestState::CacheHit),
                    // Waited on another caller's render
                    Lookup::Coalesced => {
                        trail.advance(RequestState::CacheMiss);
                        trail.advance(RequestState::Rendering);
                    }
                    Lookup::Miss => {}
                }
                trail.advance(RequestState::Completed);

                if lookup == Lookup::Miss {
                    for warning in &artifact.diagnostics.warnings {
                        tracing::debug!(warning = %warning, "render diagnostic");
                    }
                }
                tracing::info!(
                    fingerprint = %fingerprint,
                    cache = lookup.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "preview completed"
                );

                Ok(PreviewReport {
                    artifact,
                    fingerprint,
                    lookup,
                    trail,
                })
            }
            Err(error) => {
                if trail.current() != RequestState::Rendering {
                    trail.advance(RequestState::CacheMiss);
                    trail.advance(RequestState::Rendering);
                }
                trail.advance(RequestState::Failed);
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %error,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "preview failed"
                );
                let artifact = PreviewArtifact::failure(&error);
                Err(PreviewError::Render { error, artifact })
            }
        }
    }

    /// A cached artifact by fingerprint; never renders and leaves the cache
    /// counters alone.
    pub fn artifact(&self, fingerprint: &Fingerprint) -> Option<Arc<PreviewArtifact>> {
        self.cache.peek(fingerprint)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }
}

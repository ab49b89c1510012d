//! Error taxonomy for the preview pipeline.
//!
//! - [`ValidationError`]: client-caused, reported as 400
//! - [`RenderError`]: resource or markup failures inside the sandbox,
//!   reported as 502/503/504
//! - [`PreviewError`]: the boundary type handed to the HTTP layer

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::artifact::{PreviewArtifact, PreviewBody};

/// Which validation rule a payload broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationErrorKind {
    MissingField,
    TooLarge,
    WrongType,
    MalformedEncoding,
    UnknownField,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MissingField => "MissingField",
            Self::TooLarge => "TooLarge",
            Self::WrongType => "WrongType",
            Self::MalformedEncoding => "MalformedEncoding",
            Self::UnknownField => "UnknownField",
        };
        f.write_str(name)
    }
}

/// A payload was rejected before it reached the renderer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub detail: String,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ValidationErrorKind::MissingField,
            format!("`{field}` is required"),
        )
    }

    pub fn too_large(field: &str, len: usize, max: usize) -> Self {
        Self::new(
            ValidationErrorKind::TooLarge,
            format!("`{field}` is {len} bytes (max {max})"),
        )
    }

    pub fn wrong_type(field: &str, expected: &str) -> Self {
        Self::new(
            ValidationErrorKind::WrongType,
            format!("`{field}` must be {expected}"),
        )
    }

    pub fn unknown_field(field: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownField,
            format!("`{field}` is not an allowed field"),
        )
    }
}

/// The bound a render ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    /// Wall-clock render time.
    Timeout(Duration),
    /// Accounted working memory in bytes.
    Memory(usize),
    /// Size of the rendered output in bytes.
    Output(usize),
    /// Depth of the open-element stack.
    NestingDepth(usize),
    /// No render slot became free within the timeout.
    Saturated(Duration),
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "render timed out after {}ms", d.as_millis()),
            Self::Memory(max) => write!(f, "render memory exceeded {max} bytes"),
            Self::Output(max) => write!(f, "rendered output exceeded {max} bytes"),
            Self::NestingDepth(max) => write!(f, "markup nesting exceeded {max} levels"),
            Self::Saturated(d) => write!(
                f,
                "no render slot available within {}ms",
                d.as_millis()
            ),
        }
    }
}

/// Failure inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("resource exceeded: {0}")]
    ResourceExceeded(ResourceLimit),

    /// The input could not be rendered (malformed markup, container escapes).
    #[error("render failed: {0}")]
    RenderFailed(String),

    /// The render worker panicked or was lost.
    #[error("render worker crashed: {0}")]
    Crashed(String),
}

impl RenderError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::RenderFailed(reason.into())
    }
}

/// Boundary error returned by [`crate::PreviewService`].
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Render failed; `artifact` is the failure artifact reported to the caller.
    #[error("{error}")]
    Render {
        error: RenderError,
        artifact: PreviewArtifact,
    },

    /// No cached artifact under the requested fingerprint.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(err) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": { "kind": err.kind, "detail": err.detail }
                })),
            )
                .into_response(),
            Self::Render { error, artifact } => {
                let (status, kind) = match &error {
                    RenderError::ResourceExceeded(ResourceLimit::Timeout(_)) => {
                        (StatusCode::GATEWAY_TIMEOUT, "ResourceExceeded")
                    }
                    RenderError::ResourceExceeded(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "ResourceExceeded")
                    }
                    RenderError::RenderFailed(_) => (StatusCode::BAD_GATEWAY, "RenderFailed"),
                    RenderError::Crashed(reason) => {
                        tracing::error!(error = %reason, "render worker crashed");
                        return internal_error_response();
                    }
                };
                (
                    status,
                    Json(json!({
                        "error": { "kind": kind, "detail": error.to_string() },
                        "preview": PreviewBody::from(&artifact),
                    })),
                )
                    .into_response()
            }
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": { "kind": "NotFound", "detail": format!("{what} not found") }
                })),
            )
                .into_response(),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                internal_error_response()
            }
        }
    }
}

fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": { "kind": "InternalError", "detail": "internal error" }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStatus;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::too_large("html", 70_000, 65_536);
        assert_eq!(err.to_string(), "TooLarge: `html` is 70000 bytes (max 65536)");
    }

    #[test]
    fn test_resource_limit_display() {
        let err = RenderError::ResourceExceeded(ResourceLimit::Timeout(Duration::from_millis(2000)));
        assert_eq!(err.to_string(), "resource exceeded: render timed out after 2000ms");
    }

    #[test]
    fn test_validation_maps_to_bad_request() {
        let err = PreviewError::from(ValidationError::wrong_type("code.html", "a string"));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_render_errors_map_by_cause() {
        let cases = [
            (
                RenderError::ResourceExceeded(ResourceLimit::Timeout(Duration::from_secs(2))),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                RenderError::ResourceExceeded(ResourceLimit::Output(10)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (RenderError::failed("stray </i>"), StatusCode::BAD_GATEWAY),
            (
                RenderError::Crashed("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let artifact = PreviewArtifact::failure(&error);
            let response = PreviewError::Render { error, artifact }.into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_failure_artifact_status() {
        let failed = PreviewArtifact::failure(&RenderError::ResourceExceeded(ResourceLimit::Memory(1)));
        assert_eq!(failed.status, ArtifactStatus::Failed);

        let rejected = PreviewArtifact::failure(&RenderError::failed("bad"));
        assert_eq!(rejected.status, ArtifactStatus::Rejected);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err = PreviewError::NotFound("preview".to_string());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_internal_maps_to_500() {
        let err = PreviewError::Internal(anyhow::anyhow!("secret detail"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

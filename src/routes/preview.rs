//! Preview route handlers.
//!
//! `POST /api/preview` accepts `{"code": {"html", "css", "js"}}` and answers
//! with the preview envelope. The full document of a generated preview is
//! served separately by fingerprint, under a locked-down CSP, so a client can
//! load it into an isolated frame.

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use super::AppState;
use crate::artifact::PreviewBody;
use crate::error::{PreviewError, ValidationError, ValidationErrorKind};
use crate::request::Fingerprint;

const FINGERPRINT_HEADER: &str = "x-preview-fingerprint";
const CACHE_HEADER: &str = "x-preview-cache";

#[derive(Serialize)]
struct PreviewEnvelope<'a> {
    preview: PreviewBody<'a>,
}

/// Handle `POST /api/preview`.
///
/// Body-level failures (over the byte cap, not UTF-8, not JSON) are reported
/// as validation errors; everything else is up to [`crate::PreviewService`].
pub async fn create_preview(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, PreviewError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ValidationError::new(
                ValidationErrorKind::TooLarge,
                format!("request body exceeds {} bytes", state.max_body_bytes),
            )
        } else {
            ValidationError::new(ValidationErrorKind::MalformedEncoding, rejection.body_text())
        }
    })?;

    let raw: Value = serde_json::from_slice(&body).map_err(|e| {
        ValidationError::new(
            ValidationErrorKind::MalformedEncoding,
            format!("body is not valid JSON: {e}"),
        )
    })?;

    let report = state.service.preview(&raw).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        FINGERPRINT_HEADER,
        HeaderValue::from_str(&report.fingerprint.to_string())
            .context("fingerprint is not a valid header value")?,
    );
    headers.insert(CACHE_HEADER, HeaderValue::from_static(report.lookup.as_str()));

    let envelope = PreviewEnvelope {
        preview: PreviewBody::from(report.artifact.as_ref()),
    };
    Ok((StatusCode::OK, headers, Json(envelope)).into_response())
}

/// Handle `GET /api/preview/{fingerprint}`.
///
/// Only serves what is already cached; never renders.
pub async fn preview_document(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Response, PreviewError> {
    let fingerprint = raw
        .trim()
        .parse::<Fingerprint>()
        .map_err(|e| ValidationError::new(ValidationErrorKind::MalformedEncoding, e.to_string()))?;

    let artifact = state
        .service
        .artifact(&fingerprint)
        .ok_or_else(|| PreviewError::NotFound(format!("preview {fingerprint}")))?;

    tracing::debug!(fingerprint = %fingerprint, "serving preview document");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_SECURITY_POLICY, state.csp.clone());
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    // Content under a fingerprint never changes
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=3600, immutable"),
    );

    Ok((StatusCode::OK, headers, artifact.document.clone()).into_response())
}

//! Rendered preview artifacts and their wire form.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RenderError;

/// Message attached to every generated preview.
pub const GENERATED_MESSAGE: &str = "Preview placeholder";

/// Snippet used when the request carried no html.
pub const NO_HTML_SNIPPET: &str = "No HTML provided";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArtifactStatus {
    Generated,
    Rejected,
    Failed,
}

/// Warnings collected while rendering, in the order they were raised.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Result of a render. Immutable once built; the cache shares it by `Arc`.
#[derive(Debug, Clone)]
pub struct PreviewArtifact {
    /// The html fragment after sandbox rewriting.
    pub html_snippet: String,
    /// Self-contained document (snippet + css + js) for `<iframe srcdoc>`.
    pub document: String,
    pub status: ArtifactStatus,
    pub generated_at: DateTime<Utc>,
    pub diagnostics: Diagnostics,
}

impl PreviewArtifact {
    pub fn generated(html_snippet: String, document: String, diagnostics: Diagnostics) -> Self {
        Self {
            html_snippet,
            document,
            status: ArtifactStatus::Generated,
            generated_at: Utc::now(),
            diagnostics,
        }
    }

    /// Artifact reported alongside a render error. Never cached.
    pub fn failure(error: &RenderError) -> Self {
        let status = match error {
            RenderError::RenderFailed(_) => ArtifactStatus::Rejected,
            RenderError::ResourceExceeded(_) | RenderError::Crashed(_) => ArtifactStatus::Failed,
        };
        Self {
            html_snippet: String::new(),
            document: String::new(),
            status,
            generated_at: Utc::now(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn message(&self) -> &'static str {
        match self.status {
            ArtifactStatus::Generated => GENERATED_MESSAGE,
            ArtifactStatus::Rejected => "Preview rejected",
            ArtifactStatus::Failed => "Preview failed",
        }
    }
}

/// The `preview` object of an HTTP response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBody<'a> {
    pub message: &'static str,
    pub html_snippet: &'a str,
    pub status: ArtifactStatus,
}

impl<'a> From<&'a PreviewArtifact> for PreviewBody<'a> {
    fn from(artifact: &'a PreviewArtifact) -> Self {
        Self {
            message: artifact.message(),
            html_snippet: &artifact.html_snippet,
            status: artifact.status,
        }
    }
}

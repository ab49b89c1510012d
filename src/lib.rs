//! # Preview Sandbox
//!
//! A service that turns untrusted `{html, css, js}` snippets into preview
//! artifacts, rendering each one in an isolated, resource-limited sandbox and
//! caching results by content fingerprint.
//!
//! ## Security Guarantees
//!
//! - **Nothing executes**: submitted script and markup are treated as text
//! - **No network reach**: resource URLs outside the origin allowlist are
//!   neutralized, and served documents carry a locked-down CSP
//! - **Bounded renders**: wall-clock, memory, output and nesting ceilings,
//!   with a fixed number of concurrent render slots
//! - **Contained failures**: a panicking or timed-out render fails only its
//!   own request and is never cached
//!
//! ## Usage
//!
//! ```rust,ignore
//! use preview_sandbox::{PreviewService, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = PreviewService::new(&ServiceConfig::default());
//!     let report = service
//!         .preview(&serde_json::json!({ "code": { "html": "<b>hi</b>" } }))
//!         .await
//!         .unwrap();
//!
//!     println!("{}", report.artifact.html_snippet);
//! }
//! ```

pub mod artifact;
pub mod cache;
pub mod config;
pub mod error;
pub mod request;
pub mod routes;
pub mod sandbox;
pub mod server;
pub mod service;
pub mod validate;

pub use artifact::{ArtifactStatus, Diagnostics, PreviewArtifact, PreviewBody};
pub use cache::{ArtifactCache, CacheStats, Lookup};
pub use config::ServiceConfig;
pub use error::{PreviewError, RenderError, ResourceLimit, ValidationError, ValidationErrorKind};
pub use request::{Fingerprint, PreviewRequest};
pub use routes::{router, AppState};
pub use sandbox::{
    HtmlEngine, MarkupEngine, RenderContext, RenderedMarkup, SandboxConfig, SandboxRenderer,
};
pub use server::PreviewServer;
pub use service::{PreviewReport, PreviewService, RequestState, Trail};
pub use validate::{validate, ValidationLimits};

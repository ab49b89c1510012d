//! Sandbox renderer - turns a validated request into a preview artifact.
//!
//! Each render runs on its own blocking worker with:
//! - a private [`RenderContext`] (no state shared between renders)
//! - a wall-clock timeout enforced by the caller
//! - cooperative cancellation via a [`TerminationHandle`]
//! - accounted memory and output ceilings, and a nesting-depth ceiling
//! - a [`ResourcePolicy`] that keeps rendered markup off the network
//!
//! The engine never executes any of the submitted text.

mod html;
mod policy;

pub use html::HtmlEngine;
pub use policy::{ResourcePolicy, UrlVerdict};

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::artifact::{Diagnostics, PreviewArtifact};
use crate::error::{RenderError, ResourceLimit};
use crate::request::PreviewRequest;

/// How long a timed-out worker gets to observe termination before we stop waiting.
const TERMINATION_GRACE: Duration = Duration::from_millis(250);

/// Configuration for the render sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum wall-clock time for a single render (default: 2s)
    pub timeout: Duration,
    /// Ceiling on accounted working memory per render (default: 16MB)
    pub max_memory_bytes: usize,
    /// Ceiling on rendered output per render (default: 256KB)
    pub max_output_bytes: usize,
    /// Maximum open-element depth (default: 32)
    pub max_depth: usize,
    /// Renders allowed to run at once (default: available CPUs)
    pub max_concurrent_renders: usize,
    /// Origins rendered markup may load resources from (empty = none)
    pub allowed_origins: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_memory_bytes: 16 * 1024 * 1024,
            max_output_bytes: 256 * 1024,
            max_depth: 32,
            max_concurrent_renders: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            allowed_origins: vec![],
        }
    }
}

/// Thread-safe flag used to ask a running render to stop.
#[derive(Debug, Clone, Default)]
pub struct TerminationHandle(Arc<AtomicBool>);

impl TerminationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Terminates the render if the awaiting future is dropped (e.g. client gone).
struct TerminateOnDrop(TerminationHandle);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// Per-render state handed to a [`MarkupEngine`].
pub struct RenderContext {
    termination: TerminationHandle,
    policy: Arc<ResourcePolicy>,
    timeout: Duration,
    max_memory_bytes: usize,
    max_output_bytes: usize,
    max_depth: usize,
    output_bytes: usize,
    working_bytes: usize,
    diagnostics: Diagnostics,
}

impl RenderContext {
    pub fn new(config: &SandboxConfig, policy: Arc<ResourcePolicy>, termination: TerminationHandle) -> Self {
        Self {
            termination,
            policy,
            timeout: config.timeout,
            max_memory_bytes: config.max_memory_bytes,
            max_output_bytes: config.max_output_bytes,
            max_depth: config.max_depth,
            output_bytes: 0,
            working_bytes: 0,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Engines call this between units of work; it fails once termination was requested.
    pub fn checkpoint(&self) -> Result<(), RenderError> {
        if self.termination.is_terminated() {
            return Err(RenderError::ResourceExceeded(ResourceLimit::Timeout(self.timeout)));
        }
        Ok(())
    }

    /// Append to an output buffer, charging the output and memory budgets.
    pub fn emit(&mut self, out: &mut String, text: &str) -> Result<(), RenderError> {
        let output = self.output_bytes + text.len();
        if output > self.max_output_bytes {
            return Err(RenderError::ResourceExceeded(ResourceLimit::Output(
                self.max_output_bytes,
            )));
        }
        self.charge_memory(text.len())?;
        self.output_bytes = output;
        out.push_str(text);
        Ok(())
    }

    /// Account for working memory that is not output.
    pub fn reserve(&mut self, bytes: usize) -> Result<(), RenderError> {
        self.charge_memory(bytes)?;
        self.working_bytes += bytes;
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        self.working_bytes = self.working_bytes.saturating_sub(bytes);
    }

    fn charge_memory(&self, bytes: usize) -> Result<(), RenderError> {
        if self.output_bytes + self.working_bytes + bytes > self.max_memory_bytes {
            return Err(RenderError::ResourceExceeded(ResourceLimit::Memory(
                self.max_memory_bytes,
            )));
        }
        Ok(())
    }

    pub fn check_depth(&self, depth: usize) -> Result<(), RenderError> {
        if depth > self.max_depth {
            return Err(RenderError::ResourceExceeded(ResourceLimit::NestingDepth(
                self.max_depth,
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.diagnostics.warn(msg);
    }

    fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }
}

/// Output of a markup engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMarkup {
    pub snippet: String,
    pub document: String,
}

/// The code that runs inside the sandbox.
///
/// Implementations are synchronous, must call [`RenderContext::checkpoint`]
/// regularly, and must route all output through [`RenderContext::emit`].
pub trait MarkupEngine: Send + Sync + 'static {
    fn render(
        &self,
        request: &PreviewRequest,
        ctx: &mut RenderContext,
    ) -> Result<RenderedMarkup, RenderError>;
}

/// Runs a [`MarkupEngine`] under the limits of a [`SandboxConfig`].
pub struct SandboxRenderer<E = HtmlEngine> {
    engine: Arc<E>,
    config: SandboxConfig,
    policy: Arc<ResourcePolicy>,
    permits: Arc<Semaphore>,
}

impl SandboxRenderer<HtmlEngine> {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_engine(config, HtmlEngine)
    }
}

impl<E: MarkupEngine> SandboxRenderer<E> {
    pub fn with_engine(config: SandboxConfig, engine: E) -> Self {
        let policy = Arc::new(ResourcePolicy::new(config.allowed_origins.clone()));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_renders.max(1)));
        Self {
            engine: Arc::new(engine),
            config,
            policy,
            permits,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Render a request and return the artifact.
    ///
    /// # Errors
    /// - `ResourceExceeded(Timeout)` if the render outlives `config.timeout`
    /// - `ResourceExceeded(Saturated)` if no render slot frees up within `config.timeout`
    /// - `ResourceExceeded(Memory | Output | NestingDepth)` on a budget breach
    /// - `RenderFailed` if the engine cannot render the input
    /// - `Crashed` if the worker panicked
    pub async fn render(&self, request: PreviewRequest) -> Result<PreviewArtifact, RenderError> {
        let timeout = self.config.timeout;

        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RenderError::Crashed("render pool closed".to_string())),
            Err(_) => {
                return Err(RenderError::ResourceExceeded(ResourceLimit::Saturated(timeout)));
            }
        };

        let termination = TerminationHandle::new();
        let _guard = TerminateOnDrop(termination.clone());
        let mut ctx = RenderContext::new(&self.config, self.policy.clone(), termination.clone());
        let engine = self.engine.clone();
        let started = Instant::now();

        let mut task = tokio::task::spawn_blocking(move || {
            // Slot is held until the worker really finishes, even after a timeout
            let _permit = permit;
            ctx.reserve(request.content_len())?;
            let markup = engine.render(&request, &mut ctx)?;
            Ok::<_, RenderError>(PreviewArtifact::generated(
                markup.snippet,
                markup.document,
                ctx.into_diagnostics(),
            ))
        });

        let joined = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                termination.terminate();
                if tokio::time::timeout(TERMINATION_GRACE, &mut task).await.is_err() {
                    tracing::warn!(
                        grace_ms = TERMINATION_GRACE.as_millis() as u64,
                        "render worker still running after termination"
                    );
                }
                tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "render timed out");
                return Err(RenderError::ResourceExceeded(ResourceLimit::Timeout(timeout)));
            }
        };

        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "render finished");

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(RenderError::Crashed(panic_message(e.into_panic()))),
            Err(e) => Err(RenderError::Crashed(e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "render worker panicked".to_string()
    }
}

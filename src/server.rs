//! HTTP server lifecycle.
//!
//! [`PreviewServer::start`] binds, spawns the axum server, and returns once
//! the listener is up. [`PreviewServer::stop`] drains in-flight requests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Request;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::config::ServiceConfig;
use crate::routes::{router, AppState};
use crate::service::PreviewService;

/// A running preview server.
pub struct PreviewServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl PreviewServer {
    /// Bind `config.bind_addr()` and start serving.
    ///
    /// Port 0 picks a free port; see [`PreviewServer::local_addr`].
    pub async fn start(config: ServiceConfig) -> anyhow::Result<Self> {
        let service = Arc::new(PreviewService::new(&config));
        let state = AppState::new(service, &config)?;

        let app = router(state)
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                    tracing::span!(
                        Level::INFO,
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                }),
            )
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );

        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        let local_addr = listener.local_addr()?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    // A dropped sender also means shut down
                    let _ = signal.await;
                })
                .await
        });

        tracing::info!(addr = %local_addr, "preview server listening");

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn stop(self) -> anyhow::Result<()> {
        let Self { shutdown, task, .. } = self;
        // Err means the server already exited; the join below reports why
        let _ = shutdown.send(());
        task.await
            .context("preview server task panicked")?
            .context("preview server failed")?;
        tracing::info!("preview server stopped");
        Ok(())
    }
}

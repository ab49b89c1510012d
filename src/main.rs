//! Preview Sandbox CLI
//!
//! Server mode (default):
//!   preview-sandbox [serve] [--port 3000]
//!
//! Single-shot mode:
//!   preview-sandbox render '{"code":{"html":"<b>hi</b>"}}'
//!
//!   The rendered snippet goes to stdout; diagnostics go to stderr.
//!   Exit status is non-zero if the payload is rejected or the render fails.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use preview_sandbox::{PreviewError, PreviewServer, PreviewService, ServiceConfig};

/// Preview Sandbox - isolated previews for untrusted HTML/CSS/JS snippets.
#[derive(Parser, Debug)]
#[command(name = "preview-sandbox")]
#[command(about = "Sandboxed code preview service", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve {
        /// Listen port, overrides PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Render one JSON payload and print the snippet
    Render {
        /// Request body, e.g. '{"code":{"html":"<b>hi</b>"}}'
        payload: String,
    },
}

/// Run in single-shot mode
async fn run_single_shot(config: ServiceConfig, payload: &str) -> Result<()> {
    let raw: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| anyhow!("Invalid payload JSON: {}", e))?;

    let service = PreviewService::new(&config);
    let report = match service.preview(&raw).await {
        Ok(report) => report,
        Err(PreviewError::Validation(err)) => return Err(anyhow!("Payload rejected: {}", err)),
        Err(err) => return Err(anyhow!("Preview failed: {}", err)),
    };

    // Print diagnostics to stderr
    for warning in &report.artifact.diagnostics.warnings {
        eprintln!("[WARN] {}", warning);
    }
    eprintln!("[fingerprint] {}", report.fingerprint);

    // Print snippet to stdout
    println!("{}", report.artifact.html_snippet);

    Ok(())
}

/// Run the HTTP service until ctrl-c
async fn run_server(config: ServiceConfig) -> Result<()> {
    let server = PreviewServer::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    server.stop().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = ServiceConfig::from_env()?;

    match args.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            run_server(config).await
        }
        Command::Render { payload } => run_single_shot(config, &payload).await,
    }
}

#![forbid(unsafe_code)]

//! HTTP server for the scraper, compressor and downloader, plus the static
//! frontend build.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use motherhen::{
    api::{AppState, router},
    config::{RuntimeOverrides, resolve_runtime_config},
    logging::init_logging,
};
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve the scraper, compressor and downloader API")]
struct BackendArgs {
    /// Directory holding downloads, compressed videos, scraped pages and logs.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Frontend build served for non-API paths.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Alternate env file (defaults to `.env`).
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root,
            www_root: self.www_root,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = resolve_runtime_config(BackendArgs::parse().into_overrides())?;
    config.prepare()?;
    let _log_guard = init_logging(&config.logs_dir(), config.log_format)?;

    let state = AppState::probe(&config).await;
    let modules = state.modules();
    info!(
        scraper = modules.scraper,
        compressor = modules.compressor,
        downloader = modules.downloader,
        "modules initialised"
    );
    if !config.www_root.join("index.html").is_file() {
        info!(www_root = %config.www_root.display(), "no frontend build found");
    }

    let app = router(state, config.max_upload_bytes());
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding to {}:{}", config.host, config.port))?;
    let addr = listener.local_addr().context("reading listener address")?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

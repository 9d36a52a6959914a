#![forbid(unsafe_code)]

//! HTTP entry point: downloads videos on request and reports progress over
//! per-session WebSockets.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tubefetch::{
    config::{SettingsOverrides, resolve_settings},
    server::{AppState, router},
};

const DEFAULT_LOG_FILTER: &str = "tubefetch=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "tubefetch", about = "Video download service with live progress")]
struct Cli {
    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// dotenv file with TUBEFETCH_* settings.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    /// Path to the yt-dlp executable.
    #[arg(long, value_name = "PATH")]
    ytdlp_bin: Option<PathBuf>,
    /// Per-download deadline in seconds.
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,
}

impl Cli {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            host: self.host,
            port: self.port,
            ytdlp_bin: self.ytdlp_bin,
            download_timeout_secs: self.timeout_secs,
            env_path: self.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = resolve_settings(Cli::parse().into_overrides())?;
    let state = AppState::from_settings(&settings);
    let app = router(state, &settings.cors_origins);

    let addr = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        ytdlp = %settings.ytdlp_bin.display(),
        timeout_secs = settings.download_timeout.as_secs(),
        "tubefetch listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

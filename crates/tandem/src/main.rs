//! # tandem
//!
//! Signaling server binary: loads settings, initializes logging and
//! metrics, and serves the pairing and broadcast endpoints until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_server::{ServerConfig, TandemServer};
use tandem_settings::{LogFormat, TandemSettings};

/// Anonymous peer pairing and signaling relay.
#[derive(Parser, Debug)]
#[command(name = "tandem", version, about = "Anonymous peer pairing and signaling relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent WebSocket connections (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Settings file (default `~/.tandem/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Do not install the Prometheus recorder.
    #[arg(long)]
    no_metrics: bool,
}

/// Merge loaded settings with CLI flags into the runtime config.
fn build_config(settings: &TandemSettings, cli: &Cli) -> ServerConfig {
    ServerConfig {
        host: cli.host.clone().unwrap_or_else(|| settings.server.host.clone()),
        port: cli.port.unwrap_or(settings.server.port),
        max_connections: cli.max_connections.unwrap_or(settings.server.max_connections),
        heartbeat_interval_secs: settings.server.heartbeat_interval_secs,
        heartbeat_timeout_secs: settings.server.heartbeat_timeout_secs,
        max_message_size: settings.server.max_message_size,
        send_queue_capacity: settings.pairing.send_queue_capacity,
        max_send_failures: settings.pairing.max_send_failures,
        search_poll_interval_ms: settings.pairing.search_poll_interval_ms,
        shutdown_timeout_secs: settings.server.shutdown_timeout_secs,
    }
}

fn init_logging(settings: &TandemSettings, cli: &Cli) {
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or_else(|| settings.logging.level.as_filter_str());
    if cli.json_logs || settings.logging.format == LogFormat::Json {
        tandem_core::logging::init_json_subscriber(level);
    } else {
        tandem_core::logging::init_subscriber(level);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Settings first: they carry the log level.
    let settings_path = cli.settings.clone().unwrap_or_else(tandem_settings::settings_path);
    let settings = tandem_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    init_logging(&settings, &cli);
    tracing::info!(path = %settings_path.display(), "settings loaded");

    let metrics = if cli.no_metrics {
        None
    } else {
        Some(tandem_server::metrics::install_recorder().context("Failed to install metrics recorder")?)
    };

    let config = build_config(&settings, &cli);
    let server = TandemServer::new(config, metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(%addr, "tandem ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown().await {
        tracing::warn!("some sessions did not close in time");
    }
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

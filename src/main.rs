//! # AI Gateway - Main Entry Point
//!
//! Loads configuration, starts every gateway component and keeps them running until SIGINT or
//! SIGTERM, then shuts down in order.
//!
//! Configuration comes from the YAML file named by `GATEWAY_CONFIG_PATH` when set, otherwise from
//! defaults. `GATEWAY_*` variables override either.

use ai_gateway::core::config::GatewayConfig;
use ai_gateway::observability::init_logging;
use ai_gateway::GatewayContext;
use anyhow::Context;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH").ok().map(PathBuf::from);

    let config = GatewayConfig::load(config_path.as_deref())
        .await
        .context("failed to load gateway configuration")?;

    init_logging(&config.logging).context("failed to initialize logging")?;

    info!("Starting AI gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!(path = %path.display(), "Configuration loaded");
    }

    let context = GatewayContext::init(config)
        .await
        .context("failed to initialize gateway")?;

    match serde_json::to_string(&context.status().await) {
        Ok(status) => info!(%status, "Gateway ready"),
        Err(e) => error!(error = %e, "Failed to serialize gateway status"),
    }

    shutdown_signal().await;
    info!("Shutdown signal received, beginning graceful shutdown");

    context.shutdown().await;
    info!("AI gateway shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

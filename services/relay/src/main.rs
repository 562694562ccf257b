//! culvertd - the culvert relay server.
//!
//! A publicly reachable relay that accepts control connections from
//! tunnel clients and exposes a public TCP port or an HTTP virtual host
//! per tunnel, relaying downstream traffic over the control connection.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use culvert_relay::{Config, RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Prefer RUST_LOG, fall back to the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting culvert relay");

    let server = RelayServer::bind(&config)
        .await
        .context("failed to bind relay listeners")?;
    info!(
        control_bind = %server.local_addr()?,
        http_bind = ?server.http_addr(),
        allowed_ports = %config
            .allowed_ports
            .as_ref()
            .map_or_else(|| "any".to_string(), ToString::to_string),
        idle_timeout_secs = config.idle_timeout_secs,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_handle = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Relay exited"),
                Ok(Err(e)) => error!(error = %e, "Relay error"),
                Err(e) => error!(error = %e, "Relay task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), server_handle).await;
    info!("Relay shutdown complete");
    Ok(())
}

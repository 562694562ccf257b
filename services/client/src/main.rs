//! culvert - the culvert tunnel client.
//!
//! Connects out to a relay, requests a tunnel for one local service and
//! keeps it alive, dialing the service once per downstream session the
//! relay announces.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use culvert_client::{control, Args, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Prefer RUST_LOG, fall back to the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting culvert client");

    let settings = Settings::resolve(&args).context("invalid configuration")?;
    info!(
        relay_addr = %settings.relay_addr,
        request = %settings.request,
        heartbeat_secs = settings.heartbeat.as_secs(),
        reconnect_secs = settings.reconnect_delay.as_secs(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut client_handle = tokio::spawn(control::run(settings, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut client_handle => {
            return match result {
                Ok(Ok(())) => {
                    info!("Client exited");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Client failed");
                    Err(e.into())
                }
                Err(e) => {
                    error!(error = %e, "Client task panicked");
                    Err(e.into())
                }
            };
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), client_handle).await;
    info!("Client shutdown complete");
    Ok(())
}

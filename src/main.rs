//! Bose ControlSpace / Home Assistant bridge daemon.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bose_hass_bridge::bridge::Bridge;
use bose_hass_bridge::config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bose_hass_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Bose/Home Assistant bridge");

    let config = config::load_config()?;
    tracing::info!(
        zones = config.zones.len(),
        sources = config.sources.len(),
        amp = %config.amp.host,
        hub = %config.hub.host,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let bridge = Bridge::new(config, shutdown.clone());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    bridge.run().await
}

//! `mtconnect-uns` binary: reads observations from stdin and republishes
//! them to the configured MQTT brokers.

use anyhow::{Context, Result};
use mtconnect_uns_agent::{source, Forwarder, ForwarderConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is left free for pipelines
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting MTConnect UNS forwarder"
    );

    // Load configuration
    let config = ForwarderConfig::from_env().context("Invalid configuration")?;

    tracing::info!(
        client_id = %config.client_id,
        broker = %config.broker.address,
        port = config.broker.port,
        mirrors = config.mirrors.len(),
        "Configuration loaded"
    );

    let forwarder = Forwarder::from_config(&config).await;
    forwarder.start().await;

    let feed = source::spawn_json_lines(tokio::io::stdin(), config.queue_capacity);
    forwarder
        .run(feed, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    forwarder.stop().await;

    Ok(())
}

//! Client entry point.
//!
//! Loads the configuration, connects to the server and keeps the tunnels
//! alive until ctrl-c.

use anyhow::Context as _;
use burrow_client::config::ClientConfig;
use burrow_client::dispatcher::TunnelClient;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::load(std::env::args().nth(1)).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("burrow_client={}", config.log_level).into()),
        )
        .init();

    anyhow::ensure!(!config.tunnels.is_empty(), "no tunnels configured");
    for tunnel in &config.tunnels {
        tunnel.validate().context("invalid tunnel configuration")?;
    }

    let client = TunnelClient::new(config);
    let runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    client.shutdown().await;
    let _ = runner.await;
    Ok(())
}

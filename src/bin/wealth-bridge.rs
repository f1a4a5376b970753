use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use omni_core::config::RelayConfig;
use omni_core::http;
use omni_core::relay::{self, EconomyClient, RelayState};
use omni_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::parse();
    init_tracing(config.log.log_format, config.log.log_level)?;

    if config.webhook_secret.is_none() {
        warn!("[RELAY] STRIPE_WEBHOOK_SECRET unset, webhook signatures are not checked");
    }
    let client = reqwest::Client::builder()
        .build()
        .context("building http client")?;
    let state = Arc::new(RelayState {
        webhook_secret: config.webhook_secret.clone(),
        tolerance: Duration::from_secs(config.signature_tolerance_secs),
        economy: EconomyClient::new(client, config.economy_url.clone()),
    });

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    info!("[RELAY] wealth bridge forwarding to {}", config.economy_url);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(http::serve(
        listener,
        move |req, peer| relay::handle_request(state.clone(), req, peer),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    server.await.context("server task")??;
    Ok(())
}

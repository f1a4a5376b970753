use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use omni_core::config::ProxyConfig;
use omni_core::http;
use omni_core::proxy::{self, LlmClient};
use omni_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::parse();
    init_tracing(config.log.log_format, config.log.log_level)?;

    let client = reqwest::Client::builder()
        .build()
        .context("building http client")?;
    let llm = Arc::new(LlmClient::new(client, config.endpoint.clone(), config.api_key.clone()));

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    info!("[PROXY] ai proxy upstream {}", config.endpoint);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(http::serve(
        listener,
        move |req, peer| proxy::handle_request(llm.clone(), req, peer),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    server.await.context("server task")??;
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use omni_core::auditor::ProjectAuditor;
use omni_core::config::ServerConfig;
use omni_core::matrix::ServiceMatrix;
use omni_core::telemetry::init_tracing;
use omni_core::transport::{serve_dashboard, DashboardState};
use omni_core::{ConnectionRegistry, GovernorSet, Heartbeat, Telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.log.log_format, config.log.log_level)?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("omni-core/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building http client")?;

    let telemetry = Arc::new(Telemetry::new()?);
    let registry = Arc::new(ConnectionRegistry::new(config.send_timeout()));
    let governors = GovernorSet::standard(client.clone(), &config.market_url, &config.energy_url);

    let heartbeat = Heartbeat::new(
        governors,
        registry.clone(),
        telemetry.clone(),
        config.tick_interval(),
        config.sensor_timeout(),
    )
    .with_collector(Arc::new(ProjectAuditor::new(&config.audit_root, config.audit_cache())))
    .with_collector(Arc::new(ServiceMatrix::new(
        client,
        config.services.clone(),
        config.health_cache(),
    )))
    .with_ledger_capacity(config.ledger_capacity as usize);

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    info!(
        "[OMNI] live view on ws://{}/ws, tick every {} ms",
        listener.local_addr()?,
        config.tick_interval_ms
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));
    let state = Arc::new(DashboardState {
        registry,
        telemetry,
        public_dir: config.public_dir.clone(),
    });
    let server_task = tokio::spawn(serve_dashboard(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("[OMNI] shutdown requested");
    let _ = shutdown_tx.send(true);

    let heartbeat = loop_task.await.context("heartbeat task")?;
    info!(ledger_height = heartbeat.ledger().height(), "[OMNI] heartbeat drained");
    if let Err(e) = server_task.await.context("server task")? {
        error!("[OMNI] server exited with error: {}", e);
    }
    Ok(())
}

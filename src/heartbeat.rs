//! The broadcast loop.
//!
//! Every tick: cycle the governors in order, run the orchestrator rule,
//! gather auxiliary metrics, append to the stress ledger, then serialize the
//! payload once and fan it out through the registry. A failing tick (error
//! or panic) is logged and counted at the tick boundary; the next tick runs
//! on schedule regardless.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use futures::FutureExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::governor::{CycleOutcome, GovernorSet};
use crate::ledger::StressLedger;
use crate::orchestrator::{self, OrchestratorVerdict};
use crate::payload::BroadcastPayload;
use crate::registry::ConnectionRegistry;
use crate::telemetry::Telemetry;

#[derive(Debug, Error)]
pub enum TickError {
    #[error("collector {name} failed: {reason}")]
    Collector { name: &'static str, reason: String },
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Source of one auxiliary entry in the payload's `metrics` map.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect(&self) -> Result<Value, TickError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub verdict: OrchestratorVerdict,
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Heartbeat {
    governors: GovernorSet,
    registry: Arc<ConnectionRegistry>,
    collectors: Vec<Arc<dyn MetricsCollector>>,
    ledger: StressLedger,
    telemetry: Arc<Telemetry>,
    tick_interval: Duration,
    sensor_timeout: Duration,
}

impl Heartbeat {
    pub fn new(
        governors: GovernorSet,
        registry: Arc<ConnectionRegistry>,
        telemetry: Arc<Telemetry>,
        tick_interval: Duration,
        sensor_timeout: Duration,
    ) -> Self {
        Self {
            governors,
            registry,
            collectors: Vec::new(),
            ledger: StressLedger::new(3600),
            telemetry,
            tick_interval,
            sensor_timeout,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger = StressLedger::new(capacity);
        self
    }

    pub fn governors(&self) -> &GovernorSet {
        &self.governors
    }

    pub fn ledger(&self) -> &StressLedger {
        &self.ledger
    }

    /// Tick until `shutdown` flips to `true` (or its sender is dropped), then
    /// hand the loop back to the caller.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            governors = self.governors.len(),
            "[HEARTBEAT] started"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_guarded().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(ticks = self.telemetry.ticks_total.get(), "[HEARTBEAT] stopped");
        self
    }

    /// One tick with the failure boundary applied.
    pub async fn tick_guarded(&mut self) -> Option<TickReport> {
        match AssertUnwindSafe(self.tick()).catch_unwind().await {
            Ok(Ok(report)) => {
                self.telemetry.ticks_total.inc();
                Some(report)
            }
            Ok(Err(e)) => {
                self.telemetry.tick_failures_total.inc();
                warn!("[HEARTBEAT] tick skipped: {}", e);
                None
            }
            Err(panic) => {
                self.telemetry.tick_failures_total.inc();
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("[HEARTBEAT] tick panicked: {}", reason);
                None
            }
        }
    }

    /// The unguarded tick body.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let outcomes = self.governors.run_cycles(self.sensor_timeout).await;
        for (domain, outcome) in &outcomes {
            if let CycleOutcome::Failed(reason) = outcome {
                self.telemetry.observe_sensor_failure(domain);
                debug!(domain, "[HEARTBEAT] sensor failure: {}", reason);
            }
        }

        let verdict = orchestrator::evaluate(&mut self.governors);
        for governor in self.governors.iter() {
            self.telemetry.observe_stress(governor.domain(), governor.current_stress());
        }

        let mut metrics = BTreeMap::new();
        for collector in &self.collectors {
            metrics.insert(collector.name().to_string(), collector.collect().await?);
        }

        let timestamp = Local::now().format("%H:%M:%S").to_string();
        let entry = self.ledger.append(
            &timestamp,
            self.governors.iter().map(|g| (g.domain(), g.current_stress())),
        );
        metrics.insert(
            "ledger".to_string(),
            json!({ "height": entry.height + 1, "head": entry.hash }),
        );

        let payload = BroadcastPayload {
            timestamp,
            domains: self.governors.readings(),
            orchestrator: verdict.status.to_string(),
            metrics,
        };
        let text = payload.to_json()?;

        let broadcast = self.registry.broadcast(&text).await;
        self.telemetry
            .broadcast_dropped_total
            .inc_by(broadcast.dropped.len() as u64);
        self.telemetry.subscribers.set(self.registry.len() as i64);

        Ok(TickReport {
            verdict,
            attempted: broadcast.attempted,
            delivered: broadcast.delivered,
            dropped: broadcast.dropped.len(),
        })
    }
}

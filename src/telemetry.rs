//! Logging bootstrap and the heartbeat's Prometheus metrics.

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;
use tracing::Level;

use crate::config::LogFormat;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metric exposition is not utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("tracing subscriber already installed")]
    AlreadyInstalled,
}

/// Install the global fmt subscriber. Call once per process.
pub fn init_tracing(format: LogFormat, level: Level) -> Result<(), TelemetryError> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|_| TelemetryError::AlreadyInstalled)
}

/// Heartbeat counters and gauges on a private registry.
pub struct Telemetry {
    registry: Registry,
    pub ticks_total: IntCounter,
    pub tick_failures_total: IntCounter,
    pub subscribers: IntGauge,
    pub broadcast_dropped_total: IntCounter,
    pub governor_stress: GaugeVec,
    pub sensor_failures_total: IntCounterVec,
}

impl Telemetry {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let ticks_total = IntCounter::new(
            "omni_ticks_total",
            "Heartbeat ticks that broadcast a payload",
        )?;
        let tick_failures_total = IntCounter::new(
            "omni_tick_failures_total",
            "Heartbeat ticks aborted at the tick boundary",
        )?;
        let subscribers = IntGauge::new(
            "omni_subscribers",
            "Live-view subscribers currently registered",
        )?;
        let broadcast_dropped_total = IntCounter::new(
            "omni_broadcast_dropped_total",
            "Subscribers removed after a failed send",
        )?;
        let governor_stress = GaugeVec::new(
            Opts::new("omni_governor_stress", "Last normalized stress per domain"),
            &["domain"],
        )?;
        let sensor_failures_total = IntCounterVec::new(
            Opts::new("omni_sensor_failures_total", "Failed sensor reads per domain"),
            &["domain"],
        )?;

        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(tick_failures_total.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(broadcast_dropped_total.clone()))?;
        registry.register(Box::new(governor_stress.clone()))?;
        registry.register(Box::new(sensor_failures_total.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            tick_failures_total,
            subscribers,
            broadcast_dropped_total,
            governor_stress,
            sensor_failures_total,
        })
    }

    pub fn observe_stress(&self, domain: &str, stress: f64) {
        self.governor_stress.with_label_values(&[domain]).set(stress);
    }

    pub fn observe_sensor_failure(&self, domain: &str) {
        self.sensor_failures_total.with_label_values(&[domain]).inc();
    }

    /// Prometheus text exposition.
    pub fn encode(&self) -> Result<String, TelemetryError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

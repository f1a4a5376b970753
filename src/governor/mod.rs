//! Domain governors: one stateful wrapper per monitored signal.
//!
//! A [`Governor`] owns a [`SignalSource`], normalizes each reading against the
//! source's fixed ceiling and remembers the last stress value and action for
//! the broadcast payload. Sensor failures never leave the governor; they are
//! reported through `ERROR` state only.

mod sources;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::payload::DomainReading;

pub use sources::{
    parse_shortwave_radiation, parse_ticker_price, BioHealthSource, EnergyGridSource,
    MarketRiskSource, DEFAULT_ENERGY_URL, DEFAULT_MARKET_URL,
};

/// Failure modes of a single sensor read.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor read timed out after {0:?}")]
    Timeout(Duration),
    #[error("sensor transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed sensor reading: {0}")]
    Malformed(String),
}

/// The two countermeasure labels a domain can choose between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountermeasureSet {
    pub standard: &'static str,
    pub forced: &'static str,
}

/// Last action reported by a governor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GovernorAction {
    Idle,
    Optimal,
    Error,
    Countermeasure(&'static str),
}

impl GovernorAction {
    pub fn label(&self) -> &'static str {
        match self {
            GovernorAction::Idle => "IDLE",
            GovernorAction::Optimal => "OPTIMAL",
            GovernorAction::Error => "ERROR",
            GovernorAction::Countermeasure(label) => *label,
        }
    }
}

impl fmt::Display for GovernorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for GovernorAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Capability every monitored domain implements.
///
/// Adding a domain means implementing this trait; the heartbeat and the
/// registry never change.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn domain(&self) -> &'static str;
    /// Normalization ceiling for raw readings.
    fn max_limit(&self) -> f64;
    fn countermeasures(&self) -> CountermeasureSet;
    async fn read_sensor(&self) -> Result<f64, SensorError>;
}

/// `clamp(raw / max_limit, 0, 1)`; `None` for readings that cannot be
/// normalized (non-finite input or a non-positive ceiling).
pub fn normalize_stress(raw: f64, max_limit: f64) -> Option<f64> {
    if !raw.is_finite() || !max_limit.is_finite() || max_limit <= 0.0 {
        return None;
    }
    Some((raw / max_limit).clamp(0.0, 1.0))
}

/// Result of one [`Governor::run_cycle`], for logging and metrics.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Reading { raw: f64, stress: f64 },
    Failed(String),
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failed(_))
    }
}

pub struct Governor {
    source: Box<dyn SignalSource>,
    current_stress: f64,
    last_action: GovernorAction,
    cycles: u64,
}

impl Governor {
    pub fn new<S: SignalSource + 'static>(source: S) -> Self {
        Self::from_boxed(Box::new(source))
    }

    pub fn from_boxed(source: Box<dyn SignalSource>) -> Self {
        Self {
            source,
            current_stress: 0.0,
            last_action: GovernorAction::Idle,
            cycles: 0,
        }
    }

    pub fn domain(&self) -> &'static str {
        self.source.domain()
    }

    pub fn max_limit(&self) -> f64 {
        self.source.max_limit()
    }

    pub fn current_stress(&self) -> f64 {
        self.current_stress
    }

    pub fn last_action(&self) -> GovernorAction {
        self.last_action
    }

    /// Completed `run_cycle` calls since construction.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn reading(&self) -> DomainReading {
        DomainReading {
            stress: self.current_stress,
            action: self.last_action,
        }
    }

    /// Read the sensor under `timeout` and normalize. Never fails: any error
    /// resets stress to 0.0 and the action to `ERROR`.
    pub async fn run_cycle(&mut self, timeout: Duration) -> CycleOutcome {
        let max_limit = self.source.max_limit();
        let read = match tokio::time::timeout(timeout, self.source.read_sensor()).await {
            Ok(read) => read,
            Err(_) => Err(SensorError::Timeout(timeout)),
        };
        let normalized = read.and_then(|raw| {
            normalize_stress(raw, max_limit)
                .map(|stress| (raw, stress))
                .ok_or_else(|| {
                    SensorError::Malformed(format!(
                        "reading {raw} cannot be normalized against ceiling {max_limit}"
                    ))
                })
        });

        self.cycles += 1;
        match normalized {
            Ok((raw, stress)) => {
                self.current_stress = stress;
                self.last_action = GovernorAction::Optimal;
                CycleOutcome::Reading { raw, stress }
            }
            Err(e) => {
                self.current_stress = 0.0;
                self.last_action = GovernorAction::Error;
                CycleOutcome::Failed(e.to_string())
            }
        }
    }

    /// Pick the domain countermeasure. `force_override` always selects the
    /// aggressive label.
    pub fn execute_countermeasure(
        &mut self,
        stress_level: f64,
        force_override: bool,
    ) -> GovernorAction {
        let set = self.source.countermeasures();
        let label = if force_override { set.forced } else { set.standard };
        debug!(
            domain = self.domain(),
            stress_level,
            force_override,
            "[GOVERNOR] countermeasure {}",
            label
        );
        self.last_action = GovernorAction::Countermeasure(label);
        self.last_action
    }
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("domain", &self.domain())
            .field("current_stress", &self.current_stress)
            .field("last_action", &self.last_action)
            .field("cycles", &self.cycles)
            .finish()
    }
}

/// Governors in their fixed evaluation order.
#[derive(Debug, Default)]
pub struct GovernorSet {
    governors: Vec<Governor>,
}

impl GovernorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// bio, market, energy, in that order.
    pub fn standard(client: reqwest::Client, market_url: &str, energy_url: &str) -> Self {
        let mut set = Self::new();
        set.push(Governor::new(BioHealthSource::new()));
        set.push(Governor::new(MarketRiskSource::new(client.clone(), market_url)));
        set.push(Governor::new(EnergyGridSource::new(client, energy_url)));
        set
    }

    pub fn push(&mut self, governor: Governor) {
        self.governors.push(governor);
    }

    pub fn len(&self) -> usize {
        self.governors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.governors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Governor> {
        self.governors.iter()
    }

    pub fn get(&self, domain: &str) -> Option<&Governor> {
        self.governors.iter().find(|g| g.domain() == domain)
    }

    pub fn get_mut(&mut self, domain: &str) -> Option<&mut Governor> {
        self.governors.iter_mut().find(|g| g.domain() == domain)
    }

    /// Stress of `domain`, 0.0 when the domain is not governed.
    pub fn stress_of(&self, domain: &str) -> f64 {
        self.get(domain).map(Governor::current_stress).unwrap_or(0.0)
    }

    /// Cycle every governor sequentially so later stages only ever see a
    /// fully updated set.
    pub async fn run_cycles(&mut self, timeout: Duration) -> Vec<(&'static str, CycleOutcome)> {
        let mut outcomes = Vec::with_capacity(self.governors.len());
        for governor in self.governors.iter_mut() {
            let outcome = governor.run_cycle(timeout).await;
            outcomes.push((governor.domain(), outcome));
        }
        outcomes
    }

    pub fn readings(&self) -> BTreeMap<&'static str, DomainReading> {
        self.governors
            .iter()
            .map(|g| (g.domain(), g.reading()))
            .collect()
    }
}

use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use super::{CountermeasureSet, SensorError, SignalSource};

pub const DEFAULT_MARKET_URL: &str = "https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT";
pub const DEFAULT_ENERGY_URL: &str =
    "https://api.open-meteo.com/v1/forecast?latitude=42.69&longitude=23.32&current=shortwave_radiation";

// Simulated heart rate: resting baseline, jitter band, occasional spike.
const BIO_BASELINE_BPM: f64 = 75.0;
const BIO_JITTER_BPM: f64 = 15.0;
const BIO_SPIKE_BPM: f64 = 90.0;
const BIO_SPIKE_PROBABILITY: f64 = 0.15;

/// Simulated host heart rate (bpm).
pub struct BioHealthSource {
    rng: Mutex<StdRng>,
}

impl BioHealthSource {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic source for replaying a run.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn sample(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let spike = if rng.gen_bool(BIO_SPIKE_PROBABILITY) {
            BIO_SPIKE_BPM
        } else {
            0.0
        };
        BIO_BASELINE_BPM + rng.gen::<f64>() * BIO_JITTER_BPM + spike
    }
}

impl Default for BioHealthSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalSource for BioHealthSource {
    fn domain(&self) -> &'static str {
        "bio"
    }

    fn max_limit(&self) -> f64 {
        180.0
    }

    fn countermeasures(&self) -> CountermeasureSet {
        CountermeasureSet {
            standard: "ADRENALINE BLOCK",
            forced: "OPTIMIZING COMFORT",
        }
    }

    async fn read_sensor(&self) -> Result<f64, SensorError> {
        Ok(self.sample())
    }
}

/// BTC/USDT spot price from a ticker endpoint.
pub struct MarketRiskSource {
    client: reqwest::Client,
    url: String,
}

impl MarketRiskSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

/// `{"symbol":"BTCUSDT","price":"97012.55"}`; numeric prices are accepted too.
pub fn parse_ticker_price(body: &Value) -> Result<f64, SensorError> {
    match body.get("price") {
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| SensorError::Malformed(format!("price {s:?}: {e}"))),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| SensorError::Malformed(format!("price {n} out of range"))),
        Some(other) => Err(SensorError::Malformed(format!("price has type {other}"))),
        None => Err(SensorError::Malformed("missing price field".to_string())),
    }
}

#[async_trait]
impl SignalSource for MarketRiskSource {
    fn domain(&self) -> &'static str {
        "market"
    }

    fn max_limit(&self) -> f64 {
        150_000.0
    }

    fn countermeasures(&self) -> CountermeasureSet {
        CountermeasureSet {
            standard: "HEDGING",
            forced: "EMERGENCY LIQUIDATION",
        }
    }

    async fn read_sensor(&self) -> Result<f64, SensorError> {
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_ticker_price(&body)
    }
}

/// Shortwave solar radiation (W/m²) from a forecast endpoint.
pub struct EnergyGridSource {
    client: reqwest::Client,
    url: String,
}

impl EnergyGridSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

pub fn parse_shortwave_radiation(body: &Value) -> Result<f64, SensorError> {
    body.get("current")
        .and_then(|current| current.get("shortwave_radiation"))
        .and_then(Value::as_f64)
        .ok_or_else(|| SensorError::Malformed("missing current.shortwave_radiation".to_string()))
}

#[async_trait]
impl SignalSource for EnergyGridSource {
    fn domain(&self) -> &'static str {
        "energy"
    }

    fn max_limit(&self) -> f64 {
        1000.0
    }

    fn countermeasures(&self) -> CountermeasureSet {
        CountermeasureSet {
            standard: "DIVERT TO BATTERY",
            forced: "AGGRESSIVE SELL",
        }
    }

    async fn read_sensor(&self) -> Result<f64, SensorError> {
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_shortwave_radiation(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticker_price_accepts_string_and_number() {
        assert_eq!(parse_ticker_price(&json!({"price": "97012.50"})).unwrap(), 97012.5);
        assert_eq!(parse_ticker_price(&json!({"price": 100.0})).unwrap(), 100.0);
        assert!(parse_ticker_price(&json!({"price": "n/a"})).is_err());
        assert!(parse_ticker_price(&json!({"code": -1121})).is_err());
        assert!(parse_ticker_price(&json!({"price": [1]})).is_err());
    }

    #[test]
    fn shortwave_radiation_is_read_from_current_block() {
        let body = json!({"current": {"time": "2026-01-01T12:00", "shortwave_radiation": 412.0}});
        assert_eq!(parse_shortwave_radiation(&body).unwrap(), 412.0);
        assert!(parse_shortwave_radiation(&json!({"current": {}})).is_err());
        assert!(parse_shortwave_radiation(&json!({})).is_err());
    }

    #[test]
    fn simulated_heart_rate_stays_in_band() {
        let source = BioHealthSource::seeded(7);
        for _ in 0..500 {
            let bpm = source.sample();
            assert!(bpm >= BIO_BASELINE_BPM);
            assert!(bpm <= BIO_BASELINE_BPM + BIO_JITTER_BPM + BIO_SPIKE_BPM);
        }
    }

    #[test]
    fn seeded_sources_replay_identically() {
        let a = BioHealthSource::seeded(42);
        let b = BioHealthSource::seeded(42);
        for _ in 0..20 {
            assert_eq!(a.sample(), b.sample());
        }
    }
}

//! Command-line / environment configuration for the three binaries.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use tracing::Level;

use crate::governor::{DEFAULT_ENERGY_URL, DEFAULT_MARKET_URL};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct LogArgs {
    #[arg(long, env = "OMNI_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
    #[arg(long, env = "OMNI_LOG_LEVEL", default_value = "info")]
    pub log_level: Level,
}

/// A named dashboard target probed by the service matrix, given as `NAME=URL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceTarget {
    pub name: String,
    pub url: String,
}

impl FromStr for ServiceTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, url) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=URL, got {s:?}"))?;
        let (name, url) = (name.trim(), url.trim());
        if name.is_empty() || url.is_empty() {
            return Err(format!("expected NAME=URL, got {s:?}"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("service {name:?} needs an http(s) url, got {url:?}"));
        }
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
        })
    }
}

/// `omni-core`: heartbeat plus live-view server.
#[derive(Clone, Debug, Parser)]
#[command(name = "omni-core", about = "Governor heartbeat and live-view broadcast server")]
pub struct ServerConfig {
    #[arg(long, env = "OMNI_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    #[arg(
        long,
        env = "OMNI_TICK_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub tick_interval_ms: u64,
    #[arg(
        long,
        env = "OMNI_SENSOR_TIMEOUT_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub sensor_timeout_ms: u64,
    #[arg(
        long,
        env = "OMNI_SEND_TIMEOUT_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub send_timeout_ms: u64,
    #[arg(long, env = "OMNI_PUBLIC_DIR", default_value = "public")]
    pub public_dir: PathBuf,
    #[arg(long, env = "OMNI_AUDIT_ROOT", default_value = ".")]
    pub audit_root: PathBuf,
    #[arg(long, env = "OMNI_AUDIT_CACHE_SECS", default_value_t = 300)]
    pub audit_cache_secs: u64,
    #[arg(long, env = "OMNI_HEALTH_CACHE_SECS", default_value_t = 60)]
    pub health_cache_secs: u64,
    #[arg(long = "service", env = "OMNI_SERVICES", value_delimiter = ',')]
    pub services: Vec<ServiceTarget>,
    #[arg(long, env = "OMNI_MARKET_URL", default_value = DEFAULT_MARKET_URL)]
    pub market_url: String,
    #[arg(long, env = "OMNI_ENERGY_URL", default_value = DEFAULT_ENERGY_URL)]
    pub energy_url: String,
    #[arg(
        long,
        env = "OMNI_LEDGER_CAPACITY",
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub ledger_capacity: u64,
    #[command(flatten)]
    pub log: LogArgs,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn audit_cache(&self) -> Duration {
        Duration::from_secs(self.audit_cache_secs)
    }

    pub fn health_cache(&self) -> Duration {
        Duration::from_secs(self.health_cache_secs)
    }
}

/// `wealth-bridge`: payment webhook → credit minting relay.
#[derive(Clone, Debug, Parser)]
#[command(name = "wealth-bridge", about = "Payment webhook to credit-minting relay")]
pub struct RelayConfig {
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 5001)]
    pub port: u16,
    #[arg(long, env = "STRIPE_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,
    #[arg(long, env = "RUST_ECONOMY_URL", default_value = "http://localhost:8890")]
    pub economy_url: String,
    #[arg(long, default_value_t = 300)]
    pub signature_tolerance_secs: u64,
    #[command(flatten)]
    pub log: LogArgs,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// `ai-proxy`: chat / analysis proxy to the language-model API.
#[derive(Clone, Debug, Parser)]
#[command(name = "ai-proxy", about = "Chat and analysis proxy to the language-model API")]
pub struct ProxyConfig {
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 8891)]
    pub port: u16,
    #[arg(long, env = "DEEPSEEK_API_KEY", hide_env_values = true)]
    pub api_key: String,
    #[arg(
        long,
        env = "DEEPSEEK_ENDPOINT",
        default_value = "https://api.deepseek.com/v1/chat/completions",
    )]
    pub endpoint: String,
    #[command(flatten)]
    pub log: LogArgs,
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_reference_cadence() {
        let cfg = ServerConfig::try_parse_from(["omni-core"]).unwrap();
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
        assert_eq!(cfg.sensor_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.bind_addr().port(), cfg.port);
        assert_eq!(cfg.log.log_format, LogFormat::Text);
    }

    #[test]
    fn services_parse_from_repeated_flags() {
        let cfg = ServerConfig::try_parse_from([
            "omni-core",
            "--service",
            "Helios=https://helios.example",
            "--service",
            "Logos=http://logos.example/health",
        ])
        .unwrap();
        assert_eq!(cfg.services.len(), 2);
        assert_eq!(cfg.services[0].name, "Helios");
        assert_eq!(cfg.services[1].url, "http://logos.example/health");
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        assert!(ServerConfig::try_parse_from(["omni-core", "--tick-interval-ms", "0"]).is_err());
    }

    #[test]
    fn malformed_service_targets_are_rejected() {
        assert!("no-separator".parse::<ServiceTarget>().is_err());
        assert!("=https://x".parse::<ServiceTarget>().is_err());
        assert!("Name=ftp://x".parse::<ServiceTarget>().is_err());
    }
}

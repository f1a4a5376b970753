//! Service matrix: reachability of the named dashboard targets.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::config::ServiceTarget;
use crate::heartbeat::{MetricsCollector, TickError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Degraded,
    Offline,
}

impl ServiceStatus {
    pub fn from_http_status(status: u16) -> Self {
        if status < 400 {
            ServiceStatus::Online
        } else {
            ServiceStatus::Degraded
        }
    }
}

pub struct ServiceMatrix {
    client: reqwest::Client,
    targets: Vec<ServiceTarget>,
    cache_for: Duration,
    cached: Mutex<Option<(Instant, BTreeMap<String, ServiceStatus>)>>,
}

impl ServiceMatrix {
    pub fn new(client: reqwest::Client, targets: Vec<ServiceTarget>, cache_for: Duration) -> Self {
        Self {
            client,
            targets,
            cache_for,
            cached: Mutex::new(None),
        }
    }

    async fn probe(&self, target: &ServiceTarget) -> ServiceStatus {
        match self
            .client
            .head(&target.url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => ServiceStatus::from_http_status(resp.status().as_u16()),
            Err(_) => ServiceStatus::Offline,
        }
    }

    /// Probe every target concurrently, reusing the last result while fresh.
    pub async fn check_health(&self) -> BTreeMap<String, ServiceStatus> {
        {
            let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((taken_at, results)) = cached.as_ref() {
                if taken_at.elapsed() < self.cache_for && !results.is_empty() {
                    return results.clone();
                }
            }
        }

        let probes = self
            .targets
            .iter()
            .map(|t| async move { (t.name.clone(), self.probe(t).await) });
        let results: BTreeMap<_, _> = join_all(probes).await.into_iter().collect();

        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), results.clone()));
        results
    }
}

#[async_trait]
impl MetricsCollector for ServiceMatrix {
    fn name(&self) -> &'static str {
        "projects"
    }

    async fn collect(&self) -> Result<Value, TickError> {
        Ok(serde_json::to_value(self.check_health().await)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn one_shot_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let resp = format!(
                    "{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    #[test]
    fn status_classification() {
        assert_eq!(ServiceStatus::from_http_status(200), ServiceStatus::Online);
        assert_eq!(ServiceStatus::from_http_status(302), ServiceStatus::Online);
        assert_eq!(ServiceStatus::from_http_status(503), ServiceStatus::Degraded);
        assert_eq!(serde_json::to_string(&ServiceStatus::Offline).unwrap(), "\"offline\"");
    }

    #[tokio::test]
    async fn targets_are_classified_by_status() {
        let up = one_shot_server("HTTP/1.1 200 OK").await;
        let sick = one_shot_server("HTTP/1.1 503 Service Unavailable").await;
        let targets = vec![
            ServiceTarget {
                name: "up".into(),
                url: up,
            },
            ServiceTarget {
                name: "sick".into(),
                url: sick,
            },
            ServiceTarget {
                name: "gone".into(),
                url: "http://127.0.0.1:9/".into(),
            },
        ];
        let matrix = ServiceMatrix::new(reqwest::Client::new(), targets, Duration::from_secs(60));
        let results = matrix.check_health().await;
        assert_eq!(results["up"], ServiceStatus::Online);
        assert_eq!(results["sick"], ServiceStatus::Degraded);
        assert_eq!(results["gone"], ServiceStatus::Offline);
    }

    #[tokio::test]
    async fn no_targets_yields_empty_map() {
        let matrix =
            ServiceMatrix::new(reqwest::Client::new(), Vec::new(), Duration::from_secs(60));
        assert!(matrix.collect().await.unwrap().as_object().unwrap().is_empty());
    }
}

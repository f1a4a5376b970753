use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::governor::GovernorAction;

/// `{stress, action}` for one governed domain.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DomainReading {
    pub stress: f64,
    pub action: GovernorAction,
}

/// One tick's snapshot, serialized once and sent to every subscriber.
///
/// Domains are flattened into the top level, so the wire shape is
/// `{"timestamp", "bio": {..}, "market": {..}, "energy": {..}, "orchestrator", "metrics"}`.
#[derive(Clone, Debug, Serialize)]
pub struct BroadcastPayload {
    pub timestamp: String,
    #[serde(flatten)]
    pub domains: BTreeMap<&'static str, DomainReading>,
    pub orchestrator: String,
    pub metrics: BTreeMap<String, Value>,
}

impl BroadcastPayload {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_flattens_domains() {
        let mut domains = BTreeMap::new();
        domains.insert(
            "bio",
            DomainReading {
                stress: 0.5,
                action: GovernorAction::Optimal,
            },
        );
        domains.insert(
            "market",
            DomainReading {
                stress: 1.0,
                action: GovernorAction::Countermeasure("HEDGING"),
            },
        );
        let mut metrics = BTreeMap::new();
        metrics.insert("project".to_string(), json!({"files": 3, "loc": 40}));

        let payload = BroadcastPayload {
            timestamp: "12:00:01".into(),
            domains,
            orchestrator: "system synced".into(),
            metrics,
        };
        let value: Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "timestamp": "12:00:01",
                "bio": {"stress": 0.5, "action": "OPTIMAL"},
                "market": {"stress": 1.0, "action": "HEDGING"},
                "orchestrator": "system synced",
                "metrics": {"project": {"files": 3, "loc": 40}}
            })
        );
    }
}

//! Cross-domain priority cascade, evaluated once per tick after every
//! governor has cycled.
//!
//! Order is fixed: bio escalation wins over a market shock, which wins over
//! the synced state. At most one countermeasure is forced per tick.

use crate::governor::GovernorSet;

pub const BIO_ESCALATION_THRESHOLD: f64 = 0.6;
pub const MARKET_SHOCK_THRESHOLD: f64 = 0.9;

pub const STATUS_HOST_STRESS: &str = "host-stress escalation: reducing financial risk";
pub const STATUS_MARKET_SHOCK: &str = "market shock: activating energy arbitrage";
pub const STATUS_SYNCED: &str = "system synced";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorVerdict {
    pub status: &'static str,
    /// Domain whose countermeasure was forced, if any.
    pub forced: Option<&'static str>,
}

pub fn evaluate(governors: &mut GovernorSet) -> OrchestratorVerdict {
    if governors.stress_of("bio") > BIO_ESCALATION_THRESHOLD {
        return force(governors, "market", STATUS_HOST_STRESS);
    }
    if governors.stress_of("market") > MARKET_SHOCK_THRESHOLD {
        return force(governors, "energy", STATUS_MARKET_SHOCK);
    }
    OrchestratorVerdict {
        status: STATUS_SYNCED,
        forced: None,
    }
}

fn force(
    governors: &mut GovernorSet,
    domain: &'static str,
    status: &'static str,
) -> OrchestratorVerdict {
    // The status still reflects the escalation when the target domain is not governed.
    let forced = governors.get_mut(domain).map(|target| {
        let stress = target.current_stress();
        target.execute_countermeasure(stress, true);
        domain
    });
    OrchestratorVerdict { status, forced }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{CountermeasureSet, Governor, GovernorAction, SensorError, SignalSource};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Scripted {
        domain: &'static str,
        raw: f64,
        set: CountermeasureSet,
    }

    #[async_trait]
    impl SignalSource for Scripted {
        fn domain(&self) -> &'static str {
            self.domain
        }
        fn max_limit(&self) -> f64 {
            1.0
        }
        fn countermeasures(&self) -> CountermeasureSet {
            self.set
        }
        async fn read_sensor(&self) -> Result<f64, SensorError> {
            Ok(self.raw)
        }
    }

    async fn cycled(bio: f64, market: f64, energy: f64) -> GovernorSet {
        let mut set = GovernorSet::new();
        for (domain, raw, standard, forced) in [
            ("bio", bio, "ADRENALINE BLOCK", "OPTIMIZING COMFORT"),
            ("market", market, "HEDGING", "EMERGENCY LIQUIDATION"),
            ("energy", energy, "DIVERT TO BATTERY", "AGGRESSIVE SELL"),
        ] {
            set.push(Governor::new(Scripted {
                domain,
                raw,
                set: CountermeasureSet { standard, forced },
            }));
        }
        set.run_cycles(Duration::from_millis(50)).await;
        set
    }

    #[tokio::test]
    async fn bio_branch_wins_over_market_shock() {
        let mut set = cycled(0.7, 0.95, 0.2).await;
        let verdict = evaluate(&mut set);
        assert_eq!(verdict.status, STATUS_HOST_STRESS);
        assert_eq!(verdict.forced, Some("market"));
        assert_eq!(
            set.get("market").unwrap().last_action(),
            GovernorAction::Countermeasure("EMERGENCY LIQUIDATION")
        );
        assert_eq!(set.get("energy").unwrap().last_action(), GovernorAction::Optimal);
        assert_eq!(set.get("bio").unwrap().last_action(), GovernorAction::Optimal);
    }

    #[tokio::test]
    async fn market_shock_forces_energy() {
        let mut set = cycled(0.3, 0.95, 0.2).await;
        let verdict = evaluate(&mut set);
        assert_eq!(verdict.status, STATUS_MARKET_SHOCK);
        assert_eq!(verdict.forced, Some("energy"));
        assert_eq!(
            set.get("energy").unwrap().last_action(),
            GovernorAction::Countermeasure("AGGRESSIVE SELL")
        );
        assert_eq!(set.get("market").unwrap().last_action(), GovernorAction::Optimal);
    }

    #[tokio::test]
    async fn thresholds_are_strict() {
        let mut set = cycled(0.6, 0.9, 1.0).await;
        let verdict = evaluate(&mut set);
        assert_eq!(verdict.status, STATUS_SYNCED);
        assert_eq!(verdict.forced, None);
        for g in set.iter() {
            assert_eq!(g.last_action(), GovernorAction::Optimal);
        }
    }

    #[test]
    fn missing_domains_read_as_calm() {
        let mut set = GovernorSet::new();
        let verdict = evaluate(&mut set);
        assert_eq!(verdict.status, STATUS_SYNCED);
    }
}

//! Rule variants
//!
//! Four families of checks behind one `check` entry point:
//!
//! - fixed thresholds on order/position/leverage metrics
//! - volatility-adjusted thresholds (the effective limit moves with
//!   realized volatility, in either direction)
//! - a circuit breaker fed by external failure signals
//! - an anomaly score from a small pre-trained classifier, optional and
//!   degrading to a no-op without a model

use super::types::RiskContext;
use crate::resilience::{BreakerConfig, CircuitBreaker};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Metric a threshold rule compares against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    /// Notional value of the candidate order
    OrderValue,
    /// Volume of the candidate order
    OrderVolume,
    /// Held volume in the order's symbol plus the candidate order
    PositionVolume,
    /// Projected gross exposure / account balance
    Leverage,
}

impl ThresholdMetric {
    fn observe(&self, ctx: &RiskContext) -> f64 {
        match self {
            ThresholdMetric::OrderValue => ctx.order_value(),
            ThresholdMetric::OrderVolume => ctx.volume as f64,
            ThresholdMetric::PositionVolume => (ctx.held_volume() + ctx.volume) as f64,
            ThresholdMetric::Leverage => ctx.projected_leverage(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ThresholdMetric::OrderValue => "order value",
            ThresholdMetric::OrderVolume => "order volume",
            ThresholdMetric::PositionVolume => "position volume",
            ThresholdMetric::Leverage => "leverage",
        }
    }
}

/// Direction the volatility adjustment moves the threshold.
///
/// `Dampen` tightens the limit as volatility rises; `Amplify` loosens it.
/// Both exist because either reading of "volatility-adjusted" is wanted in
/// practice, per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityMode {
    Dampen,
    Amplify,
}

/// Weights of the anomaly classifier: a logistic model over
/// (order/balance ratio, margin ratio, time-of-day, weekday).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub weights: [f64; 4],
    pub bias: f64,
}

impl AnomalyModel {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| warn!(path = %path.display(), %e, "anomaly model unreadable"))
            .ok()?;
        serde_json::from_str(&raw)
            .map_err(|e| warn!(path = %path.display(), %e, "anomaly model unparsable"))
            .ok()
    }

    fn features(ctx: &RiskContext) -> [f64; 4] {
        use chrono::{Datelike, Timelike};
        use rust_decimal::prelude::ToPrimitive;

        let (order_to_balance, margin_ratio) = match &ctx.account {
            Some(account) if account.balance > rust_decimal::Decimal::ZERO => {
                let balance = account.balance.to_f64().unwrap_or(f64::MAX);
                (
                    ctx.order_value() / balance,
                    account.margin.to_f64().unwrap_or(0.0) / balance,
                )
            }
            _ => (1.0, 1.0),
        };
        let local = ctx.timestamp.with_timezone(&chrono::Local);
        let time_of_day = f64::from(local.time().num_seconds_from_midnight()) / 86_400.0;
        let weekday = local.date_naive().weekday().num_days_from_monday() as f64 / 6.0;
        [order_to_balance, margin_ratio, time_of_day, weekday]
    }

    pub fn score(&self, ctx: &RiskContext) -> f64 {
        let x = Self::features(ctx);
        let z: f64 = self
            .weights
            .iter()
            .zip(x.iter())
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.bias;
        1.0 / (1.0 + (-z).exp())
    }
}

/// The rule body. Construction is one variant per family; shared metadata
/// lives in [`super::RuleMeta`].
pub enum RuleKind {
    /// Compare a context metric against a fixed limit.
    FixedThreshold {
        metric: ThresholdMetric,
        threshold: f64,
    },
    /// Threshold scaled by recent realized volatility.
    VolatilityAdjusted {
        metric: ThresholdMetric,
        base_threshold: f64,
        mode: VolatilityMode,
    },
    /// Trips on consecutive failure signals; see
    /// [`super::RiskManager::record_failure_signal`].
    CircuitBreaker { breaker: CircuitBreaker },
    /// Classifier score over order/account features.
    Anomaly {
        threshold: f64,
        model: Option<AnomalyModel>,
    },
}

impl RuleKind {
    pub fn circuit_breaker(config: BreakerConfig) -> Self {
        RuleKind::CircuitBreaker {
            breaker: CircuitBreaker::new(config),
        }
    }

    /// Evaluate against a context. `Some(message)` means triggered.
    pub fn check(&self, ctx: &RiskContext) -> Option<String> {
        match self {
            RuleKind::FixedThreshold { metric, threshold } => {
                let observed = metric.observe(ctx);
                (observed > *threshold).then(|| {
                    format!(
                        "{} {:.2} exceeds limit {:.2}",
                        metric.label(),
                        observed,
                        threshold
                    )
                })
            }

            RuleKind::VolatilityAdjusted {
                metric,
                base_threshold,
                mode,
            } => {
                let effective = match (ctx.volatility, mode) {
                    (Some(vol), VolatilityMode::Dampen) => base_threshold / (1.0 + vol),
                    (Some(vol), VolatilityMode::Amplify) => base_threshold * (1.0 + vol),
                    // No volatility estimate yet: fall back to the base limit
                    (None, _) => *base_threshold,
                };
                let observed = metric.observe(ctx);
                (observed > effective).then(|| {
                    format!(
                        "{} {:.2} exceeds volatility-adjusted limit {:.2} (base {:.2})",
                        metric.label(),
                        observed,
                        effective,
                        base_threshold
                    )
                })
            }

            RuleKind::CircuitBreaker { breaker } => (!breaker.is_call_permitted())
                .then(|| "circuit breaker open after repeated failures".to_string()),

            RuleKind::Anomaly { threshold, model } => match model {
                Some(model) => {
                    let score = model.score(ctx);
                    (score > *threshold)
                        .then(|| format!("anomaly score {:.3} exceeds {:.3}", score, threshold))
                }
                None => {
                    debug!("anomaly rule has no model, passing");
                    None
                }
            },
        }
    }

    /// Short variant name for persistence and metrics labels.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RuleKind::FixedThreshold { .. } => "fixed_threshold",
            RuleKind::VolatilityAdjusted { .. } => "volatility_adjusted",
            RuleKind::CircuitBreaker { .. } => "circuit_breaker",
            RuleKind::Anomaly { .. } => "anomaly",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, Offset};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn ctx(price: rust_decimal::Decimal, volume: u64) -> RiskContext {
        RiskContext {
            symbol: "rb2405".into(),
            direction: Direction::Buy,
            offset: Offset::Open,
            price,
            volume,
            strategy_id: "s1".into(),
            account: None,
            positions: Vec::new(),
            volatility: None,
            timestamp: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_fixed_threshold_order_value() {
        let rule = RuleKind::FixedThreshold {
            metric: ThresholdMetric::OrderValue,
            threshold: 100_000.0,
        };
        // 3500 x 50 = 175,000 > 100,000
        assert!(rule.check(&ctx(dec!(3500), 50)).is_some());
        // 3500 x 10 = 35,000 passes
        assert!(rule.check(&ctx(dec!(3500), 10)).is_none());
    }

    #[test]
    fn test_threshold_boundary_not_triggered() {
        let rule = RuleKind::FixedThreshold {
            metric: ThresholdMetric::OrderValue,
            threshold: 7000.0,
        };
        // Exactly at the limit passes; strictly above triggers
        assert!(rule.check(&ctx(dec!(3500), 2)).is_none());
        assert!(rule.check(&ctx(dec!(3501), 2)).is_some());
    }

    #[test]
    fn test_volatility_dampen_tightens() {
        let rule = RuleKind::VolatilityAdjusted {
            metric: ThresholdMetric::OrderValue,
            base_threshold: 10_000.0,
            mode: VolatilityMode::Dampen,
        };
        let mut calm = ctx(dec!(3500), 2); // 7000
        calm.volatility = Some(0.0);
        assert!(rule.check(&calm).is_none());

        let mut stormy = ctx(dec!(3500), 2);
        stormy.volatility = Some(1.0); // effective limit 5000
        assert!(rule.check(&stormy).is_some());
    }

    #[test]
    fn test_volatility_amplify_loosens() {
        let rule = RuleKind::VolatilityAdjusted {
            metric: ThresholdMetric::OrderValue,
            base_threshold: 6_000.0,
            mode: VolatilityMode::Amplify,
        };
        let mut calm = ctx(dec!(3500), 2); // 7000 > 6000
        calm.volatility = Some(0.0);
        assert!(rule.check(&calm).is_some());

        let mut stormy = ctx(dec!(3500), 2);
        stormy.volatility = Some(0.5); // effective limit 9000
        assert!(rule.check(&stormy).is_none());
    }

    #[test]
    fn test_circuit_breaker_rule_trips_on_signals() {
        let rule = RuleKind::circuit_breaker(BreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        let RuleKind::CircuitBreaker { breaker } = &rule else {
            unreachable!()
        };
        assert!(rule.check(&ctx(dec!(3500), 1)).is_none());
        breaker.record_failure();
        breaker.record_failure();
        assert!(rule.check(&ctx(dec!(3500), 1)).is_some());
    }

    #[test]
    fn test_anomaly_without_model_is_noop() {
        let rule = RuleKind::Anomaly {
            threshold: 0.5,
            model: None,
        };
        assert!(rule.check(&ctx(dec!(3500), 1000)).is_none());
    }

    #[test]
    fn test_anomaly_model_scores() {
        // Heavy weight on order/balance ratio; no account means ratio 1.0
        let model = AnomalyModel {
            weights: [10.0, 0.0, 0.0, 0.0],
            bias: -5.0,
        };
        let rule = RuleKind::Anomaly {
            threshold: 0.5,
            model: Some(model),
        };
        assert!(rule.check(&ctx(dec!(3500), 1)).is_some());
    }
}

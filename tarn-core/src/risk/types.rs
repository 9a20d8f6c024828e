//! Risk rule metadata, evaluation context and decisions
//!
//! Rules are tagged variants sharing one metadata header ([`RuleMeta`]):
//! identity, severity, action, scope and cooldown live in the header, the
//! variant carries only its own parameters. See [`super::rules`] for the
//! variants.

use crate::broker::{AccountInfo, BrokerPosition};
use crate::core::{Direction, Offset};
use crate::session::SessionWindow;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Severity of a triggered rule. `Critical` latches the manager-wide
/// emergency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// What a triggered rule asks the platform to do. Only `Reject` affects
/// the order decision directly; the rest are fanned out as risk events for
/// the wired policy handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskAction {
    Alert,
    Reject,
    Reduce,
    Liquidate,
    Disable,
    Custom,
}

impl fmt::Display for RiskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskAction::Alert => "alert",
            RiskAction::Reject => "reject",
            RiskAction::Reduce => "reduce",
            RiskAction::Liquidate => "liquidate",
            RiskAction::Disable => "disable",
            RiskAction::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// Rule applicability filter; empty collections mean global scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleScope {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub windows: Vec<SessionWindow>,
}

impl RuleScope {
    pub fn matches(&self, ctx: &RiskContext) -> bool {
        if !self.symbols.is_empty() && !self.symbols.contains(&ctx.symbol) {
            return false;
        }
        if !self.accounts.is_empty() {
            match &ctx.account {
                Some(account) if self.accounts.contains(&account.account_id) => {}
                _ => return false,
            }
        }
        if !self.strategies.is_empty() && !self.strategies.contains(&ctx.strategy_id) {
            return false;
        }
        if !self.windows.is_empty() {
            let time = ctx.timestamp.with_timezone(&chrono::Local).time();
            if !self.windows.iter().any(|w| w.contains(time)) {
                return false;
            }
        }
        true
    }
}

/// Shared metadata header carried by every rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMeta {
    pub rule_id: String,
    pub name: String,
    pub enabled: bool,
    pub level: RiskLevel,
    pub action: RiskAction,
    #[serde(default)]
    pub scope: RuleScope,
    /// Suppression window after a trigger, in seconds on the wire
    #[serde(with = "serde_secs")]
    pub cooldown: Duration,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,
}

impl RuleMeta {
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        level: RiskLevel,
        action: RiskAction,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            enabled: true,
            level,
            action,
            scope: RuleScope::default(),
            cooldown: Duration::from_secs(60),
            last_triggered: None,
            trigger_count: 0,
        }
    }

    /// Cooldown check; elapsed-equal-to-cooldown counts as elapsed.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered {
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                let cooldown = chrono::Duration::from_std(self.cooldown)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                elapsed < cooldown
            }
            None => false,
        }
    }

    pub fn record_trigger(&mut self, now: DateTime<Utc>) {
        self.last_triggered = Some(now);
        self.trigger_count += 1;
    }
}

mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Everything a rule may look at when evaluating a candidate order.
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: u64,
    pub strategy_id: String,
    pub account: Option<AccountInfo>,
    pub positions: Vec<BrokerPosition>,
    /// Recent realized volatility of the order's symbol, when available
    pub volatility: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied extras merged into the context
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RiskContext {
    /// Notional value of the candidate order.
    pub fn order_value(&self) -> f64 {
        (self.price * Decimal::from(self.volume))
            .to_f64()
            .unwrap_or(f64::MAX)
    }

    /// Total volume already held in the order's symbol, both sides.
    pub fn held_volume(&self) -> u64 {
        self.positions
            .iter()
            .filter(|p| p.symbol == self.symbol)
            .map(|p| p.volume)
            .sum()
    }

    /// Gross position value across the book plus this order.
    pub fn projected_exposure(&self) -> f64 {
        let held: f64 = self
            .positions
            .iter()
            .map(|p| {
                (p.last_price * Decimal::from(p.volume))
                    .to_f64()
                    .unwrap_or(0.0)
            })
            .sum();
        held + self.order_value()
    }

    /// Projected leverage against the account balance; infinite when the
    /// balance is unknown or zero.
    pub fn projected_leverage(&self) -> f64 {
        match &self.account {
            Some(account) if account.balance > Decimal::ZERO => {
                self.projected_exposure() / account.balance.to_f64().unwrap_or(f64::MAX)
            }
            _ => f64::INFINITY,
        }
    }
}

/// The outcome of a rule firing, reported on the bus and to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct RiskTrigger {
    pub rule_id: String,
    pub rule_name: String,
    pub level: RiskLevel,
    pub action: RiskAction,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Decision returned by `check_order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Accept,
    Reject { rule_id: String, reason: String },
}

impl RiskDecision {
    #[inline]
    pub fn is_accept(&self) -> bool {
        matches!(self, RiskDecision::Accept)
    }
}

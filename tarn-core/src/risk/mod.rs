//! Pre-trade risk engine
//!
//! Every candidate order passes through [`RiskManager::check_order`]
//! before it reaches the broker. Rules are tagged variants sharing one
//! metadata header; a critical trigger latches the manager-wide emergency
//! state, cleared only by explicit [`RiskManager::reset`].

pub mod manager;
pub mod rules;
pub mod types;

pub use manager::{RiskManager, RiskManagerConfig, RiskRule, RuleKindSpec, RuleSpec, TriggerListener};
pub use rules::{AnomalyModel, RuleKind, ThresholdMetric, VolatilityMode};
pub use types::{
    RiskAction, RiskContext, RiskDecision, RiskLevel, RiskTrigger, RuleMeta, RuleScope,
};

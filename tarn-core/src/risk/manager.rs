//! Risk manager
//!
//! Evaluates every candidate order against the configured rules and
//! produces an accept/reject decision with rationale.
//!
//! ## Evaluation
//!
//! ```text
//! check_order(order)
//!      │ emergency latched? ──► reject
//!      ▼
//! gather context (account ∪ positions ∪ volatility ∪ clock)
//!      ▼
//! for each enabled rule in scope, out of cooldown:
//!      kind.check(ctx) ──triggered──► record + emit risk event
//!                                       │ action == reject ──► reject
//!                                       │ level == critical ──► emergency latch
//!                                       ▼
//!                                     continue
//! ```
//!
//! Serial evaluation short-circuits on the first rejecting trigger;
//! parallel evaluation runs every rule and takes the first rejection in
//! registration order. Rules and their counters persist as a JSON document
//! at most once per save interval.

use super::rules::{AnomalyModel, RuleKind, ThresholdMetric, VolatilityMode};
use super::types::{RiskAction, RiskContext, RiskDecision, RiskLevel, RiskTrigger, RuleMeta};
use crate::broker::BrokerAdapter;
use crate::event::{EventBus, EventType};
use crate::order::Order;
use crate::resilience::BreakerConfig;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Listener receiving every rule trigger.
pub type TriggerListener = Arc<dyn Fn(&RiskTrigger) + Send + Sync>;

/// Serializable rule definition: the metadata header plus the variant's
/// parameters. This is both the config format and the persistence format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(flatten)]
    pub meta: RuleMeta,
    pub kind: RuleKindSpec,
}

/// Variant parameters, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKindSpec {
    FixedThreshold {
        metric: ThresholdMetric,
        threshold: f64,
    },
    VolatilityAdjusted {
        metric: ThresholdMetric,
        base_threshold: f64,
        mode: VolatilityMode,
    },
    CircuitBreaker {
        failure_threshold: u64,
        recovery_secs: u64,
    },
    Anomaly {
        threshold: f64,
        model_path: Option<PathBuf>,
    },
}

impl RuleKindSpec {
    /// Variant name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            RuleKindSpec::FixedThreshold { .. } => "fixed_threshold",
            RuleKindSpec::VolatilityAdjusted { .. } => "volatility_adjusted",
            RuleKindSpec::CircuitBreaker { .. } => "circuit_breaker",
            RuleKindSpec::Anomaly { .. } => "anomaly",
        }
    }

    fn build(&self) -> RuleKind {
        match self {
            RuleKindSpec::FixedThreshold { metric, threshold } => RuleKind::FixedThreshold {
                metric: *metric,
                threshold: *threshold,
            },
            RuleKindSpec::VolatilityAdjusted {
                metric,
                base_threshold,
                mode,
            } => RuleKind::VolatilityAdjusted {
                metric: *metric,
                base_threshold: *base_threshold,
                mode: *mode,
            },
            RuleKindSpec::CircuitBreaker {
                failure_threshold,
                recovery_secs,
            } => RuleKind::circuit_breaker(BreakerConfig {
                failure_threshold: *failure_threshold,
                recovery_timeout: Duration::from_secs(*recovery_secs),
                ..Default::default()
            }),
            RuleKindSpec::Anomaly {
                threshold,
                model_path,
            } => RuleKind::Anomaly {
                threshold: *threshold,
                model: model_path.as_deref().and_then(AnomalyModel::load),
            },
        }
    }
}

/// A registered rule: shared metadata under its own lock, the built check
/// body, and the spec it was built from (for persistence).
pub struct RiskRule {
    meta: Mutex<RuleMeta>,
    kind: RuleKind,
    kind_spec: RuleKindSpec,
}

impl RiskRule {
    fn from_spec(spec: RuleSpec) -> Self {
        Self {
            kind: spec.kind.build(),
            kind_spec: spec.kind,
            meta: Mutex::new(spec.meta),
        }
    }

    fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            meta: self.meta.lock().clone(),
            kind: self.kind_spec.clone(),
        }
    }
}

/// Risk manager configuration.
#[derive(Debug, Clone)]
pub struct RiskManagerConfig {
    /// Evaluate rules on worker threads instead of serially
    pub parallel: bool,
    /// Floor between persistence writes
    pub save_interval: Duration,
    /// Where rules and counters persist; None disables persistence
    pub persist_path: Option<PathBuf>,
    /// Closes used for the realized-volatility estimate
    pub vol_lookback: usize,
    /// Volatility cache refresh interval
    pub vol_refresh: Duration,
}

impl Default for RiskManagerConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            save_interval: Duration::from_secs(3600),
            persist_path: None,
            vol_lookback: 20,
            vol_refresh: Duration::from_secs(3600),
        }
    }
}

/// The manager. Cloning shares state.
#[derive(Clone)]
pub struct RiskManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: RiskManagerConfig,
    broker: RwLock<Option<Arc<dyn BrokerAdapter>>>,
    bus: EventBus,
    rules: RwLock<Vec<Arc<RiskRule>>>,
    emergency: std::sync::atomic::AtomicBool,
    emergency_reason: Mutex<Option<String>>,
    vol_cache: Mutex<HashMap<String, (f64, Instant)>>,
    last_save: Mutex<Option<Instant>>,
    listeners: RwLock<Vec<TriggerListener>>,
    /// Rejections by rule id
    rejections: Mutex<HashMap<String, u64>>,
}

impl RiskManager {
    pub fn new(config: RiskManagerConfig, bus: EventBus) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                broker: RwLock::new(None),
                bus,
                rules: RwLock::new(Vec::new()),
                emergency: std::sync::atomic::AtomicBool::new(false),
                emergency_reason: Mutex::new(None),
                vol_cache: Mutex::new(HashMap::new()),
                last_save: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
                rejections: Mutex::new(HashMap::new()),
            }),
        };

        if let Some(path) = manager.inner.config.persist_path.clone() {
            if path.exists() {
                if let Err(err) = manager.load_rules(&path) {
                    warn!(path = %path.display(), %err, "failed to load persisted rules");
                }
            }
        }
        manager
    }

    /// Attach the broker used for context gathering (account, positions,
    /// klines for volatility).
    pub fn set_broker(&self, broker: Arc<dyn BrokerAdapter>) {
        *self.inner.broker.write() = Some(broker);
    }

    // ------------------------------------------------------------------
    // Rule management
    // ------------------------------------------------------------------

    /// Register a rule. Refuses duplicate rule ids.
    pub fn add_rule(&self, spec: RuleSpec) -> bool {
        let mut rules = self.inner.rules.write();
        if rules
            .iter()
            .any(|r| r.meta.lock().rule_id == spec.meta.rule_id)
        {
            warn!(rule_id = %spec.meta.rule_id, "duplicate rule id, not added");
            return false;
        }
        info!(rule_id = %spec.meta.rule_id, kind = spec.kind.name(), "risk rule added");
        rules.push(Arc::new(RiskRule::from_spec(spec)));
        true
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.inner.rules.write();
        let before = rules.len();
        rules.retain(|r| r.meta.lock().rule_id != rule_id);
        rules.len() != before
    }

    pub fn enable_rule(&self, rule_id: &str, enabled: bool) -> bool {
        let rules = self.inner.rules.read();
        for rule in rules.iter() {
            let mut meta = rule.meta.lock();
            if meta.rule_id == rule_id {
                meta.enabled = enabled;
                return true;
            }
        }
        false
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<RuleSpec> {
        self.inner
            .rules
            .read()
            .iter()
            .find(|r| r.meta.lock().rule_id == rule_id)
            .map(|r| r.to_spec())
    }

    pub fn get_all_rules(&self) -> Vec<RuleSpec> {
        self.inner.rules.read().iter().map(|r| r.to_spec()).collect()
    }

    /// Clear the emergency latch and every rule's trigger state.
    pub fn reset(&self) {
        self.inner
            .emergency
            .store(false, std::sync::atomic::Ordering::Release);
        *self.inner.emergency_reason.lock() = None;
        for rule in self.inner.rules.read().iter() {
            let mut meta = rule.meta.lock();
            meta.last_triggered = None;
            meta.trigger_count = 0;
        }
        info!("risk manager reset; emergency cleared");
    }

    pub fn is_emergency(&self) -> bool {
        self.inner
            .emergency
            .load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: TriggerListener) {
        self.inner.listeners.write().push(listener);
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate a candidate order. Rules with action `reject` short-circuit
    /// to a rejection; other triggered actions are recorded and evaluation
    /// continues.
    pub fn check_order(
        &self,
        order: &Order,
        extra: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> RiskDecision {
        if self.is_emergency() {
            let reason = self
                .inner
                .emergency_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "emergency state active".to_string());
            self.count_rejection("emergency");
            return RiskDecision::Reject {
                rule_id: "emergency".into(),
                reason,
            };
        }

        let ctx = self.gather_context(order, extra);
        let rules: Vec<Arc<RiskRule>> = self.inner.rules.read().clone();

        if self.inner.config.parallel {
            // Every rule runs; the first rejecting trigger in registration
            // order wins (any rejection suffices, ties are meaningless)
            let triggers: Vec<Option<RiskTrigger>> = std::thread::scope(|scope| {
                let handles: Vec<_> = rules
                    .iter()
                    .map(|rule| scope.spawn(|| self.eval_rule(rule, &ctx)))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap_or(None)).collect()
            });
            for trigger in triggers.into_iter().flatten() {
                if trigger.action == RiskAction::Reject {
                    self.count_rejection(&trigger.rule_id);
                    return RiskDecision::Reject {
                        rule_id: trigger.rule_id,
                        reason: trigger.message,
                    };
                }
            }
        } else {
            for rule in &rules {
                if let Some(trigger) = self.eval_rule(rule, &ctx) {
                    if trigger.action == RiskAction::Reject {
                        self.count_rejection(&trigger.rule_id);
                        return RiskDecision::Reject {
                            rule_id: trigger.rule_id,
                            reason: trigger.message,
                        };
                    }
                }
            }
        }

        self.maybe_save();
        RiskDecision::Accept
    }

    /// Feed a failure signal into every circuit-breaker rule.
    pub fn record_failure_signal(&self) {
        for rule in self.inner.rules.read().iter() {
            if let RuleKind::CircuitBreaker { breaker } = &rule.kind {
                breaker.record_failure();
            }
        }
    }

    /// Feed a success signal into every circuit-breaker rule.
    pub fn record_success_signal(&self) {
        for rule in self.inner.rules.read().iter() {
            if let RuleKind::CircuitBreaker { breaker } = &rule.kind {
                breaker.record_success();
            }
        }
    }

    // ------------------------------------------------------------------
    // Reporting and persistence
    // ------------------------------------------------------------------

    /// Rejections recorded per rule id.
    pub fn rejection_counts(&self) -> HashMap<String, u64> {
        self.inner.rejections.lock().clone()
    }

    /// JSON risk report: emergency state, per-rule trigger totals and an
    /// aggregate risk-level value.
    pub fn generate_report(&self) -> serde_json::Value {
        let rules = self.inner.rules.read();
        let mut rule_entries = Vec::new();
        let mut weighted = 0.0f64;
        let mut total_weight = 0.0f64;

        for rule in rules.iter() {
            let meta = rule.meta.lock();
            let weight = match meta.level {
                RiskLevel::Low => 1.0,
                RiskLevel::Medium => 2.0,
                RiskLevel::High => 4.0,
                RiskLevel::Critical => 8.0,
            };
            total_weight += weight;
            if meta.trigger_count > 0 {
                weighted += weight;
            }
            rule_entries.push(serde_json::json!({
                "rule_id": meta.rule_id,
                "name": meta.name,
                "enabled": meta.enabled,
                "level": meta.level,
                "action": meta.action,
                "trigger_count": meta.trigger_count,
                "last_triggered": meta.last_triggered,
            }));
        }

        serde_json::json!({
            "emergency": self.is_emergency(),
            "emergency_reason": self.inner.emergency_reason.lock().clone(),
            "rule_count": rule_entries.len(),
            "risk_level_value": if total_weight > 0.0 { weighted / total_weight } else { 0.0 },
            "rules": rule_entries,
            "rejections": self.rejection_counts(),
            "generated_at": Utc::now(),
        })
    }

    /// Persist now, regardless of the save interval.
    pub fn save_now(&self) -> std::io::Result<()> {
        let Some(path) = &self.inner.config.persist_path else {
            return Ok(());
        };
        let specs = self.get_all_rules();
        let doc = serde_json::json!({ "rules": specs, "saved_at": Utc::now() });
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
        *self.inner.last_save.lock() = Some(Instant::now());
        debug!(path = %path.display(), "risk rules persisted");
        Ok(())
    }

    fn maybe_save(&self) {
        let due = {
            let last_save = self.inner.last_save.lock();
            match *last_save {
                Some(at) => at.elapsed() >= self.inner.config.save_interval,
                None => self.inner.config.persist_path.is_some(),
            }
        };
        if due {
            if let Err(err) = self.save_now() {
                warn!(%err, "periodic risk persistence failed");
            }
        }
    }

    fn load_rules(&self, path: &std::path::Path) -> anyhow::Result<()> {
        #[derive(Deserialize)]
        struct Doc {
            rules: Vec<RuleSpec>,
        }
        let raw = std::fs::read_to_string(path)?;
        let doc: Doc = serde_json::from_str(&raw)?;
        let mut rules = self.inner.rules.write();
        rules.clear();
        for spec in doc.rules {
            rules.push(Arc::new(RiskRule::from_spec(spec)));
        }
        info!(count = rules.len(), path = %path.display(), "risk rules loaded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn gather_context(
        &self,
        order: &Order,
        extra: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> RiskContext {
        let broker = self.inner.broker.read().clone();
        let (account, positions) = match &broker {
            Some(broker) => (
                broker.get_account_info().ok(),
                broker.get_positions().unwrap_or_default(),
            ),
            None => (None, Vec::new()),
        };

        RiskContext {
            symbol: order.symbol.clone(),
            direction: order.direction,
            offset: order.offset,
            price: order.price,
            volume: order.volume,
            strategy_id: order.strategy_id.clone(),
            account,
            positions,
            volatility: self.volatility_for(&order.symbol),
            timestamp: Utc::now(),
            extra: extra.unwrap_or_default(),
        }
    }

    /// Realized volatility of recent closes, cached per symbol.
    fn volatility_for(&self, symbol: &str) -> Option<f64> {
        {
            let cache = self.inner.vol_cache.lock();
            if let Some((vol, at)) = cache.get(symbol) {
                if at.elapsed() < self.inner.config.vol_refresh {
                    return Some(*vol);
                }
            }
        }

        let broker = self.inner.broker.read().clone()?;
        let klines = broker
            .get_klines(
                symbol,
                Duration::from_secs(60),
                self.inner.config.vol_lookback + 1,
                None,
                None,
            )
            .ok()?;
        if klines.len() < 2 {
            return None;
        }

        use rust_decimal::prelude::ToPrimitive;
        let closes: Vec<f64> = klines
            .iter()
            .filter_map(|k| k.close.to_f64())
            .collect();
        let returns: Vec<f64> = closes
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.is_empty() {
            return None;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let vol = variance.sqrt();

        self.inner
            .vol_cache
            .lock()
            .insert(symbol.to_string(), (vol, Instant::now()));
        Some(vol)
    }

    fn eval_rule(&self, rule: &Arc<RiskRule>, ctx: &RiskContext) -> Option<RiskTrigger> {
        {
            let meta = rule.meta.lock();
            if !meta.enabled || !meta.scope.matches(ctx) || meta.in_cooldown(ctx.timestamp) {
                return None;
            }
        }

        let message = rule.kind.check(ctx)?;

        let trigger = {
            let mut meta = rule.meta.lock();
            meta.record_trigger(ctx.timestamp);
            RiskTrigger {
                rule_id: meta.rule_id.clone(),
                rule_name: meta.name.clone(),
                level: meta.level,
                action: meta.action,
                message,
                timestamp: ctx.timestamp,
            }
        };

        warn!(
            rule_id = %trigger.rule_id,
            level = ?trigger.level,
            action = %trigger.action,
            message = %trigger.message,
            "risk rule triggered"
        );
        self.emit_trigger(&trigger, ctx);

        if trigger.level == RiskLevel::Critical {
            self.enter_emergency(&format!(
                "critical rule {} triggered: {}",
                trigger.rule_id, trigger.message
            ));
        }

        Some(trigger)
    }

    fn enter_emergency(&self, reason: &str) {
        if self
            .inner
            .emergency
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        error!(reason, "risk manager entering EMERGENCY state");
        *self.inner.emergency_reason.lock() = Some(reason.to_string());

        let event = self
            .inner
            .bus
            .acquire_event(EventType::Emergency, "risk_manager")
            .with_field("reason", reason)
            .with_priority(0);
        self.inner.bus.publish(event);
    }

    fn emit_trigger(&self, trigger: &RiskTrigger, ctx: &RiskContext) {
        for listener in self.inner.listeners.read().iter() {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(trigger)));
            if outcome.is_err() {
                error!("risk trigger listener panicked");
            }
        }

        let context_subset = serde_json::json!({
            "symbol": ctx.symbol,
            "price": ctx.price.to_string(),
            "volume": ctx.volume,
            "strategy_id": ctx.strategy_id,
        });
        let event = self
            .inner
            .bus
            .acquire_event(
                EventType::Custom("risk.rule_triggered".into()),
                "risk_manager",
            )
            .with_field("event", "risk_rule_triggered")
            .with_field("rule_id", trigger.rule_id.clone())
            .with_field("rule_name", trigger.rule_name.clone())
            .with_field(
                "level",
                serde_json::to_value(trigger.level).unwrap_or_default(),
            )
            .with_field("action", trigger.action.to_string())
            .with_field("context_subset", context_subset)
            .with_priority(2);
        self.inner.bus.publish(event);
    }

    fn count_rejection(&self, rule_id: &str) {
        *self
            .inner
            .rejections
            .lock()
            .entry(rule_id.to_string())
            .or_insert(0) += 1;
    }
}

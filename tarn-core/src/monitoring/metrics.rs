//! Prometheus metrics for the control plane
//!
//! Metric families:
//! - event bus: queue depths per shard, publish/drop counts, handler
//!   latency, breaker state, pool size
//! - trading: order submissions, fills, cancels, rejections
//! - risk: rule trigger and rejection counters, emergency gauge
//! - strategies: callback error counts per strategy
//!
//! Counters are bumped at the call sites; gauges are refreshed by
//! [`MetricsRegistry::refresh`], which the binary drives on an interval.

use crate::event::{EventBus, EventBusStats};
use crate::order::OrderManager;
use crate::risk::RiskManager;
use crate::strategy::StrategyExecutor;
use prometheus::{Histogram, HistogramOpts, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tracing::info;

/// Central registry for all Prometheus metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    bus: Arc<BusMetrics>,
    trading: Arc<TradingMetrics>,
    risk: Arc<RiskMetrics>,
    strategies: Arc<StrategyMetricsFamily>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(BusMetrics::new(&registry)?);
        let trading = Arc::new(TradingMetrics::new(&registry)?);
        let risk = Arc::new(RiskMetrics::new(&registry)?);
        let strategies = Arc::new(StrategyMetricsFamily::new(&registry)?);
        info!("prometheus metrics registry initialized");
        Ok(Self {
            registry,
            bus,
            trading,
            risk,
            strategies,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn bus(&self) -> &BusMetrics {
        &self.bus
    }

    pub fn trading(&self) -> &TradingMetrics {
        &self.trading
    }

    pub fn risk(&self) -> &RiskMetrics {
        &self.risk
    }

    pub fn strategies(&self) -> &StrategyMetricsFamily {
        &self.strategies
    }

    /// Refresh every gauge family from live component state.
    pub fn refresh(
        &self,
        bus: &EventBus,
        orders: &OrderManager,
        risk: &RiskManager,
        executor: &StrategyExecutor,
    ) {
        self.bus.refresh(&bus.stats());
        self.trading.refresh(orders);
        self.risk.refresh(risk);
        self.strategies.refresh(executor);
    }
}

/// Event-bus metrics.
pub struct BusMetrics {
    pub queue_depth: IntGaugeVec,
    pub published_total: IntGauge,
    pub dropped_total: IntGaugeVec,
    pub dispatched_total: IntGauge,
    pub handler_errors_total: IntGauge,
    pub throughput: IntGauge,
    pub batch_size: IntGauge,
    /// 0 = closed, 1 = open, 2 = half-open
    pub breaker_state: IntGauge,
    pub pooled_events: IntGauge,
    pub handler_latency: Histogram,
}

impl BusMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let queue_depth = IntGaugeVec::new(
            Opts::new("bus_queue_depth", "Events queued per shard").namespace("tarn"),
            &["shard", "queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let published_total = IntGauge::with_opts(
            Opts::new("bus_published_total", "Events admitted to the bus").namespace("tarn"),
        )?;
        registry.register(Box::new(published_total.clone()))?;

        let dropped_total = IntGaugeVec::new(
            Opts::new("bus_dropped_total", "Events dropped, by reason").namespace("tarn"),
            &["reason"],
        )?;
        registry.register(Box::new(dropped_total.clone()))?;

        let dispatched_total = IntGauge::with_opts(
            Opts::new("bus_dispatched_total", "Handler invocations completed").namespace("tarn"),
        )?;
        registry.register(Box::new(dispatched_total.clone()))?;

        let handler_errors_total = IntGauge::with_opts(
            Opts::new("bus_handler_errors_total", "Handler failures and panics").namespace("tarn"),
        )?;
        registry.register(Box::new(handler_errors_total.clone()))?;

        let throughput = IntGauge::with_opts(
            Opts::new("bus_throughput", "Events per second, last sample").namespace("tarn"),
        )?;
        registry.register(Box::new(throughput.clone()))?;

        let batch_size = IntGauge::with_opts(
            Opts::new("bus_batch_size", "Current adaptive batch size").namespace("tarn"),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let breaker_state = IntGauge::with_opts(
            Opts::new(
                "bus_breaker_state",
                "Bus circuit breaker state (0 closed, 1 open, 2 half-open)",
            )
            .namespace("tarn"),
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let pooled_events = IntGauge::with_opts(
            Opts::new("bus_pooled_events", "Events resting in the object pool").namespace("tarn"),
        )?;
        registry.register(Box::new(pooled_events.clone()))?;

        let handler_latency = Histogram::with_opts(
            HistogramOpts::new("bus_handler_latency_seconds", "Handler execution time")
                .namespace("tarn")
                .buckets(vec![
                    0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.002_5, 0.005, 0.01, 0.05,
                ]),
        )?;
        registry.register(Box::new(handler_latency.clone()))?;

        Ok(Self {
            queue_depth,
            published_total,
            dropped_total,
            dispatched_total,
            handler_errors_total,
            throughput,
            batch_size,
            breaker_state,
            pooled_events,
            handler_latency,
        })
    }

    fn refresh(&self, stats: &EventBusStats) {
        for (shard, (urgent, normal)) in stats.shard_depths.iter().enumerate() {
            let shard_label = shard.to_string();
            self.queue_depth
                .with_label_values(&[&shard_label, "urgent"])
                .set(*urgent as i64);
            self.queue_depth
                .with_label_values(&[&shard_label, "normal"])
                .set(*normal as i64);
        }
        self.published_total.set(stats.published as i64);
        self.dropped_total
            .with_label_values(&["queue-full"])
            .set(stats.dropped_queue_full as i64);
        self.dropped_total
            .with_label_values(&["breaker-open"])
            .set(stats.dropped_breaker_open as i64);
        self.dropped_total
            .with_label_values(&["validation-failed"])
            .set(stats.dropped_validation as i64);
        self.dropped_total
            .with_label_values(&["filtered"])
            .set(stats.dropped_filtered as i64);
        self.dropped_total
            .with_label_values(&["not-running"])
            .set(stats.dropped_not_running as i64);
        self.dispatched_total.set(stats.dispatched as i64);
        self.handler_errors_total.set(stats.handler_errors as i64);
        self.throughput.set(stats.throughput as i64);
        self.batch_size.set(stats.batch_size as i64);
        self.breaker_state.set(match stats.breaker_state {
            "open" => 1,
            "half-open" => 2,
            _ => 0,
        });
        self.pooled_events.set(stats.pooled_events as i64);
    }
}

/// Order flow metrics.
pub struct TradingMetrics {
    pub orders_created: IntGauge,
    pub orders_filled: IntGauge,
    pub orders_cancelled: IntGauge,
    pub orders_rejected: IntGauge,
    pub orders_failed: IntGauge,
    pub orders_active: IntGauge,
    pub submission_retries: IntGauge,
}

impl TradingMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace("tarn"))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        Ok(Self {
            orders_created: gauge("orders_created_total", "Orders created")?,
            orders_filled: gauge("orders_filled_total", "Orders fully filled")?,
            orders_cancelled: gauge("orders_cancelled_total", "Orders cancelled")?,
            orders_rejected: gauge("orders_rejected_total", "Orders rejected")?,
            orders_failed: gauge("orders_failed_total", "Orders failed")?,
            orders_active: gauge("orders_active", "Orders currently active")?,
            submission_retries: gauge("order_submission_retries_total", "Submission retries")?,
        })
    }

    fn refresh(&self, orders: &OrderManager) {
        let stats = orders.stats();
        self.orders_created.set(stats.created as i64);
        self.orders_filled.set(stats.filled as i64);
        self.orders_cancelled.set(stats.cancelled as i64);
        self.orders_rejected.set(stats.rejected as i64);
        self.orders_failed.set(stats.failed as i64);
        self.orders_active.set(stats.active as i64);
        self.submission_retries.set(stats.retries as i64);
    }
}

/// Risk-engine metrics.
pub struct RiskMetrics {
    pub rule_triggers: IntGaugeVec,
    pub rejections: IntGaugeVec,
    pub emergency: IntGauge,
}

impl RiskMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let rule_triggers = IntGaugeVec::new(
            Opts::new("risk_rule_triggers_total", "Rule triggers, by rule").namespace("tarn"),
            &["rule_id"],
        )?;
        registry.register(Box::new(rule_triggers.clone()))?;

        let rejections = IntGaugeVec::new(
            Opts::new("risk_rejections_total", "Order rejections, by rule").namespace("tarn"),
            &["rule_id"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let emergency = IntGauge::with_opts(
            Opts::new("risk_emergency", "1 while the emergency latch is set").namespace("tarn"),
        )?;
        registry.register(Box::new(emergency.clone()))?;

        Ok(Self {
            rule_triggers,
            rejections,
            emergency,
        })
    }

    fn refresh(&self, risk: &RiskManager) {
        for spec in risk.get_all_rules() {
            self.rule_triggers
                .with_label_values(&[&spec.meta.rule_id])
                .set(spec.meta.trigger_count as i64);
        }
        for (rule_id, count) in risk.rejection_counts() {
            self.rejections
                .with_label_values(&[&rule_id])
                .set(count as i64);
        }
        self.emergency.set(i64::from(risk.is_emergency()));
    }
}

/// Per-strategy metrics.
pub struct StrategyMetricsFamily {
    pub errors: IntGaugeVec,
    pub callbacks: IntGaugeVec,
    pub running: IntGaugeVec,
}

impl StrategyMetricsFamily {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let errors = IntGaugeVec::new(
            Opts::new("strategy_errors_total", "Callback errors, by strategy").namespace("tarn"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let callbacks = IntGaugeVec::new(
            Opts::new("strategy_callbacks_total", "Callbacks delivered, by strategy")
                .namespace("tarn"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(callbacks.clone()))?;

        let running = IntGaugeVec::new(
            Opts::new("strategy_running", "1 while the strategy runs").namespace("tarn"),
            &["strategy_id"],
        )?;
        registry.register(Box::new(running.clone()))?;

        Ok(Self {
            errors,
            callbacks,
            running,
        })
    }

    fn refresh(&self, executor: &StrategyExecutor) {
        for status in executor.get_all_strategies() {
            self.errors
                .with_label_values(&[&status.id])
                .set(status.metrics.errors as i64);
            self.callbacks
                .with_label_values(&[&status.id])
                .set(status.metrics.callbacks as i64);
            self.running
                .with_label_values(&[&status.id])
                .set(i64::from(status.running));
        }
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBusConfig;

    #[test]
    fn test_registry_builds_and_refreshes_bus() {
        let metrics = MetricsRegistry::new().unwrap();
        let bus = EventBus::new(EventBusConfig {
            shard_count: 2,
            ..Default::default()
        });
        metrics.bus().refresh(&bus.stats());

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "tarn_bus_queue_depth"));
    }

    #[test]
    fn test_double_registration_fails() {
        // Prometheus refuses duplicate family names per registry
        let registry = Registry::new();
        assert!(BusMetrics::new(&registry).is_ok());
        assert!(BusMetrics::new(&registry).is_err());
    }
}

//! Loaded strategy instances
//!
//! An instance pairs the boxed strategy with its per-instance mutex (the
//! serialization point for all callbacks), config-derived attributes and
//! run metrics.

use super::Strategy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Per-instance counters.
#[derive(Default)]
pub struct StrategyMetrics {
    pub runs: AtomicU64,
    pub callbacks: AtomicU64,
    pub errors: AtomicU64,
    pub total_run_nanos: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

/// Snapshot of the counters for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StrategyMetricsSnapshot {
    pub runs: u64,
    pub callbacks: u64,
    pub errors: u64,
    pub avg_run_micros: u64,
    pub last_error: Option<String>,
}

/// One loaded strategy.
pub struct StrategyInstance {
    pub id: String,
    /// Registry class name
    pub class: String,
    pub version: u32,
    pub hot_reload: bool,
    pub auto_start: bool,
    /// Lower stops first under resource pressure
    pub priority: i32,
    /// Loaded by the config scanner (true) or by a direct API call (false);
    /// only scanner-managed instances are unloaded when their file vanishes
    pub managed: bool,
    pub params: RwLock<serde_json::Value>,
    pub symbols: RwLock<HashSet<String>>,
    /// The serialization point: one callback per strategy at a time
    pub strategy: Mutex<Box<dyn Strategy>>,
    pub running: AtomicBool,
    pub initialized: AtomicBool,
    pub last_run: Mutex<Option<Instant>>,
    pub metrics: StrategyMetrics,
}

impl StrategyInstance {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether this instance wants events for a symbol. Events without a
    /// symbol (account changes) are delivered to every running strategy.
    pub fn subscribes_to(&self, symbol: Option<&str>) -> bool {
        match symbol {
            Some(symbol) => self.symbols.read().contains(symbol),
            None => true,
        }
    }

    /// Error rate over delivered callbacks; 0 until enough samples exist.
    pub fn error_rate(&self, min_samples: u64) -> f64 {
        let callbacks = self.metrics.callbacks.load(Ordering::Relaxed);
        if callbacks < min_samples {
            return 0.0;
        }
        self.metrics.errors.load(Ordering::Relaxed) as f64 / callbacks as f64
    }

    pub fn metrics_snapshot(&self) -> StrategyMetricsSnapshot {
        let runs = self.metrics.runs.load(Ordering::Relaxed);
        let total_nanos = self.metrics.total_run_nanos.load(Ordering::Relaxed);
        StrategyMetricsSnapshot {
            runs,
            callbacks: self.metrics.callbacks.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            avg_run_micros: if runs > 0 {
                total_nanos / runs / 1_000
            } else {
                0
            },
            last_error: self.metrics.last_error.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;

    struct Noop;
    impl Strategy for Noop {}

    fn instance() -> StrategyInstance {
        StrategyInstance {
            id: "s1".into(),
            class: "noop".into(),
            version: 1,
            hot_reload: false,
            auto_start: false,
            priority: 0,
            managed: false,
            params: RwLock::new(serde_json::json!({})),
            symbols: RwLock::new(["rb2405".to_string()].into_iter().collect()),
            strategy: Mutex::new(Box::new(Noop)),
            running: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            last_run: Mutex::new(None),
            metrics: StrategyMetrics::default(),
        }
    }

    #[test]
    fn test_subscription_filter() {
        let inst = instance();
        assert!(inst.subscribes_to(Some("rb2405")));
        assert!(!inst.subscribes_to(Some("cu2406")));
        // Symbol-less events reach everyone
        assert!(inst.subscribes_to(None));
    }

    #[test]
    fn test_error_rate_needs_samples() {
        let inst = instance();
        inst.metrics.callbacks.store(5, Ordering::Relaxed);
        inst.metrics.errors.store(5, Ordering::Relaxed);
        assert_eq!(inst.error_rate(10), 0.0);
        inst.metrics.callbacks.store(10, Ordering::Relaxed);
        assert_eq!(inst.error_rate(10), 0.5);
    }

    #[test]
    fn test_metrics_snapshot_average() {
        let inst = instance();
        inst.metrics.runs.store(4, Ordering::Relaxed);
        inst.metrics.total_run_nanos.store(8_000_000, Ordering::Relaxed);
        assert_eq!(inst.metrics_snapshot().avg_run_micros, 2_000);
    }
}

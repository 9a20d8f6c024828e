//! Configuration document structure
//!
//! One JSON document configures the whole control plane; strategies get
//! one file each under `strategies/`. Defaults are embedded so a minimal
//! config only needs the `account` section.

use crate::risk::RuleSpec;
use crate::session::{SessionWindow, TradingCalendar};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub account: AccountSection,
    #[serde(default)]
    pub trading: TradingSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub event_bus: EventBusSection,
    #[serde(default)]
    pub orders: OrdersSection,
    #[serde(default)]
    pub positions: PositionsSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

/// Broker account credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSection {
    pub account_id: String,
    /// Adapter name, e.g. "sim"
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default)]
    pub auth_id: Option<String>,
    #[serde(default)]
    pub auth_code: Option<String>,
}

fn default_broker() -> String {
    "sim".to_string()
}

/// Trading sessions and calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSection {
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub sessions: Vec<SessionWindow>,
    #[serde(default)]
    pub calendar: TradingCalendar,
    /// Refuse to trade outside session windows
    #[serde(default = "default_true")]
    pub enforce_trading_time: bool,
    /// Run the pre-trade risk engine
    #[serde(default = "default_true")]
    pub risk_checks_enabled: bool,
}

impl Default for TradingSection {
    fn default() -> Self {
        Self {
            market: String::new(),
            sessions: Vec::new(),
            calendar: TradingCalendar::default(),
            enforce_trading_time: true,
            risk_checks_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Risk-engine settings and rule definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskSection {
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

fn default_save_interval() -> u64 {
    3600
}

/// Event-bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusSection {
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_target_rate")]
    pub target_rate: f64,
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
}

impl Default for EventBusSection {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            queue_capacity: default_queue_capacity(),
            target_rate: default_target_rate(),
            io_workers: default_io_workers(),
        }
    }
}

fn default_shard_count() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_target_rate() -> f64 {
    10_000.0
}
fn default_io_workers() -> usize {
    32
}

/// Order-manager timing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersSection {
    #[serde(default = "default_track_interval")]
    pub track_interval_secs: u64,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for OrdersSection {
    fn default() -> Self {
        Self {
            track_interval_secs: default_track_interval(),
            submit_timeout_secs: default_submit_timeout(),
            max_retries: default_max_retries(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

fn default_track_interval() -> u64 {
    2
}
fn default_submit_timeout() -> u64 {
    60
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_interval() -> u64 {
    1
}

/// Position-manager timing and portfolio limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsSection {
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default)]
    pub limits: crate::position::RiskLimits,
}

impl Default for PositionsSection {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            limits: crate::position::RiskLimits::default(),
        }
    }
}

fn default_update_interval() -> u64 {
    5
}

/// Strategy-executor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_timer_interval")]
    pub timer_interval_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_strategies_dir")]
    pub strategies_dir: PathBuf,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            timer_interval_secs: default_timer_interval(),
            scan_interval_secs: default_scan_interval(),
            strategies_dir: default_strategies_dir(),
        }
    }
}

fn default_timer_interval() -> u64 {
    1
}
fn default_scan_interval() -> u64 {
    60
}
fn default_strategies_dir() -> PathBuf {
    PathBuf::from("strategies")
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

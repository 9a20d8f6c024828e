//! Configuration loading and validation
//!
//! The whole control plane is configured by one JSON document (see
//! [`AppConfig`]); strategies get one file each in the `strategies/`
//! directory. A missing required field is fatal at startup: the binary
//! reports it and exits with code 1.

pub mod types;

pub use types::{
    AccountSection, AppConfig, EventBusSection, ExecutorSection, MonitoringSection, OrdersSection,
    PositionsSection, RiskSection, TradingSection,
};

use crate::core::ConfigError;
use chrono::NaiveTime;
use std::path::Path;
use tracing::info;

impl AppConfig {
    /// Load and validate a configuration document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Field-level validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.account_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                section: "account",
                field: "account_id",
            });
        }
        if self.trading.enforce_trading_time && self.trading.sessions.is_empty() {
            return Err(ConfigError::MissingField {
                section: "trading",
                field: "sessions",
            });
        }
        if self.event_bus.shard_count == 0 {
            return Err(ConfigError::InvalidValue {
                section: "event_bus",
                field: "shard_count",
                reason: "must be at least 1".into(),
            });
        }
        if self.event_bus.target_rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                section: "event_bus",
                field: "target_rate",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// A complete default configuration, used by `--generate-config`.
    pub fn generate_default() -> Self {
        AppConfig {
            account: AccountSection {
                account_id: "demo-account".into(),
                broker: "sim".into(),
                auth_id: None,
                auth_code: None,
            },
            trading: TradingSection {
                market: "SHFE".into(),
                sessions: vec![
                    session(9, 0, 11, 30),
                    session(13, 30, 15, 0),
                    session(21, 0, 23, 0),
                ],
                ..Default::default()
            },
            risk: RiskSection {
                rules: vec![crate::risk::RuleSpec {
                    meta: crate::risk::RuleMeta::new(
                        "max_order_value",
                        "maximum order value",
                        crate::risk::RiskLevel::High,
                        crate::risk::RiskAction::Reject,
                    ),
                    kind: crate::risk::RuleKindSpec::FixedThreshold {
                        metric: crate::risk::ThresholdMetric::OrderValue,
                        threshold: 1_000_000.0,
                    },
                }],
                ..Default::default()
            },
            event_bus: EventBusSection::default(),
            orders: OrdersSection::default(),
            positions: PositionsSection::default(),
            executor: ExecutorSection::default(),
            monitoring: MonitoringSection::default(),
        }
    }

    /// Write a default config document (and a sample strategy file) under
    /// the given path.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let config = Self::generate_default();
        std::fs::write(path, serde_json::to_string_pretty(&config)?)?;

        let strategies_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&config.executor.strategies_dir);
        std::fs::create_dir_all(&strategies_dir)?;
        let sample = crate::strategy::StrategyFileConfig {
            strategy_id: "demo_dual_ma".into(),
            class: "dual_ma".into(),
            params: serde_json::json!({"fast": 5, "slow": 20, "volume": 1}),
            symbols: vec!["rb2405".into()],
            auto_start: false,
            version: 1,
            hot_reload: true,
            priority: 0,
        };
        std::fs::write(
            strategies_dir.join("demo_dual_ma.json"),
            serde_json::to_string_pretty(&sample)?,
        )?;
        Ok(())
    }
}

fn session(sh: u32, sm: u32, eh: u32, em: u32) -> crate::session::SessionWindow {
    crate::session::SessionWindow::new(
        NaiveTime::from_hms_opt(sh, sm, 0).unwrap(),
        NaiveTime::from_hms_opt(eh, em, 0).unwrap(),
    )
}

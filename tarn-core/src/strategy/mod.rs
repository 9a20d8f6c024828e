//! Strategy execution
//!
//! [`StrategyExecutor`] owns strategy lifecycle (load → initialize → start
//! → run/callbacks → stop → unload), fans bus events out to subscribed
//! strategies, drives the periodic timer, hot-reloads changed configs and
//! polices runaway strategies.
//!
//! Strategies are plain Rust types implementing [`Strategy`], created
//! through the [`StrategyRegistry`] by class name; configs reference the
//! name, so there is no runtime loading of code.

pub mod executor;
pub mod instance;
pub mod monitor;
pub mod registry;

use crate::account::AccountManager;
use crate::broker::{AccountInfo, BrokerAdapter, MarketQuote};
use crate::event::EventBus;
use crate::order::{Order, OrderManager, OrderRequest, Trade};
use crate::position::{Position, PositionManager};
use rust_decimal::Decimal;
use std::sync::Arc;

pub use executor::{ExecutorConfig, StrategyExecutor, StrategyFileConfig, StrategyStatus};
pub use instance::{StrategyInstance, StrategyMetricsSnapshot};
pub use monitor::{ResourcePolicy, ResourceUsage};
pub use registry::{StrategyCtor, StrategyRegistry};

/// A bar passed to `on_bar`, parsed from bus events.
#[derive(Debug, Clone)]
pub struct Bar {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

/// Handles a strategy callback may use. Built per invocation; the
/// `strategy_id` is stamped on every order the strategy creates.
#[derive(Clone)]
pub struct StrategyContext {
    pub strategy_id: String,
    pub params: serde_json::Value,
    pub orders: OrderManager,
    pub positions: PositionManager,
    pub account: AccountManager,
    pub broker: Arc<dyn BrokerAdapter>,
    pub bus: EventBus,
}

impl StrategyContext {
    /// Submit a limit order attributed to this strategy.
    pub fn submit_limit(
        &self,
        symbol: &str,
        direction: crate::core::Direction,
        offset: crate::core::Offset,
        price: Decimal,
        volume: u64,
    ) -> Result<Order, crate::core::OrderError> {
        self.orders.create_order(OrderRequest::limit(
            symbol,
            direction,
            offset,
            price,
            volume,
            self.strategy_id.clone(),
        ))
    }

    /// Typed parameter accessor with a default.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// The strategy callback contract.
///
/// Every method runs on the executor's scheduling fabric under the
/// strategy's own mutex: one callback per strategy at a time, different
/// strategies concurrently. All callbacks default to no-ops so strategies
/// implement only what they use.
pub trait Strategy: Send {
    /// One-time setup after load; called before `start`.
    fn initialize(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Transition to running.
    fn start(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Transition to stopped; in-flight state should be released here.
    fn stop(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// A tick for one of the strategy's subscribed symbols.
    fn on_tick(&mut self, _ctx: &StrategyContext, _quote: &MarketQuote) -> anyhow::Result<()> {
        Ok(())
    }

    /// A bar for one of the strategy's subscribed symbols.
    fn on_bar(&mut self, _ctx: &StrategyContext, _bar: &Bar) -> anyhow::Result<()> {
        Ok(())
    }

    /// An update for one of this strategy's orders.
    fn on_order_update(&mut self, _ctx: &StrategyContext, _order: &Order) -> anyhow::Result<()> {
        Ok(())
    }

    /// A fill for one of this strategy's orders.
    fn on_trade(&mut self, _ctx: &StrategyContext, _trade: &Trade) -> anyhow::Result<()> {
        Ok(())
    }

    /// A change in a position for a subscribed symbol.
    fn on_position_change(
        &mut self,
        _ctx: &StrategyContext,
        _position: &Position,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A refreshed account snapshot.
    fn on_account_change(
        &mut self,
        _ctx: &StrategyContext,
        _account: &AccountInfo,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired on the main timer before `run`.
    fn on_timer(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The strategy's periodic body, after `on_timer` each interval.
    fn run(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Parameters were updated at runtime.
    fn on_params_update(
        &mut self,
        _ctx: &StrategyContext,
        _params: &serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

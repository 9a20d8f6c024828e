//! Broker adapter contract
//!
//! The control plane talks to every broker through this trait. Adapters own
//! the single connection; callers get snapshots through blocking calls with
//! adapter-internal timeouts surfacing as [`BrokerError::Timeout`].
//!
//! Connection lifecycle:
//!
//! ```text
//! disconnected → connecting → connected ─┬→ reconnecting → connected
//!                                        └→ error → (reconnect loop)
//! ```
//!
//! Reconnection policy lives outside the adapter in [`reconnect::Reconnector`]
//! so every adapter gets the same backoff behavior. [`sim::SimBroker`] is a
//! fully scriptable in-process adapter used by tests and paper trading.

pub mod reconnect;
pub mod sim;

use crate::core::{BrokerError, Direction, Offset, OrderStatus, OrderType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use reconnect::{Reconnector, ReconnectPolicy};
pub use sim::SimBroker;

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Account snapshot as reported by the broker. The broker is authoritative;
/// the account manager only caches this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub balance: Decimal,
    pub available: Decimal,
    pub margin: Decimal,
    pub frozen_margin: Decimal,
    pub commission: Decimal,
    pub float_pnl: Decimal,
    /// margin / balance, 0 when balance is 0
    pub risk_ratio: f64,
    pub updated_at: DateTime<Utc>,
}

impl AccountInfo {
    pub fn empty(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            balance: Decimal::ZERO,
            available: Decimal::ZERO,
            margin: Decimal::ZERO,
            frozen_margin: Decimal::ZERO,
            commission: Decimal::ZERO,
            float_pnl: Decimal::ZERO,
            risk_ratio: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// A position as reported by the broker, used for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: crate::core::PositionSide,
    pub volume: u64,
    pub avg_cost: Decimal,
    pub last_price: Decimal,
}

/// An order as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Broker-assigned id
    pub order_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub order_type: OrderType,
    pub price: Decimal,
    pub volume: u64,
    /// Cumulative filled volume; never decreases
    pub filled_volume: u64,
    pub status: OrderStatus,
    pub avg_fill_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub last_price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: f64,
    pub turnover: f64,
    pub timestamp: DateTime<Utc>,
}

/// One candle from `get_klines`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

/// Parameters for `place_order`.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: u64,
    /// None for market orders
    pub price: Option<Decimal>,
    pub order_type: OrderType,
}

/// Connection-state listener: (old state, new state).
pub type ConnectionListener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
/// Order-status listener, fed from broker pushes.
pub type OrderStatusListener = Arc<dyn Fn(&OrderSnapshot) + Send + Sync>;

/// The adapter contract. Implementations own the connection and serialize
/// writes internally; all methods are safe to call from any worker thread.
pub trait BrokerAdapter: Send + Sync {
    /// Adapter name for logs and metrics.
    fn name(&self) -> &str;

    fn connect(&self) -> Result<(), BrokerError>;
    fn disconnect(&self);
    fn connection_state(&self) -> ConnectionState;

    /// Block until the connection reaches `state` or the timeout elapses.
    fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool;

    fn subscribe_market_data(&self, symbols: &[String]) -> Result<(), BrokerError>;
    fn unsubscribe_market_data(&self, symbols: &[String]) -> Result<(), BrokerError>;

    fn get_account_info(&self) -> Result<AccountInfo, BrokerError>;
    fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    fn get_orders(&self, status: Option<OrderStatus>) -> Result<Vec<OrderSnapshot>, BrokerError>;
    fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError>;
    fn get_market_data(&self, symbol: &str) -> Result<MarketQuote, BrokerError>;
    fn get_klines(
        &self,
        symbol: &str,
        interval: Duration,
        count: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Kline>, BrokerError>;

    /// Submit an order; returns the broker-assigned order id.
    fn place_order(&self, order: &PlaceOrder) -> Result<String, BrokerError>;
    fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    fn add_connection_listener(&self, listener: ConnectionListener);
    fn add_order_listener(&self, listener: OrderStatusListener);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Error.is_connected());
    }

    #[test]
    fn test_account_info_empty() {
        let info = AccountInfo::empty("ACC1");
        assert_eq!(info.account_id, "ACC1");
        assert_eq!(info.balance, Decimal::ZERO);
    }
}

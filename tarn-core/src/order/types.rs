//! Order and trade records
//!
//! The order manager is the single owner of [`Order`] records; everything
//! that leaves the manager is a clone. [`Trade`] records are derived from
//! cumulative fill deltas and never mutated afterwards.

use crate::core::{ClientOrderId, Direction, Offset, OrderStatus, OrderType, TraceId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A working or completed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// System-generated, unique for the process lifetime
    pub client_order_id: ClientOrderId,
    /// Broker-assigned id, present once submission is acknowledged
    pub order_id: Option<String>,
    pub strategy_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub order_type: OrderType,
    pub price: Decimal,
    pub volume: u64,
    /// Cumulative executed volume; `0 <= filled_volume <= volume`
    pub filled_volume: u64,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Shared by every event this order produces, so they stay ordered
    pub trace_id: TraceId,
}

impl Order {
    #[inline]
    pub fn remaining_volume(&self) -> u64 {
        self.volume.saturating_sub(self.filled_volume)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Notional value at the order's limit price.
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.volume)
    }
}

/// Parameters for `create_order`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: u64,
    pub order_type: OrderType,
    pub strategy_id: String,
    /// Caller-supplied client id; generated when absent
    pub client_id: Option<ClientOrderId>,
}

impl OrderRequest {
    pub fn limit(
        symbol: impl Into<String>,
        direction: Direction,
        offset: Offset,
        price: Decimal,
        volume: u64,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            offset,
            price,
            volume,
            order_type: OrderType::Limit,
            strategy_id: strategy_id.into(),
            client_id: None,
        }
    }
}

/// An execution against a working order. Volume is the delta executed by
/// this fill, not the order's cumulative total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub client_order_id: ClientOrderId,
    pub order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: Decimal,
    pub volume: u64,
    pub commission: Decimal,
    pub executed_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

/// Filter for order queries; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub strategy_id: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.strategy_id
            .as_ref()
            .map_or(true, |s| &order.strategy_id == s)
            && self.symbol.as_ref().map_or(true, |s| &order.symbol == s)
            && self.status.map_or(true, |s| order.status == s)
    }
}

/// Running totals kept by the order manager.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderManagerStats {
    pub created: u64,
    pub submitted: u64,
    pub filled: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub failed: u64,
    pub retries: u64,
    pub active: usize,
}

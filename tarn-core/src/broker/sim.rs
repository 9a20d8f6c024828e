//! In-process scriptable broker
//!
//! Implements the full adapter contract against in-memory state. Used by
//! the integration tests to script fills, rejections, disconnects and
//! reconciliation scenarios, and by the paper-trading mode of the binary.
//!
//! Scripting surface (not part of the adapter contract):
//! - `set_quote` / `set_account` / `set_positions` seed market and account
//!   state
//! - `report_fill` / `report_status` push order updates as a live broker
//!   would
//! - `simulate_disconnect` drops the connection and notifies listeners
//! - `inject_connect_failures` / `inject_place_failures` force errors
//! - `set_immediate_fill` switches between resting and instantly-filled
//!   orders

use super::{
    AccountInfo, BrokerAdapter, BrokerPosition, ConnectionListener, ConnectionState, Kline,
    MarketQuote, OrderSnapshot, OrderStatusListener, PlaceOrder,
};
use crate::core::{BrokerError, OrderStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Default)]
struct Listeners {
    connection: Vec<ConnectionListener>,
    order: Vec<OrderStatusListener>,
}

/// The scriptable broker.
pub struct SimBroker {
    state: RwLock<ConnectionState>,
    listeners: RwLock<Listeners>,
    account: Mutex<AccountInfo>,
    positions: Mutex<Vec<BrokerPosition>>,
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    quotes: Mutex<HashMap<String, MarketQuote>>,
    subscriptions: Mutex<HashSet<String>>,
    next_order_seq: AtomicU64,
    pending_connect_failures: AtomicUsize,
    pending_place_failures: AtomicUsize,
    pending_place_rejection: Mutex<Option<String>>,
    /// When true, placed limit orders fill fully at their price at once
    immediate_fill: std::sync::atomic::AtomicBool,
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            listeners: RwLock::new(Listeners::default()),
            account: Mutex::new(AccountInfo::empty("sim-account")),
            positions: Mutex::new(Vec::new()),
            orders: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            next_order_seq: AtomicU64::new(1),
            pending_connect_failures: AtomicUsize::new(0),
            pending_place_failures: AtomicUsize::new(0),
            pending_place_rejection: Mutex::new(None),
            immediate_fill: std::sync::atomic::AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Scripting surface
    // ------------------------------------------------------------------

    /// Seed the latest quote for a symbol.
    pub fn set_quote(&self, symbol: &str, last_price: Decimal) {
        let tick = Decimal::ONE;
        self.quotes.lock().insert(
            symbol.to_string(),
            MarketQuote {
                symbol: symbol.to_string(),
                last_price,
                bid: last_price - tick,
                ask: last_price + tick,
                volume: 0.0,
                turnover: 0.0,
                timestamp: Utc::now(),
            },
        );
    }

    pub fn set_account(&self, account: AccountInfo) {
        *self.account.lock() = account;
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock() = positions;
    }

    /// Orders placed after this call rest (`false`) or fill instantly (`true`).
    pub fn set_immediate_fill(&self, enabled: bool) {
        self.immediate_fill.store(enabled, Ordering::Release);
    }

    /// Fail the next `count` connect attempts.
    pub fn inject_connect_failures(&self, count: usize) {
        self.pending_connect_failures.store(count, Ordering::Release);
    }

    /// Fail the next `count` place_order calls with a transient error.
    pub fn inject_place_failures(&self, count: usize) {
        self.pending_place_failures.store(count, Ordering::Release);
    }

    /// Reject the next place_order call permanently with this reason.
    pub fn inject_place_rejection(&self, reason: &str) {
        *self.pending_place_rejection.lock() = Some(reason.to_string());
    }

    /// Drop the connection as if the counterparty vanished.
    pub fn simulate_disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    /// Push a cumulative fill report for an order, notifying listeners.
    ///
    /// `add_volume` is the newly executed volume; the broker-side cumulative
    /// `filled_volume` increases by it and the status moves to
    /// `PartialFilled` or `Filled`. The broker's own position ledger moves
    /// with the fill, as a real counterparty's would.
    pub fn report_fill(&self, order_id: &str, add_volume: u64, price: Decimal) {
        let (snapshot, newly) = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else {
                return;
            };
            let prior_filled = order.filled_volume;
            order.filled_volume = (prior_filled + add_volume).min(order.volume);
            let newly = order.filled_volume - prior_filled;
            if newly > 0 {
                // Volume-weighted average fill price
                let total = Decimal::from(prior_filled) * order.avg_fill_price
                    + Decimal::from(newly) * price;
                order.avg_fill_price = total / Decimal::from(order.filled_volume);
            }
            order.status = if order.filled_volume >= order.volume {
                OrderStatus::Filled
            } else {
                OrderStatus::PartialFilled
            };
            order.updated_at = Utc::now();
            (order.clone(), newly)
        };
        if newly > 0 {
            self.ledger_fill(&snapshot, newly, price);
        }
        self.notify_order(&snapshot);
    }

    /// Fold one fill into the broker-side position ledger.
    fn ledger_fill(&self, order: &OrderSnapshot, volume: u64, price: Decimal) {
        let side = crate::core::PositionSide::for_fill(order.direction, order.offset);
        let mut positions = self.positions.lock();
        let entry = positions
            .iter_mut()
            .find(|p| p.symbol == order.symbol && p.side == side);

        if order.offset.is_open() {
            match entry {
                Some(position) => {
                    let old = Decimal::from(position.volume);
                    let add = Decimal::from(volume);
                    position.avg_cost = (position.avg_cost * old + price * add) / (old + add);
                    position.volume += volume;
                    position.last_price = price;
                }
                None => positions.push(BrokerPosition {
                    symbol: order.symbol.clone(),
                    side,
                    volume,
                    avg_cost: price,
                    last_price: price,
                }),
            }
        } else if let Some(position) = entry {
            position.volume = position.volume.saturating_sub(volume);
            position.last_price = price;
            if position.volume == 0 {
                positions.retain(|p| !(p.symbol == order.symbol && p.side == side));
            }
        }
    }

    /// Force an order's broker-side status, notifying listeners.
    pub fn report_status(&self, order_id: &str, status: OrderStatus) {
        let snapshot = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else {
                return;
            };
            order.status = status;
            order.updated_at = Utc::now();
            order.clone()
        };
        self.notify_order(&snapshot);
    }

    /// Symbols currently subscribed, for assertions.
    pub fn subscribed_symbols(&self) -> HashSet<String> {
        self.subscriptions.lock().clone()
    }

    /// Number of orders the broker has seen.
    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }
        debug!(%old_state, %new_state, "sim broker connection state");
        let listeners = self.listeners.read().connection.clone();
        for listener in listeners {
            listener(old_state, new_state);
        }
    }

    /// Pushes only flow while connected; state still updates when down, so
    /// reconnection reconciles against the broker's resolved view.
    fn notify_order(&self, snapshot: &OrderSnapshot) {
        if !self.connection_state().is_connected() {
            return;
        }
        let listeners = self.listeners.read().order.clone();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connection_state().is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerAdapter for SimBroker {
    fn name(&self) -> &str {
        "sim"
    }

    fn connect(&self) -> Result<(), BrokerError> {
        let remaining = self.pending_connect_failures.load(Ordering::Acquire);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.pending_connect_failures
                    .store(remaining - 1, Ordering::Release);
            }
            self.set_state(ConnectionState::Error);
            return Err(BrokerError::Transport("injected connect failure".into()));
        }

        self.set_state(ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        info!("sim broker connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.connection_state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.connection_state() == state
    }

    fn subscribe_market_data(&self, symbols: &[String]) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let mut subs = self.subscriptions.lock();
        for symbol in symbols {
            subs.insert(symbol.clone());
        }
        Ok(())
    }

    fn unsubscribe_market_data(&self, symbols: &[String]) -> Result<(), BrokerError> {
        let mut subs = self.subscriptions.lock();
        for symbol in symbols {
            subs.remove(symbol);
        }
        Ok(())
    }

    fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        self.ensure_connected()?;
        Ok(self.account.lock().clone())
    }

    fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.positions.lock().clone())
    }

    fn get_orders(&self, status: Option<OrderStatus>) -> Result<Vec<OrderSnapshot>, BrokerError> {
        self.ensure_connected()?;
        let orders = self.orders.lock();
        Ok(orders
            .values()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect())
    }

    fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        self.ensure_connected()?;
        self.orders
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownOrder(order_id.to_string()))
    }

    fn get_market_data(&self, symbol: &str) -> Result<MarketQuote, BrokerError> {
        self.ensure_connected()?;
        self.quotes
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidSymbol(symbol.to_string()))
    }

    fn get_klines(
        &self,
        symbol: &str,
        interval: Duration,
        count: usize,
        _start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Kline>, BrokerError> {
        self.ensure_connected()?;
        let quote = self
            .quotes
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidSymbol(symbol.to_string()))?;

        // Synthetic flat candles anchored on the latest quote
        let end = end.unwrap_or_else(Utc::now);
        let step = ChronoDuration::from_std(interval)
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let price = quote.last_price;
        Ok((0..count)
            .rev()
            .map(|i| Kline {
                timestamp: end - step * (i as i32),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            })
            .collect())
    }

    fn place_order(&self, order: &PlaceOrder) -> Result<String, BrokerError> {
        self.ensure_connected()?;

        let remaining = self.pending_place_failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.pending_place_failures
                .store(remaining - 1, Ordering::Release);
            return Err(BrokerError::Transport("injected place failure".into()));
        }
        if let Some(reason) = self.pending_place_rejection.lock().take() {
            return Err(BrokerError::Rejected { reason });
        }

        if order.volume == 0 {
            return Err(BrokerError::Rejected {
                reason: "zero volume".into(),
            });
        }

        let price = match order.price {
            Some(price) => price,
            None => {
                // Market order executes against the seeded quote
                self.quotes
                    .lock()
                    .get(&order.symbol)
                    .map(|q| q.last_price)
                    .ok_or_else(|| BrokerError::InvalidSymbol(order.symbol.clone()))?
            }
        };

        let order_id = format!("SIM-{}", self.next_order_seq.fetch_add(1, Ordering::Relaxed));
        let snapshot = OrderSnapshot {
            order_id: order_id.clone(),
            symbol: order.symbol.clone(),
            direction: order.direction,
            offset: order.offset,
            order_type: order.order_type,
            price,
            volume: order.volume,
            filled_volume: 0,
            status: OrderStatus::Submitted,
            avg_fill_price: Decimal::ZERO,
            updated_at: Utc::now(),
        };
        self.orders.lock().insert(order_id.clone(), snapshot);

        if self.immediate_fill.load(Ordering::Acquire) {
            self.report_fill(&order_id, order.volume, price);
        }

        Ok(order_id)
    }

    fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let snapshot = {
            let mut orders = self.orders.lock();
            let order = orders
                .get_mut(order_id)
                .ok_or_else(|| BrokerError::UnknownOrder(order_id.to_string()))?;
            if order.status.is_terminal() {
                return Err(BrokerError::Rejected {
                    reason: format!("order already {}", order.status),
                });
            }
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
            order.clone()
        };
        self.notify_order(&snapshot);
        Ok(())
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.listeners.write().connection.push(listener);
    }

    fn add_order_listener(&self, listener: OrderStatusListener) {
        self.listeners.write().order.push(listener);
    }
}

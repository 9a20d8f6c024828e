//! Order manager
//!
//! Mediates every order operation: admission (kill switch, restriction
//! mode, risk, account margin), submission with bounded retries, status
//! tracking against the broker, fill detection from cumulative volume
//! deltas, and reconciliation after reconnects.
//!
//! State transitions are linearized per order: every mutation happens under
//! the order's map entry, and the updated record is cloned out before any
//! listener or event fires.

use super::types::{Order, OrderFilter, OrderManagerStats, OrderRequest, Trade};
use crate::account::AccountManager;
use crate::broker::{BrokerAdapter, ConnectionState, OrderSnapshot, PlaceOrder};
use crate::core::{BrokerError, ClientOrderId, OrderError, OrderStatus, TraceId};
use crate::event::{EventBus, EventType};
use crate::resilience::{Backoff, BackoffConfig, KillSwitch};
use crate::risk::{RiskDecision, RiskManager};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Listener receiving a copy of each order after a state change.
pub type OrderListener = Arc<dyn Fn(&Order) + Send + Sync>;
/// Listener receiving each derived trade.
pub type TradeListener = Arc<dyn Fn(&Trade) + Send + Sync>;

/// Order manager configuration.
#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    /// Interval of the broker polling loop
    pub track_interval: Duration,
    /// Submitting orders older than this are marked failed
    pub submit_timeout: Duration,
    /// Transient submission errors retried up to this many times
    pub max_retries: usize,
    /// Fixed pause between submission retries
    pub retry_interval: Duration,
    /// Commission charged per lot, carried on derived trades
    pub commission_per_lot: Decimal,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            track_interval: Duration::from_secs(2),
            submit_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            commission_per_lot: Decimal::ZERO,
        }
    }
}

struct Counters {
    created: AtomicU64,
    submitted: AtomicU64,
    filled: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// The manager. Cloning shares state.
#[derive(Clone)]
pub struct OrderManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrderManagerConfig,
    broker: Arc<dyn BrokerAdapter>,
    bus: EventBus,
    kill_switch: KillSwitch,
    risk: RwLock<Option<Arc<RiskManager>>>,
    account: RwLock<Option<AccountManager>>,

    orders: DashMap<ClientOrderId, Order>,
    by_broker_id: DashMap<String, ClientOrderId>,
    by_symbol: DashMap<String, HashSet<ClientOrderId>>,
    by_strategy: DashMap<String, HashSet<ClientOrderId>>,
    active: Mutex<HashSet<ClientOrderId>>,

    order_listeners: RwLock<Vec<OrderListener>>,
    trade_listeners: RwLock<Vec<TradeListener>>,

    trading_enabled: AtomicBool,
    open_restricted: AtomicBool,
    /// Set on disconnect so the next connect triggers a full resync
    needs_resync: AtomicBool,

    counters: Counters,
    running: AtomicBool,
    tracker: Mutex<Option<JoinHandle<()>>>,
}

impl OrderManager {
    pub fn new(
        config: OrderManagerConfig,
        broker: Arc<dyn BrokerAdapter>,
        bus: EventBus,
        kill_switch: KillSwitch,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                broker,
                bus,
                kill_switch,
                risk: RwLock::new(None),
                account: RwLock::new(None),
                orders: DashMap::new(),
                by_broker_id: DashMap::new(),
                by_symbol: DashMap::new(),
                by_strategy: DashMap::new(),
                active: Mutex::new(HashSet::new()),
                order_listeners: RwLock::new(Vec::new()),
                trade_listeners: RwLock::new(Vec::new()),
                trading_enabled: AtomicBool::new(true),
                open_restricted: AtomicBool::new(false),
                needs_resync: AtomicBool::new(false),
                counters: Counters {
                    created: AtomicU64::new(0),
                    submitted: AtomicU64::new(0),
                    filled: AtomicU64::new(0),
                    cancelled: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                    retries: AtomicU64::new(0),
                },
                running: AtomicBool::new(false),
                tracker: Mutex::new(None),
            }),
        };

        // Broker pushes flow through the same reconciliation path as polls
        {
            let inner = Arc::downgrade(&manager.inner);
            manager
                .inner
                .broker
                .add_order_listener(Arc::new(move |snapshot| {
                    if let Some(inner) = inner.upgrade() {
                        Inner::apply_broker_snapshot(&inner, snapshot);
                    }
                }));
        }
        {
            let inner = Arc::downgrade(&manager.inner);
            manager
                .inner
                .broker
                .add_connection_listener(Arc::new(move |old, new| {
                    if let Some(inner) = inner.upgrade() {
                        Inner::on_connection_change(&inner, old, new);
                    }
                }));
        }

        manager
    }

    /// Attach the risk manager consulted before every submission.
    pub fn set_risk_manager(&self, risk: Arc<RiskManager>) {
        *self.inner.risk.write() = Some(risk);
    }

    /// Attach the account manager consulted for opening margin.
    pub fn set_account_manager(&self, account: AccountManager) {
        *self.inner.account.write() = Some(account);
    }

    /// Start the tracking loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("tarn-order-track".into())
            .spawn(move || {
                while crate::utils::interruptible_sleep(&inner.running, inner.config.track_interval)
                {
                    Inner::track_active_orders(&inner);
                    Inner::check_timeouts(&inner);
                }
            })
            .expect("failed to spawn order tracking loop");
        *self.inner.tracker.lock() = Some(handle);
        info!("order manager started");
    }

    /// Stop the tracking loop. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.tracker.lock().take() {
            let _ = handle.join();
        }
        info!("order manager stopped");
    }

    // ------------------------------------------------------------------
    // Order operations
    // ------------------------------------------------------------------

    /// Create and submit an order. On success the returned copy carries the
    /// broker-assigned id and status `Submitted`.
    pub fn create_order(&self, request: OrderRequest) -> Result<Order, OrderError> {
        let inner = &self.inner;

        if !inner.trading_enabled.load(Ordering::Acquire) || inner.kill_switch.should_stop() {
            return Err(OrderError::TradingDisabled);
        }
        if inner.kill_switch.is_paused() {
            return Err(OrderError::TradingDisabled);
        }
        if request.offset.is_open() && inner.open_restricted.load(Ordering::Acquire) {
            return Err(OrderError::OpenRestricted);
        }
        if request.volume == 0 {
            return Err(OrderError::ZeroVolume);
        }

        let mut order = Order {
            client_order_id: request.client_id.unwrap_or_else(ClientOrderId::generate),
            order_id: None,
            strategy_id: request.strategy_id,
            symbol: request.symbol,
            direction: request.direction,
            offset: request.offset,
            order_type: request.order_type,
            price: request.price,
            volume: request.volume,
            filled_volume: 0,
            avg_fill_price: Decimal::ZERO,
            status: OrderStatus::Submitting,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            cancelled_at: None,
            last_error: None,
            retry_count: 0,
            trace_id: TraceId::generate(),
        };

        // Pre-trade risk evaluation
        if let Some(risk) = inner.risk.read().clone() {
            match risk.check_order(&order, None) {
                RiskDecision::Accept => {}
                RiskDecision::Reject { rule_id, reason } => {
                    inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(OrderError::RiskRejected { rule_id, reason });
                }
            }
        }

        // Margin check for opens; the broker remains authoritative and may
        // still reject, this keeps obviously-unfunded orders local
        if order.offset.is_open() {
            if let Some(account) = inner.account.read().clone() {
                if !account.can_open_position(&order.symbol, order.volume, order.price) {
                    inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(OrderError::AccountRejected {
                        reason: "insufficient available balance for margin".into(),
                    });
                }
            }
        }

        inner.counters.created.fetch_add(1, Ordering::Relaxed);
        inner.index_order(&order);
        inner.emit_order_update(&order);

        // Submit with bounded fixed-interval retries on transient errors
        let place = PlaceOrder {
            symbol: order.symbol.clone(),
            direction: order.direction,
            offset: order.offset,
            volume: order.volume,
            price: Some(order.price),
            order_type: order.order_type,
        };
        let mut backoff = Backoff::new(BackoffConfig::fixed(
            inner.config.retry_interval,
            inner.config.max_retries,
        ));

        loop {
            match inner.broker.place_order(&place) {
                Ok(broker_id) => {
                    inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    let updated = inner.mutate_order(order.client_order_id, |o| {
                        o.order_id = Some(broker_id.clone());
                        o.status = OrderStatus::Submitted;
                        o.retry_count = order.retry_count;
                    });
                    inner
                        .by_broker_id
                        .insert(broker_id.clone(), order.client_order_id);
                    let Some(updated) = updated else {
                        // Unreachable in practice: the order was indexed above
                        return Err(OrderError::NotFound(order.client_order_id.to_string()));
                    };
                    inner.emit_order_update(&updated);

                    // A fill pushed before the broker id was indexed would
                    // have been ignored; one reconciling query closes that
                    // window (idempotent via cumulative volume)
                    if let Ok(snapshot) = inner.broker.get_order(&broker_id) {
                        if snapshot.filled_volume > 0 || snapshot.status != updated.status {
                            inner.apply_broker_snapshot(&snapshot);
                        }
                    }
                    return Ok(inner
                        .orders
                        .get(&order.client_order_id)
                        .map(|o| o.clone())
                        .unwrap_or(updated));
                }
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        order.retry_count += 1;
                        inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            client_order_id = %order.client_order_id,
                            attempt = order.retry_count,
                            %err,
                            "transient submission error, retrying"
                        );
                        std::thread::sleep(delay);
                    }
                    None => {
                        let retry_count = order.retry_count;
                        let updated = inner.mutate_order(order.client_order_id, |o| {
                            o.status = OrderStatus::Failed;
                            o.retry_count = retry_count;
                            o.last_error = Some(err.to_string());
                        });
                        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                        if let Some(updated) = updated {
                            inner.emit_order_update(&updated);
                        }
                        return Err(OrderError::Broker(err));
                    }
                },
                Err(err) => {
                    let updated = inner.fail_order(
                        order.client_order_id,
                        OrderStatus::Rejected,
                        &err.to_string(),
                    );
                    inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    if let Some(updated) = updated {
                        inner.emit_order_update(&updated);
                    }
                    return Err(OrderError::Broker(err));
                }
            }
        }
    }

    /// Request cancellation. Valid from `Submitting`, `Submitted` and
    /// `PartialFilled`. Cancels are not retried; on broker failure the
    /// order state is re-queried instead.
    pub fn cancel_order(&self, client_order_id: ClientOrderId) -> Result<(), OrderError> {
        let inner = &self.inner;
        let (broker_id, prior_status) = {
            let order = inner
                .orders
                .get(&client_order_id)
                .ok_or_else(|| OrderError::NotFound(client_order_id.to_string()))?;
            if !order.status.can_cancel() {
                return Err(OrderError::NotCancellable {
                    state: order.status,
                });
            }
            (order.order_id.clone(), order.status)
        };

        let Some(broker_id) = broker_id else {
            // Never acknowledged; fail it locally
            if let Some(updated) =
                inner.fail_order(client_order_id, OrderStatus::Cancelled, "cancelled before ack")
            {
                inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                inner.emit_order_update(&updated);
            }
            return Ok(());
        };

        if let Some(updated) = inner.mutate_order(client_order_id, |o| {
            o.status = OrderStatus::Cancelling;
            o.cancelled_at = Some(Utc::now());
        }) {
            inner.emit_order_update(&updated);
        }

        match inner.broker.cancel_order(&broker_id) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%broker_id, %err, "cancel failed, re-querying order state");
                if let Ok(snapshot) = inner.broker.get_order(&broker_id) {
                    Inner::apply_broker_snapshot(inner, &snapshot);
                } else {
                    // Restore the prior state; the tracking loop keeps watching
                    if let Some(updated) = inner.mutate_order(client_order_id, |o| {
                        o.status = prior_status;
                    }) {
                        inner.emit_order_update(&updated);
                    }
                }
                Err(OrderError::Broker(err))
            }
        }
    }

    /// Cancel every active order matching the filter, concurrently.
    /// Returns (succeeded, failed) counts.
    pub fn cancel_all(&self, strategy_id: Option<&str>, symbol: Option<&str>) -> (usize, usize) {
        let candidates: Vec<ClientOrderId> = self
            .inner
            .active
            .lock()
            .iter()
            .copied()
            .filter(|id| {
                self.inner.orders.get(id).map_or(false, |o| {
                    o.status.can_cancel()
                        && strategy_id.map_or(true, |s| o.strategy_id == s)
                        && symbol.map_or(true, |s| o.symbol == s)
                })
            })
            .collect();

        let succeeded = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        std::thread::scope(|scope| {
            let succeeded = &succeeded;
            let failed = &failed;
            for id in &candidates {
                scope.spawn(move || match self.cancel_order(*id) {
                    Ok(()) => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        debug!(client_order_id = %id, %err, "cancel_all: cancel failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        (
            succeeded.load(Ordering::Relaxed) as usize,
            failed.load(Ordering::Relaxed) as usize,
        )
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_order(&self, client_order_id: ClientOrderId) -> Option<Order> {
        self.inner.orders.get(&client_order_id).map(|o| o.clone())
    }

    /// Look up by the broker-assigned id.
    pub fn get_order_by_broker_id(&self, broker_id: &str) -> Option<Order> {
        let client_id = *self.inner.by_broker_id.get(broker_id)?;
        self.get_order(client_id)
    }

    pub fn get_orders(&self, filter: &OrderFilter) -> Vec<Order> {
        // The symbol/strategy indexes narrow the scan when the filter names
        // one; remaining fields still go through `matches`
        if let Some(ids) = self.inner.candidate_ids(filter) {
            return ids
                .iter()
                .filter_map(|id| self.get_order(*id))
                .filter(|order| filter.matches(order))
                .collect();
        }
        self.inner
            .orders
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_active_orders(&self) -> Vec<Order> {
        let active = self.inner.active.lock().clone();
        active
            .iter()
            .filter_map(|id| self.get_order(*id))
            .collect()
    }

    pub fn get_completed_orders(&self) -> Vec<Order> {
        self.inner
            .orders
            .iter()
            .filter(|entry| entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_order_count(&self, filter: &OrderFilter) -> usize {
        self.get_orders(filter).len()
    }

    pub fn stats(&self) -> OrderManagerStats {
        let c = &self.inner.counters;
        OrderManagerStats {
            created: c.created.load(Ordering::Relaxed),
            submitted: c.submitted.load(Ordering::Relaxed),
            filled: c.filled.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            active: self.inner.active.lock().len(),
        }
    }

    // ------------------------------------------------------------------
    // Toggles and listeners
    // ------------------------------------------------------------------

    pub fn enable_trading(&self) {
        self.inner.trading_enabled.store(true, Ordering::Release);
        info!("trading enabled");
    }

    pub fn disable_trading(&self) {
        self.inner.trading_enabled.store(false, Ordering::Release);
        warn!("trading disabled");
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.inner.trading_enabled.load(Ordering::Acquire)
    }

    /// Restriction mode: when set, opening orders are refused while closes
    /// still pass.
    pub fn set_order_restriction(&self, restricted: bool) {
        self.inner
            .open_restricted
            .store(restricted, Ordering::Release);
        info!(restricted, "open-order restriction updated");
    }

    pub fn add_order_listener(&self, listener: OrderListener) {
        self.inner.order_listeners.write().push(listener);
    }

    pub fn add_trade_listener(&self, listener: TradeListener) {
        self.inner.trade_listeners.write().push(listener);
    }
}

impl Inner {
    /// Ids from the narrower of the symbol/strategy indexes, when the
    /// filter names either. None means a full scan is required.
    fn candidate_ids(&self, filter: &OrderFilter) -> Option<Vec<ClientOrderId>> {
        if let Some(symbol) = &filter.symbol {
            return Some(
                self.by_symbol
                    .get(symbol)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default(),
            );
        }
        if let Some(strategy_id) = &filter.strategy_id {
            return Some(
                self.by_strategy
                    .get(strategy_id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default(),
            );
        }
        None
    }

    fn index_order(&self, order: &Order) {
        self.orders.insert(order.client_order_id, order.clone());
        self.by_symbol
            .entry(order.symbol.clone())
            .or_default()
            .insert(order.client_order_id);
        self.by_strategy
            .entry(order.strategy_id.clone())
            .or_default()
            .insert(order.client_order_id);
        self.active.lock().insert(order.client_order_id);
    }

    /// Apply a mutation under the order's entry and return the updated copy.
    /// Terminal orders are left untouched.
    fn mutate_order(
        &self,
        client_order_id: ClientOrderId,
        mutate: impl FnOnce(&mut Order),
    ) -> Option<Order> {
        let mut entry = self.orders.get_mut(&client_order_id)?;
        if entry.status.is_terminal() {
            return None;
        }
        mutate(&mut entry);
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        drop(entry);

        if updated.status.is_terminal() {
            self.active.lock().remove(&client_order_id);
        }
        Some(updated)
    }

    fn fail_order(
        &self,
        client_order_id: ClientOrderId,
        status: OrderStatus,
        reason: &str,
    ) -> Option<Order> {
        self.mutate_order(client_order_id, |o| {
            o.status = status;
            o.last_error = Some(reason.to_string());
        })
    }

    /// Reconcile one broker report into local state. This is the single
    /// path for polls, pushes and post-reconnect reloads, so fills are
    /// detected exactly once via the cumulative volume.
    fn apply_broker_snapshot(self: &Arc<Self>, snapshot: &OrderSnapshot) {
        let Some(client_id) = self.by_broker_id.get(&snapshot.order_id).map(|e| *e) else {
            debug!(order_id = %snapshot.order_id, "broker report for unknown order");
            return;
        };

        let (fill_delta, changed, updated) = {
            let Some(mut entry) = self.orders.get_mut(&client_id) else {
                return;
            };
            if entry.status.is_terminal() {
                return;
            }
            let prior_status = entry.status;

            // Cumulative fill accounting; re-deliveries are idempotent
            let mut fill_delta = 0u64;
            if snapshot.filled_volume > entry.filled_volume {
                if snapshot.filled_volume > entry.volume {
                    error!(
                        client_order_id = %client_id,
                        reported = snapshot.filled_volume,
                        volume = entry.volume,
                        "broker reported fill beyond order volume"
                    );
                    drop(entry);
                    self.emit_emergency(
                        "filled_exceeds_volume",
                        &client_id.to_string(),
                    );
                    return;
                }
                fill_delta = snapshot.filled_volume - entry.filled_volume;
                entry.filled_volume = snapshot.filled_volume;
                if snapshot.avg_fill_price > Decimal::ZERO {
                    entry.avg_fill_price = snapshot.avg_fill_price;
                }
            } else if snapshot.filled_volume < entry.filled_volume {
                warn!(
                    client_order_id = %client_id,
                    reported = snapshot.filled_volume,
                    known = entry.filled_volume,
                    "ignoring non-increasing fill report"
                );
            }

            if let Some(next) = next_status(entry.status, snapshot.status, entry.filled_volume) {
                entry.status = next;
            }
            let changed = entry.status != prior_status || fill_delta > 0;
            if changed {
                entry.updated_at = Utc::now();
            }
            let updated = entry.clone();
            drop(entry);

            if updated.status.is_terminal() {
                self.active.lock().remove(&client_id);
            }
            (fill_delta, changed, updated)
        };

        if fill_delta > 0 {
            let price = if snapshot.avg_fill_price > Decimal::ZERO {
                snapshot.avg_fill_price
            } else {
                updated.price
            };
            let trade = Trade {
                client_order_id: updated.client_order_id,
                order_id: snapshot.order_id.clone(),
                strategy_id: updated.strategy_id.clone(),
                symbol: updated.symbol.clone(),
                direction: updated.direction,
                offset: updated.offset,
                price,
                volume: fill_delta,
                commission: self.config.commission_per_lot * Decimal::from(fill_delta),
                executed_at: Utc::now(),
                trace_id: updated.trace_id,
            };
            self.emit_trade(&trade);
            if updated.status == OrderStatus::Filled {
                self.counters.filled.fetch_add(1, Ordering::Relaxed);
            }
        }
        if changed && updated.status == OrderStatus::Cancelled {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        if changed {
            self.emit_order_update(&updated);
        }
    }

    fn track_active_orders(self: &Arc<Self>) {
        if !self.broker.connection_state().is_connected() {
            return;
        }
        let active: Vec<ClientOrderId> = self.active.lock().iter().copied().collect();
        for client_id in active {
            let broker_id = match self.orders.get(&client_id) {
                Some(order) => order.order_id.clone(),
                None => continue,
            };
            let Some(broker_id) = broker_id else { continue };
            match self.broker.get_order(&broker_id) {
                Ok(snapshot) => self.apply_broker_snapshot(&snapshot),
                Err(err) => debug!(%broker_id, %err, "order poll failed"),
            }
        }
    }

    fn check_timeouts(self: &Arc<Self>) {
        let now = Utc::now();
        let submit_timeout =
            chrono::Duration::from_std(self.config.submit_timeout).unwrap_or_default();

        let active: Vec<ClientOrderId> = self.active.lock().iter().copied().collect();
        for client_id in active {
            let timed_out = self.orders.get(&client_id).map_or(false, |o| {
                o.status == OrderStatus::Submitting && now - o.created_at > submit_timeout
            });
            if timed_out {
                warn!(client_order_id = %client_id, "submission timed out");
                if let Some(updated) =
                    self.fail_order(client_id, OrderStatus::Failed, "submission timeout")
                {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.emit_order_update(&updated);
                }
            }
        }
    }

    fn on_connection_change(self: &Arc<Self>, old: ConnectionState, new: ConnectionState) {
        match new {
            ConnectionState::Disconnected | ConnectionState::Error => {
                if old == ConnectionState::Connected {
                    self.needs_resync.store(true, Ordering::Release);
                    self.mark_active_unknown();
                }
            }
            ConnectionState::Connected => {
                if self.needs_resync.swap(false, Ordering::AcqRel) {
                    self.resync_active_orders();
                }
            }
            _ => {}
        }
    }

    /// Broker link lost: every active order's true state is unknowable.
    fn mark_active_unknown(self: &Arc<Self>) {
        let active: Vec<ClientOrderId> = self.active.lock().iter().copied().collect();
        warn!(count = active.len(), "broker disconnected, marking active orders unknown");
        for client_id in active {
            if let Some(updated) = self.mutate_order(client_id, |o| {
                o.status = OrderStatus::Unknown;
            }) {
                self.emit_order_update(&updated);
            }
        }
    }

    /// Reload the broker's view after reconnect and reconcile everything;
    /// unknown orders the broker no longer reports are failed.
    fn resync_active_orders(self: &Arc<Self>) {
        info!("broker reconnected, resyncing active orders");
        match self.broker.get_orders(None) {
            Ok(snapshots) => {
                let mut reported: HashSet<String> = HashSet::new();
                for snapshot in &snapshots {
                    reported.insert(snapshot.order_id.clone());
                    self.apply_broker_snapshot(snapshot);
                }

                let stale: Vec<(ClientOrderId, Option<String>)> = {
                    let active = self.active.lock();
                    active
                        .iter()
                        .filter_map(|id| {
                            let order = self.orders.get(id)?;
                            if order.status == OrderStatus::Unknown {
                                Some((*id, order.order_id.clone()))
                            } else {
                                None
                            }
                        })
                        .collect()
                };
                for (client_id, broker_id) in stale {
                    let gone = match &broker_id {
                        Some(bid) if reported.contains(bid) => false,
                        Some(bid) => {
                            matches!(self.broker.get_order(bid), Err(BrokerError::UnknownOrder(_)))
                        }
                        None => true,
                    };
                    if gone {
                        if let Some(updated) = self.fail_order(
                            client_id,
                            OrderStatus::Failed,
                            "not reported by broker after reconnect",
                        ) {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            self.emit_order_update(&updated);
                        }
                    }
                }
            }
            Err(err) => warn!(%err, "active-order reload failed"),
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn emit_order_update(&self, order: &Order) {
        for listener in self.order_listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(order))).is_err() {
                error!("order listener panicked");
            }
        }

        let event = self
            .bus
            .acquire_event(EventType::OrderUpdate, "order_manager")
            .with_field("client_order_id", order.client_order_id.to_string())
            .with_field("order_id", order.order_id.clone().unwrap_or_default())
            .with_field("symbol", order.symbol.clone())
            .with_field("strategy_id", order.strategy_id.clone())
            .with_field("status", order.status.to_string())
            .with_field("filled_volume", order.filled_volume)
            .with_field("volume", order.volume)
            .with_trace_id(order.trace_id);
        self.bus.publish(event);
    }

    fn emit_trade(&self, trade: &Trade) {
        for listener in self.trade_listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(trade))).is_err() {
                error!("trade listener panicked");
            }
        }

        let event = self
            .bus
            .acquire_event(EventType::TradeFill, "order_manager")
            .with_field("client_order_id", trade.client_order_id.to_string())
            .with_field("order_id", trade.order_id.clone())
            .with_field("symbol", trade.symbol.clone())
            .with_field("strategy_id", trade.strategy_id.clone())
            .with_field("direction", trade.direction.to_string())
            .with_field("offset", trade.offset.to_string())
            .with_field("price", trade.price.to_string())
            .with_field("volume", trade.volume)
            .with_field("commission", trade.commission.to_string())
            .with_trace_id(trade.trace_id);
        self.bus.publish(event);
    }

    fn emit_emergency(&self, kind: &str, detail: &str) {
        let event = self
            .bus
            .acquire_event(EventType::Emergency, "order_manager")
            .with_field("kind", kind)
            .with_field("detail", detail)
            .with_priority(0);
        self.bus.publish(event);
    }
}

/// Status-transition guard: the broker report only moves an order along the
/// declared graph. Returns None when the report should be ignored.
fn next_status(
    current: OrderStatus,
    reported: OrderStatus,
    filled_volume: u64,
) -> Option<OrderStatus> {
    use OrderStatus::*;

    if current.is_terminal() {
        return None;
    }

    match (current, reported) {
        // A cancel we issued: the broker may confirm the cancel or report a
        // race where the order filled first
        (Cancelling, Cancelled) => Some(Cancelled),
        (Cancelling, Filled) => Some(Filled),
        (Cancelling, PartialFilled) => None,
        (Cancelling, _) => None,

        // Unknown reconciles to whatever the broker says
        (Unknown, reported) => Some(reported),

        // Normal flow
        (_, Filled) => Some(Filled),
        (_, Cancelled) => Some(Cancelled),
        (_, Rejected) => Some(Rejected),
        (_, PartialFilled) => Some(PartialFilled),
        (Submitting, Submitted) => Some(Submitted),
        (_, Submitted) if filled_volume == 0 => None,
        _ => None,
    }
}

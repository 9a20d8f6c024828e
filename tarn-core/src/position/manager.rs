//! Position manager
//!
//! The authoritative in-memory position book, derived from executed fills.
//! All mutation happens under one lock; listeners and the bus receive
//! snapshots. A background loop marks positions to market and re-evaluates
//! portfolio risk limits; violations are recorded and fanned out as
//! `risk.breach` events.

use super::types::{
    BreachKind, ClosedPosition, FillRecord, PortfolioStats, Position, PositionKey, PricePoint,
    RiskBreach, RiskLimits,
};
use crate::account::AccountManager;
use crate::broker::BrokerAdapter;
use crate::core::{OrderError, PositionSide};
use crate::event::{EventBus, EventType};
use crate::order::{OrderManager, OrderRequest, Trade};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Listener receiving a snapshot after each position change.
pub type PositionListener = Arc<dyn Fn(&Position) + Send + Sync>;
/// Listener receiving each recorded limit violation.
pub type BreachListener = Arc<dyn Fn(&RiskBreach) + Send + Sync>;

/// Retained breach history cap.
const BREACH_HISTORY_CAP: usize = 256;

/// Position manager configuration.
#[derive(Debug, Clone)]
pub struct PositionManagerConfig {
    /// Mark-to-market interval
    pub update_interval: Duration,
    /// Relative price move below which no history sample is kept
    pub noise_threshold: f64,
    /// Price-history ring capacity per position
    pub history_cap: usize,
    /// Daily volatility estimate used by the parametric VaR
    pub volatility: f64,
    pub limits: RiskLimits,
}

impl Default for PositionManagerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            noise_threshold: 0.001,
            history_cap: 240,
            volatility: 0.02,
            limits: RiskLimits::default(),
        }
    }
}

/// The manager. Cloning shares state.
#[derive(Clone)]
pub struct PositionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: RwLock<PositionManagerConfig>,
    broker: Arc<dyn BrokerAdapter>,
    bus: EventBus,
    orders: OrderManager,
    account: RwLock<Option<AccountManager>>,

    /// The live book; one lock guards every mutation
    positions: Mutex<HashMap<PositionKey, Position>>,
    archived: Mutex<Vec<ClosedPosition>>,
    breaches: Mutex<Vec<RiskBreach>>,

    position_listeners: RwLock<Vec<PositionListener>>,
    breach_listeners: RwLock<Vec<BreachListener>>,

    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PositionManager {
    pub fn new(
        config: PositionManagerConfig,
        broker: Arc<dyn BrokerAdapter>,
        bus: EventBus,
        orders: OrderManager,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                broker,
                bus,
                orders: orders.clone(),
                account: RwLock::new(None),
                positions: Mutex::new(HashMap::new()),
                archived: Mutex::new(Vec::new()),
                breaches: Mutex::new(Vec::new()),
                position_listeners: RwLock::new(Vec::new()),
                breach_listeners: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        };

        // Fills reach the book through the order manager's trade stream
        {
            let inner = Arc::downgrade(&manager.inner);
            orders.add_trade_listener(Arc::new(move |trade| {
                if let Some(inner) = inner.upgrade() {
                    inner.apply_fill(trade);
                }
            }));
        }

        // After a reconnect the broker's view wins
        {
            let weak = Arc::downgrade(&manager.inner);
            manager.inner.broker.add_connection_listener(Arc::new(
                move |old, new| {
                    if old == crate::broker::ConnectionState::Connected
                        || new != crate::broker::ConnectionState::Connected
                    {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        PositionManager { inner }.reload_from_broker();
                    }
                },
            ));
        }

        manager
    }

    /// Attach the account manager used for leverage computation.
    pub fn set_account_manager(&self, account: AccountManager) {
        *self.inner.account.write() = Some(account);
    }

    /// Start the mark-to-market loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("tarn-position".into())
            .spawn(move || loop {
                let interval = inner.config.read().update_interval;
                if !crate::utils::interruptible_sleep(&inner.running, interval) {
                    break;
                }
                inner.mark_to_market();
                inner.check_risk_limits();
            })
            .expect("failed to spawn position update loop");
        *self.inner.worker.lock() = Some(handle);
        info!("position manager started");
    }

    /// Stop the loop. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
        info!("position manager stopped");
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_position(&self, symbol: &str, side: PositionSide) -> Option<Position> {
        self.inner
            .positions
            .lock()
            .get(&PositionKey::new(symbol, side))
            .cloned()
    }

    /// All live positions, optionally filtered by owning strategy.
    pub fn get_positions(&self, strategy_id: Option<&str>) -> Vec<Position> {
        self.inner
            .positions
            .lock()
            .values()
            .filter(|p| strategy_id.map_or(true, |s| p.strategy_id.as_deref() == Some(s)))
            .cloned()
            .collect()
    }

    pub fn get_archived(&self) -> Vec<ClosedPosition> {
        self.inner.archived.lock().clone()
    }

    pub fn get_risk_breaches(&self) -> Vec<RiskBreach> {
        self.inner.breaches.lock().clone()
    }

    /// Portfolio aggregates at the latest marks.
    pub fn calculate_statistics(&self) -> PortfolioStats {
        self.inner.portfolio_stats()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Emit a closing order for a position through the order manager.
    ///
    /// `volume` defaults to the full position, `price` to the last mark.
    pub fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        volume: Option<u64>,
        price: Option<Decimal>,
        strategy_id: Option<&str>,
    ) -> Result<crate::order::Order, OrderError> {
        let (held, last_price, owner) = {
            let positions = self.inner.positions.lock();
            let position = positions
                .get(&PositionKey::new(symbol, side))
                .ok_or_else(|| OrderError::NotFound(format!("{} {}", symbol, side)))?;
            (
                position.volume,
                position.last_price,
                position.strategy_id.clone(),
            )
        };

        let volume = volume.unwrap_or(held).min(held);
        if volume == 0 {
            return Err(OrderError::ZeroVolume);
        }
        let price = match price {
            Some(price) => price,
            None if last_price > Decimal::ZERO => last_price,
            None => {
                // No mark yet; ask the broker
                self.inner
                    .broker
                    .get_market_data(symbol)
                    .map(|q| q.last_price)
                    .map_err(OrderError::Broker)?
            }
        };

        // Closing a long sells; closing a short buys
        let direction = match side {
            PositionSide::Long => crate::core::Direction::Sell,
            PositionSide::Short => crate::core::Direction::Buy,
        };

        let request = OrderRequest {
            symbol: symbol.to_string(),
            direction,
            offset: crate::core::Offset::Close,
            price,
            volume,
            order_type: crate::core::OrderType::Limit,
            strategy_id: strategy_id
                .map(str::to_owned)
                .or(owner)
                .unwrap_or_else(|| "position_manager".to_string()),
            client_id: None,
        };
        self.inner.orders.create_order(request)
    }

    /// Close every live position (optionally one strategy's), concurrently.
    /// Returns (succeeded, failed) counts.
    pub fn close_all(&self, strategy_id: Option<&str>) -> (usize, usize) {
        let targets: Vec<(String, PositionSide)> = self
            .get_positions(strategy_id)
            .into_iter()
            .map(|p| (p.symbol, p.side))
            .collect();
        self.close_targets(&targets, None)
    }

    /// Reduce every live position by `ratio` (0..=1), concurrently.
    pub fn reduce_all(&self, ratio: f64) -> (usize, usize) {
        let ratio = ratio.clamp(0.0, 1.0);
        let targets: Vec<(String, PositionSide, u64)> = self
            .get_positions(None)
            .into_iter()
            .filter_map(|p| {
                let volume = (p.volume as f64 * ratio).round() as u64;
                (volume > 0).then_some((p.symbol, p.side, volume))
            })
            .collect();

        let succeeded = std::sync::atomic::AtomicUsize::new(0);
        let failed = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            let succeeded = &succeeded;
            let failed = &failed;
            for (symbol, side, volume) in &targets {
                scope.spawn(move || {
                    match self.close_position(symbol, *side, Some(*volume), None, None) {
                        Ok(_) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            debug!(%symbol, %err, "reduce_all: close failed");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        (
            succeeded.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
        )
    }

    fn close_targets(
        &self,
        targets: &[(String, PositionSide)],
        volume: Option<u64>,
    ) -> (usize, usize) {
        let succeeded = std::sync::atomic::AtomicUsize::new(0);
        let failed = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            let succeeded = &succeeded;
            let failed = &failed;
            for (symbol, side) in targets {
                scope.spawn(move || match self.close_position(symbol, *side, volume, None, None) {
                    Ok(_) => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        debug!(%symbol, %err, "close_all: close failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        (
            succeeded.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
        )
    }

    /// Adjust a named portfolio limit at runtime.
    pub fn set_risk_limit(&self, name: &str, value: f64) -> bool {
        let updated = self.inner.config.write().limits.set(name, value);
        if updated {
            info!(name, value, "risk limit updated");
        }
        updated
    }

    /// Replace the book from the broker's view, keeping strategy
    /// attribution where keys match. Used after reconnection.
    pub fn reload_from_broker(&self) {
        match self.inner.broker.get_positions() {
            Ok(reported) => {
                let mut positions = self.inner.positions.lock();
                let prior = std::mem::take(&mut *positions);
                for bp in reported {
                    let key = PositionKey::new(bp.symbol.clone(), bp.side);
                    let mut position = prior.get(&key).cloned().unwrap_or_else(|| {
                        Position::open(bp.symbol.clone(), bp.side, None)
                    });
                    position.volume = bp.volume;
                    position.avg_cost = bp.avg_cost;
                    position.last_price = bp.last_price;
                    position.updated_at = chrono::Utc::now();
                    if bp.volume > 0 {
                        positions.insert(key, position);
                    }
                }
                info!(count = positions.len(), "positions reloaded from broker");
            }
            Err(err) => warn!(%err, "position reload failed"),
        }
    }

    pub fn add_position_listener(&self, listener: PositionListener) {
        self.inner.position_listeners.write().push(listener);
    }

    pub fn add_breach_listener(&self, listener: BreachListener) {
        self.inner.breach_listeners.write().push(listener);
    }

    /// Apply a fill directly; the trade-listener wiring calls this, tests
    /// may too.
    pub fn apply_fill(&self, trade: &Trade) {
        self.inner.apply_fill(trade);
    }
}

impl Inner {
    /// Fold one fill into the book under the position lock.
    fn apply_fill(&self, trade: &Trade) {
        let side = PositionSide::for_fill(trade.direction, trade.offset);
        let snapshot = if trade.offset.is_open() {
            self.apply_open(trade, side)
        } else {
            self.apply_close(trade, side)
        };

        if let Some(snapshot) = snapshot {
            self.notify_position(&snapshot);
        }
    }

    fn apply_open(&self, trade: &Trade, side: PositionSide) -> Option<Position> {
        let mut positions = self.positions.lock();
        let key = PositionKey::new(trade.symbol.clone(), side);
        let position = positions.entry(key).or_insert_with(|| {
            Position::open(
                trade.symbol.clone(),
                side,
                Some(trade.strategy_id.clone()),
            )
        });

        let old_volume = Decimal::from(position.volume);
        let fill_volume = Decimal::from(trade.volume);
        let new_volume = old_volume + fill_volume;
        // Volume-weighted average entry cost
        position.avg_cost =
            (position.avg_cost * old_volume + trade.price * fill_volume) / new_volume;
        position.volume += trade.volume;
        position.last_price = trade.price;
        position.float_pnl = position.unrealized_at(trade.price);
        position.updated_at = trade.executed_at;
        position.fills.push(FillRecord {
            price: trade.price,
            volume: trade.volume,
            offset: trade.offset,
            executed_at: trade.executed_at,
        });
        Some(position.clone())
    }

    fn apply_close(&self, trade: &Trade, side: PositionSide) -> Option<Position> {
        let mut positions = self.positions.lock();
        let key = PositionKey::new(trade.symbol.clone(), side);
        let Some(position) = positions.get_mut(&key) else {
            warn!(
                symbol = %trade.symbol,
                %side,
                "closing fill for unknown position, ignoring"
            );
            return None;
        };

        let executed = trade.volume.min(position.volume);
        if executed < trade.volume {
            error!(
                symbol = %trade.symbol,
                requested = trade.volume,
                held = position.volume,
                "closing fill exceeds held volume, clamping"
            );
            self.emit_emergency("close_exceeds_position", &trade.symbol);
        }
        if executed == 0 {
            return None;
        }

        let executed_dec = Decimal::from(executed);
        let pnl = match side {
            PositionSide::Long => (trade.price - position.avg_cost) * executed_dec,
            PositionSide::Short => (position.avg_cost - trade.price) * executed_dec,
        };
        position.realized_pnl += pnl;
        position.volume -= executed;
        position.last_price = trade.price;
        position.float_pnl = position.unrealized_at(trade.price);
        position.updated_at = trade.executed_at;
        position.fills.push(FillRecord {
            price: trade.price,
            volume: executed,
            offset: trade.offset,
            executed_at: trade.executed_at,
        });

        let snapshot = position.clone();
        if position.volume == 0 {
            let closed = positions.remove(&key).map(|p| ClosedPosition {
                symbol: p.symbol,
                side: p.side,
                realized_pnl: p.realized_pnl,
                opened_at: p.opened_at,
                closed_at: trade.executed_at,
                strategy_id: p.strategy_id,
                fills: p.fills,
            });
            drop(positions);
            if let Some(closed) = closed {
                debug!(
                    symbol = %closed.symbol,
                    side = %closed.side,
                    realized = %closed.realized_pnl,
                    "position closed and archived"
                );
                self.archived.lock().push(closed);
            }
        }
        Some(snapshot)
    }

    /// Refresh marks and floating P&L from the broker; record history
    /// samples for moves beyond the noise threshold.
    fn mark_to_market(&self) {
        if !self.broker.connection_state().is_connected() {
            return;
        }
        let symbols: Vec<String> = {
            let positions = self.positions.lock();
            let mut symbols: Vec<String> =
                positions.keys().map(|k| k.symbol.clone()).collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };

        let (noise_threshold, history_cap) = {
            let config = self.config.read();
            (config.noise_threshold, config.history_cap)
        };

        for symbol in symbols {
            let quote = match self.broker.get_market_data(&symbol) {
                Ok(quote) => quote,
                Err(err) => {
                    debug!(%symbol, %err, "mark-to-market quote fetch failed");
                    continue;
                }
            };

            let mut updated = Vec::new();
            {
                let mut positions = self.positions.lock();
                for side in [PositionSide::Long, PositionSide::Short] {
                    let key = PositionKey::new(symbol.clone(), side);
                    if let Some(position) = positions.get_mut(&key) {
                        let old_price = position.last_price;
                        position.last_price = quote.last_price;
                        position.float_pnl = position.unrealized_at(quote.last_price);
                        position.updated_at = quote.timestamp;

                        let relative_move = if old_price.is_zero() {
                            1.0
                        } else {
                            ((quote.last_price - old_price) / old_price)
                                .abs()
                                .to_f64()
                                .unwrap_or(0.0)
                        };
                        if relative_move >= noise_threshold {
                            position.price_history.push_back(PricePoint {
                                price: quote.last_price,
                                at: quote.timestamp,
                            });
                            while position.price_history.len() > history_cap {
                                position.price_history.pop_front();
                            }
                        }
                        updated.push(position.clone());
                    }
                }
            }
            for snapshot in updated {
                self.notify_position(&snapshot);
            }
        }
    }

    fn portfolio_stats(&self) -> PortfolioStats {
        let volatility = self.config.read().volatility;

        let positions = self.positions.lock();
        let mut stats = PortfolioStats {
            live_positions: positions.len(),
            ..Default::default()
        };

        for position in positions.values() {
            let value = position.market_value();
            match position.side {
                PositionSide::Long => stats.total_long_value += value,
                PositionSide::Short => stats.total_short_value += value,
            }
            if value > stats.max_single_value {
                stats.max_single_value = value;
            }
        }
        drop(positions);

        stats.net_exposure = stats.total_long_value - stats.total_short_value;
        stats.abs_exposure = stats.total_long_value + stats.total_short_value;
        stats.concentration =
            PortfolioStats::concentration_of(stats.max_single_value, stats.abs_exposure);

        if let Some(account) = self.account.read().clone() {
            if let Some(info) = account.primary_account() {
                if info.balance > Decimal::ZERO {
                    stats.leverage = (stats.abs_exposure / info.balance)
                        .to_f64()
                        .unwrap_or(0.0);
                }
            }
        }

        // Parametric VaR: 1.65 sigma on the net exposure
        let var_factor = Decimal::from_f64_retain(1.65 * volatility).unwrap_or_default();
        stats.var_estimate = stats.net_exposure.abs() * var_factor;
        stats
    }

    /// Evaluate portfolio limits and record violations.
    fn check_risk_limits(&self) {
        let limits = self.config.read().limits.clone();
        let stats = self.portfolio_stats();
        let mut breaches = Vec::new();

        if stats.leverage > limits.max_leverage {
            breaches.push(RiskBreach {
                kind: BreachKind::Leverage,
                detail: "portfolio leverage above limit".into(),
                value: stats.leverage,
                limit: limits.max_leverage,
                at: chrono::Utc::now(),
            });
        }
        if stats.concentration > limits.max_concentration {
            breaches.push(RiskBreach {
                kind: BreachKind::Concentration,
                detail: "single-position concentration above limit".into(),
                value: stats.concentration,
                limit: limits.max_concentration,
                at: chrono::Utc::now(),
            });
        }
        if stats.max_single_value > limits.max_position_value {
            breaches.push(RiskBreach {
                kind: BreachKind::PositionValue,
                detail: "largest position value above limit".into(),
                value: stats.max_single_value.to_f64().unwrap_or(f64::MAX),
                limit: limits.max_position_value.to_f64().unwrap_or(f64::MAX),
                at: chrono::Utc::now(),
            });
        }
        if stats.var_estimate > limits.max_var {
            breaches.push(RiskBreach {
                kind: BreachKind::Var,
                detail: "value-at-risk estimate above limit".into(),
                value: stats.var_estimate.to_f64().unwrap_or(f64::MAX),
                limit: limits.max_var.to_f64().unwrap_or(f64::MAX),
                at: chrono::Utc::now(),
            });
        }

        // Per-symbol volume ceilings
        {
            let positions = self.positions.lock();
            for (symbol, cap) in &limits.per_symbol_volume {
                let held: u64 = positions
                    .values()
                    .filter(|p| &p.symbol == symbol)
                    .map(|p| p.volume)
                    .sum();
                if held > *cap {
                    breaches.push(RiskBreach {
                        kind: BreachKind::SymbolSize,
                        detail: format!("{} volume above limit", symbol),
                        value: held as f64,
                        limit: *cap as f64,
                        at: chrono::Utc::now(),
                    });
                }
            }
        }

        for breach in breaches {
            self.record_breach(breach);
        }
    }

    fn record_breach(&self, breach: RiskBreach) {
        warn!(
            kind = ?breach.kind,
            value = breach.value,
            limit = breach.limit,
            "position risk limit breached"
        );
        {
            let mut history = self.breaches.lock();
            history.push(breach.clone());
            let len = history.len();
            if len > BREACH_HISTORY_CAP {
                history.drain(..len - BREACH_HISTORY_CAP);
            }
        }

        for listener in self.breach_listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(&breach))).is_err() {
                error!("breach listener panicked");
            }
        }

        let event = self
            .bus
            .acquire_event(EventType::Custom("risk.breach".into()), "position_manager")
            .with_field("kind", serde_json::to_value(breach.kind).unwrap_or_default())
            .with_field("detail", breach.detail.clone())
            .with_field("value", breach.value)
            .with_field("limit", breach.limit)
            .with_priority(2);
        self.bus.publish(event);
    }

    fn notify_position(&self, snapshot: &Position) {
        for listener in self.position_listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                error!("position listener panicked");
            }
        }

        let event = self
            .bus
            .acquire_event(EventType::PositionChange, "position_manager")
            .with_field("symbol", snapshot.symbol.clone())
            .with_field("side", snapshot.side.to_string())
            .with_field("volume", snapshot.volume)
            .with_field("avg_cost", snapshot.avg_cost.to_string())
            .with_field("float_pnl", snapshot.float_pnl.to_string())
            .with_field("realized_pnl", snapshot.realized_pnl.to_string());
        self.bus.publish(event);
    }

    fn emit_emergency(&self, kind: &str, detail: &str) {
        let event = self
            .bus
            .acquire_event(EventType::Emergency, "position_manager")
            .with_field("kind", kind)
            .with_field("detail", detail)
            .with_priority(0);
        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::core::{ClientOrderId, Direction, Offset, TraceId};
    use crate::event::EventBusConfig;
    use crate::order::OrderManagerConfig;
    use crate::resilience::KillSwitch;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn setup() -> (PositionManager, Arc<SimBroker>) {
        let broker = Arc::new(SimBroker::new());
        broker.connect().unwrap();
        let bus = EventBus::new(EventBusConfig::default());
        let orders = OrderManager::new(
            OrderManagerConfig::default(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
            KillSwitch::new(),
        );
        let manager = PositionManager::new(
            PositionManagerConfig::default(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus,
            orders,
        );
        (manager, broker)
    }

    fn trade(
        symbol: &str,
        direction: Direction,
        offset: Offset,
        price: Decimal,
        volume: u64,
    ) -> Trade {
        Trade {
            client_order_id: ClientOrderId::generate(),
            order_id: "SIM-1".into(),
            strategy_id: "s1".into(),
            symbol: symbol.into(),
            direction,
            offset,
            price,
            volume,
            commission: Decimal::ZERO,
            executed_at: Utc::now(),
            trace_id: TraceId::generate(),
        }
    }

    #[test]
    fn test_open_fills_build_weighted_cost() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3520), 2));

        let position = manager.get_position("rb2405", PositionSide::Long).unwrap();
        assert_eq!(position.volume, 4);
        assert_eq!(position.avg_cost, dec!(3510));
        assert_eq!(position.fills.len(), 2);
        assert_eq!(position.strategy_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_close_realizes_pnl_and_archives() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));
        manager.apply_fill(&trade("rb2405", Direction::Sell, Offset::Close, dec!(3510), 2));

        assert!(manager.get_position("rb2405", PositionSide::Long).is_none());
        let archived = manager.get_archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].realized_pnl, dec!(20));
    }

    #[test]
    fn test_partial_close_keeps_position_live() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 5));
        manager.apply_fill(&trade("rb2405", Direction::Sell, Offset::Close, dec!(3490), 2));

        let position = manager.get_position("rb2405", PositionSide::Long).unwrap();
        assert_eq!(position.volume, 3);
        assert_eq!(position.realized_pnl, dec!(-20));
        // Average cost unchanged by closes
        assert_eq!(position.avg_cost, dec!(3500));
    }

    #[test]
    fn test_short_close_pnl_sign() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Sell, Offset::Open, dec!(3600), 3));
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Close, dec!(3550), 3));

        let archived = manager.get_archived();
        assert_eq!(archived[0].realized_pnl, dec!(150));
    }

    #[test]
    fn test_close_clamps_to_held_volume() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));
        manager.apply_fill(&trade("rb2405", Direction::Sell, Offset::Close, dec!(3510), 5));

        // Executed volume clamped to 2; position archived
        assert!(manager.get_position("rb2405", PositionSide::Long).is_none());
        assert_eq!(manager.get_archived()[0].realized_pnl, dec!(20));
    }

    #[test]
    fn test_close_unknown_position_ignored() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Sell, Offset::Close, dec!(3510), 5));
        assert!(manager.get_positions(None).is_empty());
        assert!(manager.get_archived().is_empty());
    }

    #[test]
    fn test_long_and_short_books_are_distinct() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));
        manager.apply_fill(&trade("rb2405", Direction::Sell, Offset::Open, dec!(3600), 3));

        assert_eq!(
            manager
                .get_position("rb2405", PositionSide::Long)
                .unwrap()
                .volume,
            2
        );
        assert_eq!(
            manager
                .get_position("rb2405", PositionSide::Short)
                .unwrap()
                .volume,
            3
        );
    }

    #[test]
    fn test_close_position_emits_order() {
        let (manager, broker) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));
        broker.set_quote("rb2405", dec!(3510));

        let order = manager
            .close_position("rb2405", PositionSide::Long, None, None, None)
            .unwrap();
        assert_eq!(order.direction, Direction::Sell);
        assert_eq!(order.offset, Offset::Close);
        assert_eq!(order.volume, 2);
        assert_eq!(broker.order_count(), 1);
    }

    #[test]
    fn test_reduce_all_halves_book() {
        let (manager, broker) = setup();
        broker.set_quote("rb2405", dec!(3500));
        broker.set_quote("cu2406", dec!(70000));
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 4));
        manager.apply_fill(&trade("cu2406", Direction::Buy, Offset::Open, dec!(70000), 2));

        let (ok, fail) = manager.reduce_all(0.5);
        assert_eq!((ok, fail), (2, 0));
        // Orders placed for half of each position
        assert_eq!(broker.order_count(), 2);
    }

    #[test]
    fn test_risk_limit_breach_recorded() {
        let (manager, _) = setup();
        manager.set_risk_limit("max_var", 1.0);
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 10));

        // Marks come from the fill price before any market update
        manager.inner.check_risk_limits();
        let breaches = manager.get_risk_breaches();
        assert!(breaches.iter().any(|b| b.kind == BreachKind::Var));
    }

    #[test]
    fn test_portfolio_stats() {
        let (manager, _) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));
        manager.apply_fill(&trade("cu2406", Direction::Sell, Offset::Open, dec!(70000), 1));

        let stats = manager.calculate_statistics();
        assert_eq!(stats.total_long_value, dec!(7000));
        assert_eq!(stats.total_short_value, dec!(70000));
        assert_eq!(stats.net_exposure, dec!(-63000));
        assert_eq!(stats.abs_exposure, dec!(77000));
        assert_eq!(stats.live_positions, 2);
        approx::assert_relative_eq!(
            stats.concentration,
            70_000.0 / 77_000.0,
            epsilon = 1e-9
        );
        // VaR: 1.65 x 0.02 volatility x |net exposure|
        approx::assert_relative_eq!(
            stats.var_estimate.to_f64().unwrap(),
            1.65 * 0.02 * 63_000.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_reload_preserves_attribution() {
        let (manager, broker) = setup();
        manager.apply_fill(&trade("rb2405", Direction::Buy, Offset::Open, dec!(3500), 2));

        broker.set_positions(vec![crate::broker::BrokerPosition {
            symbol: "rb2405".into(),
            side: PositionSide::Long,
            volume: 5,
            avg_cost: dec!(3490),
            last_price: dec!(3505),
        }]);
        manager.reload_from_broker();

        let position = manager.get_position("rb2405", PositionSide::Long).unwrap();
        assert_eq!(position.volume, 5);
        assert_eq!(position.avg_cost, dec!(3490));
        assert_eq!(position.strategy_id.as_deref(), Some("s1"));
    }
}

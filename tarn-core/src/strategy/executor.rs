//! Strategy executor
//!
//! Drives loaded strategies: the main timer (`on_timer` then `run` per
//! interval), bus-event fan-out filtered by each strategy's subscription
//! set, config-directory scanning with hot reload, and resource policing.
//!
//! Isolation: every callback runs under the strategy's own mutex with
//! `catch_unwind`; a failing strategy is counted and (policy permitting)
//! auto-stopped without touching its siblings.

use super::instance::{StrategyInstance, StrategyMetrics};
use super::monitor::{CpuSampler, ResourcePolicy};
use super::registry::StrategyRegistry;
use super::{Bar, Strategy, StrategyContext};
use crate::account::AccountManager;
use crate::broker::{BrokerAdapter, MarketQuote};
use crate::core::{ClientOrderId, Direction, Offset, PositionSide};
use crate::event::{Event, EventBus, EventType, HandlerKind, SubscriptionId};
use crate::order::{OrderManager, Trade};
use crate::position::PositionManager;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Resource-monitor thresholds and policy.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub sample_interval: Duration,
    pub max_cpu_pct: f64,
    pub max_rss_mb: f64,
    pub policy: ResourcePolicy,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            max_cpu_pct: 90.0,
            max_rss_mb: 2048.0,
            policy: ResourcePolicy::WarnOnly,
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Main timer driving `on_timer` + `run`
    pub timer_interval: Duration,
    /// Config-directory scan interval
    pub scan_interval: Duration,
    /// Directory of per-strategy JSON configs
    pub strategies_dir: PathBuf,
    /// Stop a strategy whose callback error rate exceeds the threshold
    pub auto_stop_on_errors: bool,
    pub max_error_rate: f64,
    /// Callbacks delivered before the error rate is meaningful
    pub min_error_samples: u64,
    pub resource: ResourceConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timer_interval: Duration::from_secs(1),
            scan_interval: Duration::from_secs(60),
            strategies_dir: PathBuf::from("strategies"),
            auto_stop_on_errors: true,
            max_error_rate: 0.5,
            min_error_samples: 20,
            resource: ResourceConfig::default(),
        }
    }
}

/// One strategy's config file: `strategies/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyFileConfig {
    pub strategy_id: String,
    /// Registry class name
    pub class: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_version() -> u32 {
    1
}

/// Status view of a loaded strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatus {
    pub id: String,
    pub class: String,
    pub version: u32,
    pub running: bool,
    pub initialized: bool,
    pub symbols: Vec<String>,
    pub auto_start: bool,
    pub metrics: super::instance::StrategyMetricsSnapshot,
}

/// The executor. Cloning shares state.
#[derive(Clone)]
pub struct StrategyExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExecutorConfig,
    registry: StrategyRegistry,
    orders: OrderManager,
    positions: PositionManager,
    account: AccountManager,
    broker: Arc<dyn BrokerAdapter>,
    bus: EventBus,

    instances: RwLock<HashMap<String, Arc<StrategyInstance>>>,
    loads_blocked: AtomicBool,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl StrategyExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        registry: StrategyRegistry,
        orders: OrderManager,
        positions: PositionManager,
        account: AccountManager,
        broker: Arc<dyn BrokerAdapter>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                orders,
                positions,
                account,
                broker,
                bus,
                instances: RwLock::new(HashMap::new()),
                loads_blocked: AtomicBool::new(false),
                running: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start event fan-out, the timer, the config scanner and the resource
    /// monitor. Performs an immediate config scan. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        // Event fan-out: one bus handler per event family
        let patterns = [
            "market_tick",
            "market_bar",
            "trade_fill",
            "order_update",
            "position_change",
            "account_change",
        ];
        let mut subscriptions = self.inner.subscriptions.lock();
        for pattern in patterns {
            let inner = Arc::downgrade(&self.inner);
            let id = self.inner.bus.subscribe(
                pattern,
                format!("strategy_executor:{}", pattern),
                HandlerKind::Io,
                move |event| {
                    if let Some(inner) = inner.upgrade() {
                        inner.handle_event(event);
                    }
                    Ok(())
                },
            );
            subscriptions.push(id);
        }
        drop(subscriptions);

        self.scan_configs();

        let mut threads = self.inner.threads.lock();

        {
            let inner = Arc::clone(&self.inner);
            threads.push(
                std::thread::Builder::new()
                    .name("tarn-strategy-timer".into())
                    .spawn(move || inner.timer_loop())
                    .expect("failed to spawn strategy timer"),
            );
        }
        {
            let inner = Arc::clone(&self.inner);
            threads.push(
                std::thread::Builder::new()
                    .name("tarn-strategy-scan".into())
                    .spawn(move || inner.scan_loop())
                    .expect("failed to spawn config scanner"),
            );
        }
        {
            let inner = Arc::clone(&self.inner);
            threads.push(
                std::thread::Builder::new()
                    .name("tarn-strategy-monitor".into())
                    .spawn(move || inner.resource_loop())
                    .expect("failed to spawn resource monitor"),
            );
        }
        drop(threads);

        info!("strategy executor started");
    }

    /// Stop every strategy and every loop. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        for id in self.inner.subscriptions.lock().drain(..) {
            self.inner.bus.unsubscribe(id);
        }

        let ids: Vec<String> = self.inner.instances.read().keys().cloned().collect();
        for id in ids {
            let _ = self.stop_strategy(&id);
        }
        info!("strategy executor stopped");
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Load a strategy from a config, initialize it, and auto-start when
    /// asked to.
    pub fn load_strategy(&self, config: StrategyFileConfig) -> anyhow::Result<()> {
        self.load_with_origin(config, false)
    }

    fn load_with_origin(&self, config: StrategyFileConfig, managed: bool) -> anyhow::Result<()> {
        if self.inner.loads_blocked.load(Ordering::Acquire) {
            anyhow::bail!("strategy loads are blocked by resource policy");
        }
        if self.inner.instances.read().contains_key(&config.strategy_id) {
            anyhow::bail!("strategy `{}` already loaded", config.strategy_id);
        }

        let strategy = self.inner.registry.create(&config.class, &config.params)?;
        let instance = Arc::new(StrategyInstance {
            id: config.strategy_id.clone(),
            class: config.class.clone(),
            version: config.version,
            hot_reload: config.hot_reload,
            auto_start: config.auto_start,
            priority: config.priority,
            managed,
            params: RwLock::new(config.params.clone()),
            symbols: RwLock::new(config.symbols.iter().cloned().collect()),
            strategy: Mutex::new(strategy),
            running: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            last_run: Mutex::new(None),
            metrics: StrategyMetrics::default(),
        });

        // Initialize before the instance becomes visible
        {
            let ctx = self.inner.context_for(&instance);
            let mut strategy = instance.strategy.lock();
            strategy.initialize(&ctx)?;
            instance.initialized.store(true, Ordering::Release);
        }

        if let Err(err) = self.inner.broker.subscribe_market_data(&config.symbols) {
            warn!(strategy_id = %config.strategy_id, %err, "market data subscription failed");
        }

        info!(
            strategy_id = %config.strategy_id,
            class = %config.class,
            version = config.version,
            "strategy loaded"
        );
        self.inner
            .instances
            .write()
            .insert(config.strategy_id.clone(), Arc::clone(&instance));

        if config.auto_start {
            self.start_strategy(&config.strategy_id)?;
        }
        Ok(())
    }

    /// Start a loaded strategy. Idempotent.
    pub fn start_strategy(&self, strategy_id: &str) -> anyhow::Result<()> {
        let instance = self.inner.instance(strategy_id)?;
        if instance.is_running() {
            return Ok(());
        }

        let ctx = self.inner.context_for(&instance);
        {
            let mut strategy = instance.strategy.lock();
            if !instance.is_initialized() {
                strategy.initialize(&ctx)?;
                instance.initialized.store(true, Ordering::Release);
            }
            strategy.start(&ctx)?;
        }
        instance.running.store(true, Ordering::Release);
        info!(strategy_id, "strategy started");
        Ok(())
    }

    /// Stop a running strategy; waits for its in-flight callback. Idempotent.
    pub fn stop_strategy(&self, strategy_id: &str) -> anyhow::Result<()> {
        let instance = self.inner.instance(strategy_id)?;
        if !instance.is_running() {
            return Ok(());
        }

        // Taking the mutex lets any in-flight run finish first
        let ctx = self.inner.context_for(&instance);
        {
            let mut strategy = instance.strategy.lock();
            instance.running.store(false, Ordering::Release);
            if let Err(err) = strategy.stop(&ctx) {
                warn!(strategy_id, %err, "strategy stop callback failed");
            }
        }
        info!(strategy_id, "strategy stopped");
        Ok(())
    }

    /// Stop, drop, and unsubscribe a strategy's symbols (those no other
    /// strategy needs).
    pub fn unload_strategy(&self, strategy_id: &str) -> anyhow::Result<()> {
        let _ = self.stop_strategy(strategy_id);
        let Some(instance) = self.inner.instances.write().remove(strategy_id) else {
            anyhow::bail!("strategy `{}` not loaded", strategy_id);
        };

        let orphaned: Vec<String> = {
            let instances = self.inner.instances.read();
            let still_needed: HashSet<String> = instances
                .values()
                .flat_map(|i| i.symbols.read().iter().cloned().collect::<Vec<_>>())
                .collect();
            instance
                .symbols
                .read()
                .iter()
                .filter(|s| !still_needed.contains(*s))
                .cloned()
                .collect()
        };
        if !orphaned.is_empty() {
            if let Err(err) = self.inner.broker.unsubscribe_market_data(&orphaned) {
                debug!(%err, "market data unsubscribe failed");
            }
        }
        info!(strategy_id, "strategy unloaded");
        Ok(())
    }

    /// Replace a running strategy with a new version of itself. The old
    /// instance finishes its in-flight callback, the new one starts if the
    /// old one was running. Positions are untouched.
    pub fn reload_strategy(&self, config: StrategyFileConfig) -> anyhow::Result<()> {
        let strategy_id = config.strategy_id.clone();
        let (was_running, managed) = self
            .inner
            .instances
            .read()
            .get(&strategy_id)
            .map_or((false, false), |i| (i.is_running(), i.managed));

        info!(
            strategy_id = %strategy_id,
            version = config.version,
            "hot-reloading strategy"
        );
        self.unload_strategy(&strategy_id)?;

        let mut config = config;
        let auto_start = was_running || config.auto_start;
        config.auto_start = auto_start;
        self.load_with_origin(config, managed)
    }

    /// Update a strategy's params in place.
    pub fn update_strategy_params(
        &self,
        strategy_id: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<()> {
        let instance = self.inner.instance(strategy_id)?;
        *instance.params.write() = params.clone();
        let ctx = self.inner.context_for(&instance);
        let mut strategy = instance.strategy.lock();
        strategy.on_params_update(&ctx, &params)
    }

    pub fn get_strategy_status(&self, strategy_id: &str) -> Option<StrategyStatus> {
        let instances = self.inner.instances.read();
        instances.get(strategy_id).map(|i| status_of(i))
    }

    pub fn get_all_strategies(&self) -> Vec<StrategyStatus> {
        let mut statuses: Vec<StrategyStatus> = self
            .inner
            .instances
            .read()
            .values()
            .map(|i| status_of(i))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Scan the config directory once, applying loads, hot reloads and
    /// removals. Also called by the periodic scanner.
    pub fn scan_configs(&self) {
        let dir = &self.inner.config.strategies_dir;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "strategies directory unreadable");
                return;
            }
        };

        let mut configs: HashMap<String, StrategyFileConfig> = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<StrategyFileConfig>(&raw).map_err(Into::into))
            {
                Ok(config) => {
                    configs.insert(config.strategy_id.clone(), config);
                }
                Err(err) => warn!(path = %path.display(), %err, "bad strategy config, skipped"),
            }
        }

        let loaded: HashMap<String, (u32, bool)> = self
            .inner
            .instances
            .read()
            .iter()
            .map(|(id, i)| (id.clone(), (i.version, i.managed)))
            .collect();

        // New configs
        for (id, config) in &configs {
            if !loaded.contains_key(id) {
                if let Err(err) = self.load_with_origin(config.clone(), true) {
                    warn!(strategy_id = %id, %err, "strategy load failed");
                }
            }
        }

        // Version bumps with hot reload enabled
        for (id, config) in &configs {
            if let Some((version, _)) = loaded.get(id) {
                if config.version > *version && config.hot_reload {
                    if let Err(err) = self.reload_strategy(config.clone()) {
                        warn!(strategy_id = %id, %err, "strategy reload failed");
                    }
                }
            }
        }

        // Configs that vanished unload their (scanner-managed) strategies
        for (id, (_, managed)) in &loaded {
            if *managed && !configs.contains_key(id) {
                if let Err(err) = self.unload_strategy(id) {
                    warn!(strategy_id = %id, %err, "strategy unload failed");
                }
            }
        }
    }

    /// Whether new loads are currently refused by resource policy.
    pub fn loads_blocked(&self) -> bool {
        self.inner.loads_blocked.load(Ordering::Acquire)
    }
}

fn status_of(instance: &Arc<StrategyInstance>) -> StrategyStatus {
    let mut symbols: Vec<String> = instance.symbols.read().iter().cloned().collect();
    symbols.sort();
    StrategyStatus {
        id: instance.id.clone(),
        class: instance.class.clone(),
        version: instance.version,
        running: instance.is_running(),
        initialized: instance.is_initialized(),
        symbols,
        auto_start: instance.auto_start,
        metrics: instance.metrics_snapshot(),
    }
}

impl Inner {
    fn instance(&self, strategy_id: &str) -> anyhow::Result<Arc<StrategyInstance>> {
        self.instances
            .read()
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("strategy `{}` not loaded", strategy_id))
    }

    fn context_for(&self, instance: &Arc<StrategyInstance>) -> StrategyContext {
        StrategyContext {
            strategy_id: instance.id.clone(),
            params: instance.params.read().clone(),
            orders: self.orders.clone(),
            positions: self.positions.clone(),
            account: self.account.clone(),
            broker: Arc::clone(&self.broker),
            bus: self.bus.clone(),
        }
    }

    fn running_instances(&self) -> Vec<Arc<StrategyInstance>> {
        self.instances
            .read()
            .values()
            .filter(|i| i.is_running())
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Event fan-out
    // ------------------------------------------------------------------

    fn handle_event(self: &Arc<Self>, event: &Event) {
        match &event.event_type {
            EventType::MarketTick => {
                let Some(quote) = quote_from(event) else { return };
                for instance in self.running_instances() {
                    if instance.subscribes_to(Some(&quote.symbol)) {
                        self.invoke(&instance, "on_tick", |s, ctx| s.on_tick(ctx, &quote));
                    }
                }
            }
            EventType::MarketBar => {
                let Some(bar) = bar_from(event) else { return };
                for instance in self.running_instances() {
                    if instance.subscribes_to(Some(&bar.symbol)) {
                        self.invoke(&instance, "on_bar", |s, ctx| s.on_bar(ctx, &bar));
                    }
                }
            }
            EventType::TradeFill => {
                let Some(trade) = trade_from(event) else { return };
                // Fills go to the originating strategy only
                if let Some(instance) = self.instances.read().get(&trade.strategy_id).cloned() {
                    if instance.is_running() {
                        self.invoke(&instance, "on_trade", |s, ctx| s.on_trade(ctx, &trade));
                    }
                }
            }
            EventType::OrderUpdate => {
                let Some(client_id) = event
                    .str_field("client_order_id")
                    .and_then(ClientOrderId::from_hex)
                else {
                    return;
                };
                let Some(order) = self.orders.get_order(client_id) else {
                    return;
                };
                if let Some(instance) = self.instances.read().get(&order.strategy_id).cloned() {
                    if instance.is_running() {
                        self.invoke(&instance, "on_order_update", |s, ctx| {
                            s.on_order_update(ctx, &order)
                        });
                    }
                }
            }
            EventType::PositionChange => {
                let Some(symbol) = event.str_field("symbol").map(str::to_owned) else {
                    return;
                };
                let Some(side) = event.str_field("side").and_then(parse_side) else {
                    return;
                };
                // The book may have archived the position already; rebuild
                // the view from the event payload
                let position = self
                    .positions
                    .get_position(&symbol, side)
                    .unwrap_or_else(|| position_from(event, &symbol, side));
                for instance in self.running_instances() {
                    if instance.subscribes_to(Some(&symbol)) {
                        self.invoke(&instance, "on_position_change", |s, ctx| {
                            s.on_position_change(ctx, &position)
                        });
                    }
                }
            }
            EventType::AccountChange => {
                let Some(account_id) = event.str_field("account_id") else {
                    return;
                };
                let Some(info) = self.account.get_account_info(account_id) else {
                    return;
                };
                for instance in self.running_instances() {
                    self.invoke(&instance, "on_account_change", |s, ctx| {
                        s.on_account_change(ctx, &info)
                    });
                }
            }
            _ => {}
        }
    }

    /// Run one callback under the strategy's mutex with full isolation.
    fn invoke(
        self: &Arc<Self>,
        instance: &Arc<StrategyInstance>,
        callback: &str,
        f: impl FnOnce(&mut dyn Strategy, &StrategyContext) -> anyhow::Result<()>,
    ) {
        let ctx = self.context_for(instance);
        let mut strategy = instance.strategy.lock();
        if !instance.is_running() {
            return;
        }
        instance.metrics.callbacks.fetch_add(1, Ordering::Relaxed);

        let outcome = catch_unwind(AssertUnwindSafe(|| f(strategy.as_mut(), &ctx)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(panic_text(&panic)),
        };

        if let Some(message) = failure {
            instance.metrics.errors.fetch_add(1, Ordering::Relaxed);
            *instance.metrics.last_error.lock() = Some(message.clone());
            error!(
                strategy_id = %instance.id,
                callback,
                %message,
                "strategy callback failed"
            );

            if self.config.auto_stop_on_errors
                && instance.error_rate(self.config.min_error_samples) > self.config.max_error_rate
            {
                warn!(strategy_id = %instance.id, "error rate exceeded, auto-stopping strategy");
                instance.running.store(false, Ordering::Release);
                if let Err(err) = strategy.stop(&ctx) {
                    warn!(strategy_id = %instance.id, %err, "stop callback failed during auto-stop");
                }
                let event = self
                    .bus
                    .acquire_event(
                        EventType::Custom("strategy.auto_stopped".into()),
                        "strategy_executor",
                    )
                    .with_field("strategy_id", instance.id.clone())
                    .with_priority(2);
                self.bus.publish(event);
            }
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    /// Main timer: `on_timer` then `run` for every running strategy, each
    /// on its own short-lived task so slow strategies do not delay fast
    /// ones.
    fn timer_loop(self: Arc<Self>) {
        while crate::utils::interruptible_sleep(&self.running, self.config.timer_interval) {
            let instances = self.running_instances();
            std::thread::scope(|scope| {
                for instance in &instances {
                    scope.spawn(|| {
                        let started = Instant::now();
                        self.invoke(instance, "on_timer", |s, ctx| s.on_timer(ctx));
                        self.invoke(instance, "run", |s, ctx| s.run(ctx));
                        instance.metrics.runs.fetch_add(1, Ordering::Relaxed);
                        instance
                            .metrics
                            .total_run_nanos
                            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
                        *instance.last_run.lock() = Some(Instant::now());
                    });
                }
            });
        }
    }

    fn scan_loop(self: Arc<Self>) {
        let executor = StrategyExecutor {
            inner: Arc::clone(&self),
        };
        while crate::utils::interruptible_sleep(&self.running, self.config.scan_interval) {
            executor.scan_configs();
        }
    }

    fn resource_loop(self: Arc<Self>) {
        let mut sampler = CpuSampler::new();
        while crate::utils::interruptible_sleep(&self.running, self.config.resource.sample_interval)
        {
            let Some(usage) = sampler.sample() else { continue };

            let over = usage.cpu_pct > self.config.resource.max_cpu_pct
                || usage.rss_mb > self.config.resource.max_rss_mb;
            if !over {
                self.loads_blocked.store(false, Ordering::Release);
                continue;
            }

            warn!(
                cpu_pct = usage.cpu_pct,
                rss_mb = usage.rss_mb,
                policy = ?self.config.resource.policy,
                "resource thresholds exceeded"
            );
            let executor = StrategyExecutor {
                inner: Arc::clone(&self),
            };
            match self.config.resource.policy {
                ResourcePolicy::WarnOnly => {}
                ResourcePolicy::BlockNewLoads => {
                    self.loads_blocked.store(true, Ordering::Release);
                }
                ResourcePolicy::StopLowestPriority => {
                    let victim = self
                        .running_instances()
                        .into_iter()
                        .min_by_key(|i| i.priority)
                        .map(|i| i.id.clone());
                    if let Some(id) = victim {
                        warn!(strategy_id = %id, "stopping lowest-priority strategy");
                        let _ = executor.stop_strategy(&id);
                    }
                }
                ResourcePolicy::StopAll => {
                    for instance in self.running_instances() {
                        let _ = executor.stop_strategy(&instance.id);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Event payload parsing
// ----------------------------------------------------------------------

fn parse_decimal(event: &Event, key: &str) -> Option<Decimal> {
    match event.payload.get(key)? {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        _ => None,
    }
}

fn parse_side(s: &str) -> Option<PositionSide> {
    match s {
        "LONG" => Some(PositionSide::Long),
        "SHORT" => Some(PositionSide::Short),
        _ => None,
    }
}

fn parse_direction(s: &str) -> Option<Direction> {
    match s {
        "BUY" => Some(Direction::Buy),
        "SELL" => Some(Direction::Sell),
        _ => None,
    }
}

fn parse_offset(s: &str) -> Option<Offset> {
    match s {
        "OPEN" => Some(Offset::Open),
        "CLOSE" => Some(Offset::Close),
        "CLOSE_TODAY" => Some(Offset::CloseToday),
        "CLOSE_YESTERDAY" => Some(Offset::CloseYesterday),
        _ => None,
    }
}

fn quote_from(event: &Event) -> Option<MarketQuote> {
    let symbol = event.str_field("symbol")?.to_string();
    let last_price = parse_decimal(event, "price")?;
    Some(MarketQuote {
        symbol,
        last_price,
        bid: parse_decimal(event, "bid").unwrap_or(last_price),
        ask: parse_decimal(event, "ask").unwrap_or(last_price),
        volume: event.f64_field("volume").unwrap_or(0.0),
        turnover: event.f64_field("turnover").unwrap_or(0.0),
        timestamp: event.timestamp,
    })
}

fn bar_from(event: &Event) -> Option<Bar> {
    Some(Bar {
        symbol: event.str_field("symbol")?.to_string(),
        open: parse_decimal(event, "open")?,
        high: parse_decimal(event, "high")?,
        low: parse_decimal(event, "low")?,
        close: parse_decimal(event, "close")?,
        volume: event.f64_field("volume").unwrap_or(0.0),
    })
}

fn trade_from(event: &Event) -> Option<Trade> {
    Some(Trade {
        client_order_id: ClientOrderId::from_hex(event.str_field("client_order_id")?)?,
        order_id: event.str_field("order_id")?.to_string(),
        strategy_id: event.str_field("strategy_id")?.to_string(),
        symbol: event.str_field("symbol")?.to_string(),
        direction: parse_direction(event.str_field("direction")?)?,
        offset: parse_offset(event.str_field("offset")?)?,
        price: parse_decimal(event, "price")?,
        volume: event.u64_field("volume")?,
        commission: parse_decimal(event, "commission").unwrap_or_default(),
        executed_at: event.timestamp,
        trace_id: event.trace_id,
    })
}

fn position_from(event: &Event, symbol: &str, side: PositionSide) -> crate::position::Position {
    let mut position = crate::position::Position::open(symbol, side, None);
    position.volume = event.u64_field("volume").unwrap_or(0);
    position.avg_cost = parse_decimal(event, "avg_cost").unwrap_or_default();
    position.float_pnl = parse_decimal(event, "float_pnl").unwrap_or_default();
    position.realized_pnl = parse_decimal(event, "realized_pnl").unwrap_or_default();
    position.updated_at = event.timestamp;
    position
}

fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<opaque panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::event::EventBusConfig;
    use crate::order::OrderManagerConfig;
    use crate::position::PositionManagerConfig;
    use crate::resilience::KillSwitch;
    use crate::account::AccountManagerConfig;

    struct Probe {
        log: Arc<Mutex<Vec<String>>>,
        fail_ticks: bool,
    }

    impl Strategy for Probe {
        fn initialize(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
            self.log.lock().push("initialize".into());
            Ok(())
        }
        fn start(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
            self.log.lock().push("start".into());
            Ok(())
        }
        fn stop(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
            self.log.lock().push("stop".into());
            Ok(())
        }
        fn on_tick(&mut self, _ctx: &StrategyContext, quote: &MarketQuote) -> anyhow::Result<()> {
            if self.fail_ticks {
                anyhow::bail!("tick handler bug");
            }
            self.log.lock().push(format!("tick:{}", quote.symbol));
            Ok(())
        }
        fn on_timer(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
            self.log.lock().push("timer".into());
            Ok(())
        }
        fn run(&mut self, _ctx: &StrategyContext) -> anyhow::Result<()> {
            self.log.lock().push("run".into());
            Ok(())
        }
    }

    struct Harness {
        executor: StrategyExecutor,
        broker: Arc<SimBroker>,
        bus: EventBus,
        registry: StrategyRegistry,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        harness_in(dir)
    }

    fn harness_in(dir: tempfile::TempDir) -> Harness {
        let broker = Arc::new(SimBroker::new());
        broker.connect().unwrap();
        let bus = EventBus::new(EventBusConfig {
            shard_count: 1,
            io_workers: 1,
            cpu_workers: 1,
            ..Default::default()
        });
        let orders = OrderManager::new(
            OrderManagerConfig::default(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
            KillSwitch::new(),
        );
        let positions = PositionManager::new(
            PositionManagerConfig::default(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
            orders.clone(),
        );
        let account = AccountManager::new(
            AccountManagerConfig::default(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
        );
        let registry = StrategyRegistry::new();
        let executor = StrategyExecutor::new(
            ExecutorConfig {
                timer_interval: Duration::from_millis(50),
                scan_interval: Duration::from_millis(100),
                strategies_dir: dir.path().to_path_buf(),
                min_error_samples: 4,
                max_error_rate: 0.3,
                ..Default::default()
            },
            registry.clone(),
            orders,
            positions,
            account,
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
        );
        Harness {
            executor,
            broker,
            bus,
            registry,
            _dir: dir,
        }
    }

    fn register_probe(
        registry: &StrategyRegistry,
        name: &str,
        fail_ticks: bool,
    ) -> Arc<Mutex<Vec<String>>> {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        registry.register(name, move |_params| {
            Ok(Box::new(Probe {
                log: Arc::clone(&shared),
                fail_ticks,
            }) as Box<dyn Strategy>)
        });
        log
    }

    fn config(id: &str, class: &str, symbols: &[&str]) -> StrategyFileConfig {
        StrategyFileConfig {
            strategy_id: id.into(),
            class: class.into(),
            params: serde_json::json!({}),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            auto_start: true,
            version: 1,
            hot_reload: false,
            priority: 0,
        }
    }

    fn wait_for(log: &Arc<Mutex<Vec<String>>>, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !log.lock().iter().any(|e| e.contains(needle)) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", needle);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_load_initialize_start_cycle() {
        let h = harness();
        let log = register_probe(&h.registry, "probe", false);
        h.executor.load_strategy(config("s1", "probe", &["rb2405"])).unwrap();

        assert_eq!(log.lock().as_slice(), &["initialize", "start"]);
        let status = h.executor.get_strategy_status("s1").unwrap();
        assert!(status.running);
        assert!(status.initialized);
        assert_eq!(h.broker.subscribed_symbols().len(), 1);
    }

    #[test]
    fn test_tick_fanout_respects_subscriptions() {
        let h = harness();
        let log_a = register_probe(&h.registry, "probe_a", false);
        let log_b = register_probe(&h.registry, "probe_b", false);
        h.executor.load_strategy(config("a", "probe_a", &["rb2405"])).unwrap();
        h.executor.load_strategy(config("b", "probe_b", &["cu2406"])).unwrap();
        h.executor.start();
        h.bus.start();

        let tick = Event::new(EventType::MarketTick, "feed")
            .with_field("symbol", "rb2405")
            .with_field("price", 3500.0);
        h.bus.publish(tick);

        wait_for(&log_a, "tick:rb2405");
        assert!(!log_b.lock().iter().any(|e| e.starts_with("tick")));

        h.executor.stop();
        h.bus.stop();
    }

    #[test]
    fn test_timer_drives_on_timer_then_run() {
        let h = harness();
        let log = register_probe(&h.registry, "probe", false);
        h.executor.load_strategy(config("s1", "probe", &["rb2405"])).unwrap();
        h.executor.start();

        wait_for(&log, "run");
        let entries = log.lock().clone();
        let timer_idx = entries.iter().position(|e| e == "timer").unwrap();
        let run_idx = entries.iter().position(|e| e == "run").unwrap();
        assert!(timer_idx < run_idx);

        h.executor.stop();
        let status = h.executor.get_strategy_status("s1").unwrap();
        assert!(!status.running);
        assert!(status.metrics.runs >= 1);
    }

    #[test]
    fn test_stop_strategy_invokes_stop_callback() {
        let h = harness();
        let log = register_probe(&h.registry, "probe", false);
        h.executor.load_strategy(config("s1", "probe", &["rb2405"])).unwrap();
        h.executor.stop_strategy("s1").unwrap();
        assert!(log.lock().contains(&"stop".to_string()));
        // Idempotent
        h.executor.stop_strategy("s1").unwrap();
    }

    #[test]
    fn test_failing_strategy_auto_stops_and_spares_others() {
        let h = harness();
        let log_bad = register_probe(&h.registry, "bad", true);
        let log_good = register_probe(&h.registry, "good", false);
        h.executor.load_strategy(config("bad", "bad", &["rb2405"])).unwrap();
        h.executor.load_strategy(config("good", "good", &["rb2405"])).unwrap();
        h.executor.start();
        h.bus.start();

        for _ in 0..8 {
            let tick = Event::new(EventType::MarketTick, "feed")
                .with_field("symbol", "rb2405")
                .with_field("price", 3500.0);
            h.bus.publish(tick);
            std::thread::sleep(Duration::from_millis(20));
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while h.executor.get_strategy_status("bad").unwrap().running {
            assert!(Instant::now() < deadline, "bad strategy never auto-stopped");
            let tick = Event::new(EventType::MarketTick, "feed")
                .with_field("symbol", "rb2405")
                .with_field("price", 3500.0);
            h.bus.publish(tick);
            std::thread::sleep(Duration::from_millis(20));
        }

        // The healthy strategy keeps running and received ticks
        assert!(h.executor.get_strategy_status("good").unwrap().running);
        wait_for(&log_good, "tick:rb2405");
        assert!(h.executor.get_strategy_status("bad").unwrap().metrics.errors > 0);
        let _ = log_bad;

        h.executor.stop();
        h.bus.stop();
    }

    #[test]
    fn test_scan_loads_and_unloads_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        let h = harness_in(dir);
        register_probe(&h.registry, "probe", false);

        std::fs::write(
            &path,
            serde_json::to_string(&config("s1", "probe", &["rb2405"])).unwrap(),
        )
        .unwrap();
        h.executor.scan_configs();
        assert!(h.executor.get_strategy_status("s1").is_some());

        std::fs::remove_file(&path).unwrap();
        h.executor.scan_configs();
        assert!(h.executor.get_strategy_status("s1").is_none());
    }

    #[test]
    fn test_hot_reload_on_version_bump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        let h = harness_in(dir);
        let log = register_probe(&h.registry, "probe", false);

        let mut cfg = config("s1", "probe", &["rb2405"]);
        cfg.hot_reload = true;
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        h.executor.scan_configs();
        assert_eq!(h.executor.get_strategy_status("s1").unwrap().version, 1);

        cfg.version = 2;
        cfg.params = serde_json::json!({"spread": 5});
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        h.executor.scan_configs();

        let status = h.executor.get_strategy_status("s1").unwrap();
        assert_eq!(status.version, 2);
        assert!(status.running);
        // Old instance stopped, new one initialized and started
        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec!["initialize", "start", "stop", "initialize", "start"]
        );
    }

    #[test]
    fn test_reload_without_flag_keeps_old_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        let h = harness_in(dir);
        register_probe(&h.registry, "probe", false);

        let mut cfg = config("s1", "probe", &["rb2405"]);
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        h.executor.scan_configs();

        cfg.version = 2;
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        h.executor.scan_configs();
        assert_eq!(h.executor.get_strategy_status("s1").unwrap().version, 1);
    }

    #[test]
    fn test_unknown_class_fails_load() {
        let h = harness();
        let err = h
            .executor
            .load_strategy(config("s1", "ghost", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_update_params_reaches_strategy() {
        let h = harness();
        register_probe(&h.registry, "probe", false);
        h.executor.load_strategy(config("s1", "probe", &["rb2405"])).unwrap();
        h.executor
            .update_strategy_params("s1", serde_json::json!({"x": 1}))
            .unwrap();
        // Params visible in the next context
        let instance = h.executor.inner.instance("s1").unwrap();
        assert_eq!(instance.params.read()["x"], 1);
    }
}

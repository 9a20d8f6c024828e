//! Test support: builders and a full-stack harness
//!
//! Used by the integration suites in `tests/` and available to downstream
//! crates for strategy testing. The harness wires every manager against a
//! [`SimBroker`] exactly the way the binary does, minus the metrics
//! exporter.

use crate::account::{AccountManager, AccountManagerConfig};
use crate::broker::{AccountInfo, BrokerAdapter, SimBroker};
use crate::core::{ClientOrderId, Direction, Offset, TraceId};
use crate::event::{EventBus, EventBusConfig};
use crate::order::{OrderManager, OrderManagerConfig, Trade};
use crate::position::{PositionManager, PositionManagerConfig};
use crate::resilience::KillSwitch;
use crate::risk::{RiskManager, RiskManagerConfig};
use crate::strategy::{ExecutorConfig, StrategyExecutor, StrategyRegistry};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A fully wired control plane over a [`SimBroker`].
pub struct TradingHarness {
    pub broker: Arc<SimBroker>,
    pub bus: EventBus,
    pub kill_switch: KillSwitch,
    pub account: AccountManager,
    pub risk: RiskManager,
    pub orders: OrderManager,
    pub positions: PositionManager,
    pub executor: StrategyExecutor,
    pub registry: StrategyRegistry,
}

impl TradingHarness {
    /// Build the stack with fast test intervals. The broker starts
    /// connected with a funded account.
    pub fn new() -> Self {
        Self::with_configs(
            OrderManagerConfig {
                track_interval: Duration::from_millis(100),
                retry_interval: Duration::from_millis(20),
                ..Default::default()
            },
            RiskManagerConfig::default(),
        )
    }

    pub fn with_configs(
        order_config: OrderManagerConfig,
        risk_config: RiskManagerConfig,
    ) -> Self {
        let broker = Arc::new(SimBroker::new());
        broker.connect().expect("sim broker connect");
        broker.set_account(AccountInfo {
            balance: Decimal::from(1_000_000u64),
            available: Decimal::from(1_000_000u64),
            ..AccountInfo::empty("sim-account")
        });

        let bus = EventBus::new(EventBusConfig {
            shard_count: 2,
            io_workers: 2,
            cpu_workers: 2,
            ..Default::default()
        });
        let kill_switch = KillSwitch::new();

        let account = AccountManager::new(
            AccountManagerConfig {
                refresh_interval: Duration::from_millis(200),
                ..Default::default()
            },
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
        );
        account.refresh();

        let risk = RiskManager::new(risk_config, bus.clone());
        risk.set_broker(broker.clone() as Arc<dyn BrokerAdapter>);

        let orders = OrderManager::new(
            order_config,
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
            kill_switch.clone(),
        );
        orders.set_risk_manager(Arc::new(risk.clone()));
        orders.set_account_manager(account.clone());

        let positions = PositionManager::new(
            PositionManagerConfig {
                update_interval: Duration::from_millis(200),
                ..Default::default()
            },
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
            orders.clone(),
        );
        positions.set_account_manager(account.clone());

        let registry = StrategyRegistry::new();
        let executor = StrategyExecutor::new(
            ExecutorConfig {
                timer_interval: Duration::from_millis(100),
                scan_interval: Duration::from_secs(3600),
                strategies_dir: std::env::temp_dir().join("tarn-harness-none"),
                ..Default::default()
            },
            registry.clone(),
            orders.clone(),
            positions.clone(),
            account.clone(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus.clone(),
        );

        Self {
            broker,
            bus,
            kill_switch,
            account,
            risk,
            orders,
            positions,
            executor,
            registry,
        }
    }

    /// Start the bus and every manager loop.
    pub fn start(&self) {
        self.bus.start();
        self.account.start();
        self.orders.start();
        self.positions.start();
    }

    /// Stop everything, bus last so in-flight events drain.
    pub fn stop(&self) {
        self.executor.stop();
        self.positions.stop();
        self.orders.stop();
        self.account.stop();
        self.bus.stop();
    }
}

impl Default for TradingHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a trade for direct position-manager tests.
pub fn make_trade(
    symbol: &str,
    direction: Direction,
    offset: Offset,
    price: Decimal,
    volume: u64,
    strategy_id: &str,
) -> Trade {
    Trade {
        client_order_id: ClientOrderId::generate(),
        order_id: "SIM-test".into(),
        strategy_id: strategy_id.into(),
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

/// Poll until `cond` holds or the timeout elapses; panics on timeout.
pub fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

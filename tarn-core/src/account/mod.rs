//! Account manager
//!
//! Thin cache over broker account snapshots. The broker stays
//! authoritative: this manager refreshes on broker pushes and on an
//! internal interval, answers margin questions for order admission, and
//! fans out account-change events.

use crate::broker::{AccountInfo, BrokerAdapter};
use crate::event::{EventBus, EventType};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Listener invoked with each refreshed snapshot.
pub type AccountListener = Arc<dyn Fn(&AccountInfo) + Send + Sync>;

/// Account manager configuration.
#[derive(Debug, Clone)]
pub struct AccountManagerConfig {
    /// Interval between broker refreshes
    pub refresh_interval: Duration,
    /// Margin required per lot by symbol; used by `can_open_position`
    pub margin_per_lot: HashMap<String, Decimal>,
    /// Fallback margin rate (fraction of notional) for unknown symbols
    pub default_margin_rate: Decimal,
}

impl Default for AccountManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            margin_per_lot: HashMap::new(),
            default_margin_rate: Decimal::new(1, 1), // 0.1
        }
    }
}

/// The manager. Cloning shares state.
#[derive(Clone)]
pub struct AccountManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: AccountManagerConfig,
    broker: Arc<dyn BrokerAdapter>,
    bus: EventBus,
    /// Latest snapshot per account id
    accounts: RwLock<HashMap<String, AccountInfo>>,
    listeners: RwLock<Vec<AccountListener>>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AccountManager {
    pub fn new(
        config: AccountManagerConfig,
        broker: Arc<dyn BrokerAdapter>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                broker,
                bus,
                accounts: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Start the refresh loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        // Prime the cache before the loop takes over
        self.refresh();

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("tarn-account".into())
            .spawn(move || {
                while crate::utils::interruptible_sleep(
                    &inner.running,
                    inner.config.refresh_interval,
                ) {
                    Inner::refresh(&inner);
                }
            })
            .expect("failed to spawn account refresh loop");
        *self.inner.worker.lock() = Some(handle);
        info!("account manager started");
    }

    /// Stop the refresh loop. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
        info!("account manager stopped");
    }

    /// Force a refresh from the broker now (also called on broker pushes
    /// and after reconnection).
    pub fn refresh(&self) {
        Inner::refresh(&self.inner);
    }

    /// Latest snapshot for an account id, if any.
    pub fn get_account_info(&self, account_id: &str) -> Option<AccountInfo> {
        self.inner.accounts.read().get(account_id).cloned()
    }

    /// Latest snapshot of the sole account, for single-account setups.
    pub fn primary_account(&self) -> Option<AccountInfo> {
        self.inner.accounts.read().values().next().cloned()
    }

    /// Whether available balance covers the margin for a prospective open.
    ///
    /// Margin = configured per-lot margin for the symbol, or
    /// `price * default_margin_rate` per lot when the symbol is unknown.
    pub fn can_open_position(&self, symbol: &str, volume: u64, price: Decimal) -> bool {
        let required = self.required_margin(symbol, volume, price);
        let accounts = self.inner.accounts.read();
        match accounts.values().next() {
            Some(account) => account.available >= required,
            None => {
                warn!("no account snapshot cached; refusing open");
                false
            }
        }
    }

    /// Margin requirement for a prospective open.
    pub fn required_margin(&self, symbol: &str, volume: u64, price: Decimal) -> Decimal {
        match self.inner.config.margin_per_lot.get(symbol) {
            Some(per_lot) => *per_lot * Decimal::from(volume),
            None => price * Decimal::from(volume) * self.inner.config.default_margin_rate,
        }
    }

    pub fn add_listener(&self, listener: AccountListener) {
        self.inner.listeners.write().push(listener);
    }
}

impl Inner {
    fn refresh(inner: &Arc<Inner>) {
        let info = match inner.broker.get_account_info() {
            Ok(info) => info,
            Err(err) => {
                debug!(%err, "account refresh failed");
                return;
            }
        };

        let changed = {
            let mut accounts = inner.accounts.write();
            let prior = accounts.insert(info.account_id.clone(), info.clone());
            match prior {
                Some(prior) => {
                    prior.balance != info.balance
                        || prior.available != info.available
                        || prior.margin != info.margin
                }
                None => true,
            }
        };

        if !changed {
            return;
        }

        for listener in inner.listeners.read().iter() {
            listener(&info);
        }

        let event = inner
            .bus
            .acquire_event(EventType::AccountChange, "account_manager")
            .with_field("account_id", info.account_id.clone())
            .with_field("balance", info.balance.to_string())
            .with_field("available", info.available.to_string())
            .with_field("margin", info.margin.to_string())
            .with_field("risk_ratio", info.risk_ratio);
        inner.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::event::EventBusConfig;
    use rust_decimal_macros::dec;

    fn setup() -> (AccountManager, Arc<SimBroker>) {
        let broker = Arc::new(SimBroker::new());
        broker.connect().unwrap();
        let bus = EventBus::new(EventBusConfig::default());
        let manager = AccountManager::new(
            AccountManagerConfig::default(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus,
        );
        (manager, broker)
    }

    fn account(balance: Decimal, available: Decimal) -> AccountInfo {
        AccountInfo {
            balance,
            available,
            ..AccountInfo::empty("sim-account")
        }
    }

    #[test]
    fn test_refresh_caches_snapshot() {
        let (manager, broker) = setup();
        broker.set_account(account(dec!(100000), dec!(80000)));
        manager.refresh();

        let cached = manager.get_account_info("sim-account").unwrap();
        assert_eq!(cached.balance, dec!(100000));
        assert_eq!(cached.available, dec!(80000));
    }

    #[test]
    fn test_can_open_position_uses_margin_table() {
        let (_, broker) = setup();
        broker.set_account(account(dec!(100000), dec!(10000)));

        let mut margin_per_lot = HashMap::new();
        margin_per_lot.insert("rb2405".to_string(), dec!(4000));
        let bus = EventBus::new(EventBusConfig::default());
        let manager = AccountManager::new(
            AccountManagerConfig {
                margin_per_lot,
                ..Default::default()
            },
            broker.clone() as Arc<dyn BrokerAdapter>,
            bus,
        );
        manager.refresh();

        // 2 lots x 4000 = 8000 <= 10000
        assert!(manager.can_open_position("rb2405", 2, dec!(3500)));
        // 3 lots x 4000 = 12000 > 10000
        assert!(!manager.can_open_position("rb2405", 3, dec!(3500)));
    }

    #[test]
    fn test_default_margin_rate_for_unknown_symbol() {
        let (manager, broker) = setup();
        broker.set_account(account(dec!(100000), dec!(10000)));
        manager.refresh();

        // 10 lots x 3500 x 0.1 = 3500 <= 10000
        assert!(manager.can_open_position("cu2406", 10, dec!(3500)));
        // 40 lots x 3500 x 0.1 = 14000 > 10000
        assert!(!manager.can_open_position("cu2406", 40, dec!(3500)));
    }

    #[test]
    fn test_no_snapshot_refuses_open() {
        let (manager, _) = setup();
        assert!(!manager.can_open_position("rb2405", 1, dec!(3500)));
    }

    #[test]
    fn test_listener_fires_on_change_only() {
        let (manager, broker) = setup();
        let hits = Arc::new(std::sync::atomic::AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            manager.add_listener(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }

        broker.set_account(account(dec!(1000), dec!(1000)));
        manager.refresh();
        manager.refresh(); // identical snapshot, no notification
        broker.set_account(account(dec!(2000), dec!(2000)));
        manager.refresh();

        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}

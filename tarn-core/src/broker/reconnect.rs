//! Automatic broker reconnection
//!
//! A monitor thread watches the adapter's connection state; when it sees
//! `Disconnected` or `Error` it drives reconnect attempts through the shared
//! backoff machinery. Success resets the backoff; exhausting a bounded
//! policy leaves the adapter down and logs at error level.

use super::{BrokerAdapter, ConnectionState};
use crate::resilience::{Backoff, BackoffConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry policy for the reconnect loop.
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    /// Keep trying forever
    Unbounded,
    /// Give up after this many consecutive failed attempts
    Bounded(usize),
}

impl ReconnectPolicy {
    fn backoff_config(&self) -> BackoffConfig {
        match self {
            ReconnectPolicy::Unbounded => BackoffConfig::unlimited(),
            ReconnectPolicy::Bounded(max) => BackoffConfig {
                max_retries: Some(*max),
                ..Default::default()
            },
        }
    }
}

/// Owns the reconnect monitor thread for one adapter.
pub struct Reconnector {
    broker: Arc<dyn BrokerAdapter>,
    policy: ReconnectPolicy,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Reconnector {
    pub fn new(broker: Arc<dyn BrokerAdapter>, policy: ReconnectPolicy) -> Self {
        Self {
            broker,
            policy,
            poll_interval: Duration::from_millis(500),
            running: Arc::new(AtomicBool::new(false)),
            monitor: parking_lot::Mutex::new(None),
        }
    }

    /// Start watching the connection. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let broker = Arc::clone(&self.broker);
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;
        let backoff_config = self.policy.backoff_config();

        let handle = std::thread::Builder::new()
            .name("tarn-reconnect".into())
            .spawn(move || {
                let mut backoff = Backoff::new(backoff_config.clone());

                while running.load(Ordering::Acquire) {
                    match broker.connection_state() {
                        ConnectionState::Disconnected | ConnectionState::Error => {
                            match backoff.next_delay() {
                                Some(delay) => {
                                    warn!(
                                        broker = broker.name(),
                                        attempt = backoff.attempt_number(),
                                        delay_ms = delay.as_millis() as u64,
                                        "connection lost, retrying"
                                    );
                                    if !crate::utils::interruptible_sleep(&running, delay) {
                                        break;
                                    }
                                    match broker.connect() {
                                        Ok(()) => {
                                            info!(broker = broker.name(), "reconnected");
                                            backoff.reset();
                                        }
                                        Err(err) => {
                                            warn!(broker = broker.name(), %err, "reconnect attempt failed");
                                        }
                                    }
                                }
                                None => {
                                    error!(
                                        broker = broker.name(),
                                        "reconnect retries exhausted, giving up"
                                    );
                                    break;
                                }
                            }
                        }
                        ConnectionState::Connected => {
                            backoff.reset();
                            std::thread::sleep(poll_interval);
                        }
                        // Another actor is mid-transition; just wait
                        ConnectionState::Connecting | ConnectionState::Reconnecting => {
                            std::thread::sleep(poll_interval);
                        }
                    }
                }
            })
            .expect("failed to spawn reconnect monitor");

        *self.monitor.lock() = Some(handle);
    }

    /// Stop the monitor thread. Idempotent; does not disconnect the broker.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use std::time::Instant;

    fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_reconnects_after_disconnect() {
        let broker = Arc::new(SimBroker::new());
        broker.connect().unwrap();

        let reconnector = Reconnector::new(broker.clone(), ReconnectPolicy::Unbounded);
        reconnector.start();

        broker.simulate_disconnect();
        assert!(wait_until(
            || broker.connection_state() == ConnectionState::Connected,
            Duration::from_secs(5)
        ));
        reconnector.stop();
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let broker = Arc::new(SimBroker::new());
        broker.simulate_disconnect();
        broker.inject_connect_failures(usize::MAX);

        let reconnector = Reconnector::new(broker.clone(), ReconnectPolicy::Bounded(2));
        reconnector.start();

        // Two attempts at ~500ms+1s backoff; give it time then verify still down
        std::thread::sleep(Duration::from_secs(3));
        assert_ne!(broker.connection_state(), ConnectionState::Connected);
        reconnector.stop();
    }
}

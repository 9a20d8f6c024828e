//! Circuit breaker for failure-prone paths
//!
//! Three-state breaker: Closed (normal) → Open (tripped, fail fast) →
//! HalfOpen (limited probes while testing recovery). Used at the event-bus
//! level to gate publication, inside the risk engine as a rule variant, and
//! around broker calls.
//!
//! Transition rules:
//! - Closed → Open after `failure_threshold` *consecutive* failures.
//! - Open → HalfOpen once the recovery deadline has passed.
//! - HalfOpen admits at most `half_open_max_probes` calls; a single failure
//!   reopens, `success_threshold` successes close.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Tripped, calls fail fast
    Open = 1,
    /// Testing recovery with a bounded number of probes
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u64,
    /// Time spent Open before probing
    pub recovery_timeout: Duration,
    /// Successful probes in HalfOpen required to close
    pub success_threshold: u64,
    /// Calls admitted while HalfOpen
    pub half_open_max_probes: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_probes: 3,
        }
    }
}

/// Shared-state circuit breaker; clones observe the same breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Arc<AtomicU8>,
    consecutive_failures: Arc<AtomicU64>,
    half_open_successes: Arc<AtomicU64>,
    half_open_probes: Arc<AtomicU64>,
    trip_count: Arc<AtomicU64>,
    last_failure: Arc<parking_lot::Mutex<Option<Instant>>>,
    opened_at: Arc<parking_lot::Mutex<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(BreakerState::Closed as u8)),
            consecutive_failures: Arc::new(AtomicU64::new(0)),
            half_open_successes: Arc::new(AtomicU64::new(0)),
            half_open_probes: Arc::new(AtomicU64::new(0)),
            trip_count: Arc::new(AtomicU64::new(0)),
            last_failure: Arc::new(parking_lot::Mutex::new(None)),
            opened_at: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Whether a call may proceed. Drives the Open → HalfOpen transition
    /// when the recovery deadline has passed, and meters probes in HalfOpen.
    pub fn is_call_permitted(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened = *self.opened_at.lock();
                match opened {
                    Some(at) if at.elapsed() >= self.config.recovery_timeout => {
                        self.transition_to_half_open();
                        // The caller becomes the first probe
                        self.half_open_probes.fetch_add(1, Ordering::AcqRel);
                        true
                    }
                    _ => false,
                }
            }
            BreakerState::HalfOpen => {
                let probes = self.half_open_probes.fetch_add(1, Ordering::AcqRel);
                if probes < self.config.half_open_max_probes {
                    true
                } else {
                    self.half_open_probes.fetch_sub(1, Ordering::AcqRel);
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        *self.last_failure.lock() = Some(Instant::now());

        match self.state() {
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            // A single probe failure reopens
            BreakerState::HalfOpen => self.transition_to_open(),
            BreakerState::Open => {}
        }
    }

    fn transition_to_closed(&self) {
        info!("circuit breaker closed (recovered)");
        self.state.store(BreakerState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        *self.opened_at.lock() = None;
    }

    fn transition_to_open(&self) {
        warn!(
            threshold = self.config.failure_threshold,
            "circuit breaker tripped"
        );
        self.state.store(BreakerState::Open as u8, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        self.trip_count.fetch_add(1, Ordering::AcqRel);
        *self.opened_at.lock() = Some(Instant::now());
    }

    fn transition_to_half_open(&self) {
        debug!("circuit breaker half-open, probing");
        self.state
            .store(BreakerState::HalfOpen as u8, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
    }

    pub fn state(&self) -> BreakerState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Times the breaker has tripped since construction.
    pub fn trip_count(&self) -> u64 {
        self.trip_count.load(Ordering::Acquire)
    }

    /// Force Closed, clearing counters. Operator action.
    pub fn reset(&self) {
        info!("circuit breaker manually reset");
        self.transition_to_closed();
    }

    /// Force Open. Operator action.
    pub fn force_open(&self) {
        warn!("circuit breaker manually forced open");
        self.transition_to_open();
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            consecutive_failures: Arc::clone(&self.consecutive_failures),
            half_open_successes: Arc::clone(&self.half_open_successes),
            half_open_probes: Arc::clone(&self.half_open_probes),
            trip_count: Arc::clone(&self.trip_count),
            last_failure: Arc::clone(&self.last_failure),
            opened_at: Arc::clone(&self.opened_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: u64, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            success_threshold: 2,
            half_open_max_probes: 3,
        })
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.is_call_permitted());
        assert_eq!(cb.trip_count(), 1);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_recovery_cycle() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        thread::sleep(Duration::from_millis(15));

        // First permitted call transitions to half-open and counts as a probe
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(15));
        assert!(cb.is_call_permitted());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_half_open_probe_budget() {
        let cb = breaker(1, 10);
        cb.record_failure();
        thread::sleep(Duration::from_millis(15));

        // Budget of 3 probes; the transition call consumes the first
        assert!(cb.is_call_permitted());
        assert!(cb.is_call_permitted());
        assert!(cb.is_call_permitted());
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_manual_reset_and_force_open() {
        let cb = breaker(1, 1000);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.force_open();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_clone_shares_state() {
        let cb1 = breaker(2, 1000);
        let cb2 = cb1.clone();
        cb1.record_failure();
        assert_eq!(cb2.consecutive_failures(), 1);
    }
}

//! Resilience building blocks
//!
//! Shared failure-handling machinery used across the control plane:
//! - Retry backoff (exponential and fixed-interval)
//! - Circuit breaker (bus gating, risk rules, broker calls)
//! - Kill switch (process-wide trading halt)
//! - Panic hook with structured logging

pub mod backoff;
pub mod circuit_breaker;
pub mod kill_switch;
pub mod panic;

pub use backoff::{Backoff, BackoffConfig};
pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use kill_switch::{KillSwitch, KillSwitchState};
pub use panic::install_panic_handler;

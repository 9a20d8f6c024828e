//! Domain error types for the trading control plane
//!
//! Invariant breaches get their own type because their handling policy
//! differs from ordinary failures: they are logged at critical level, emit
//! an emergency event, and latch the owning manager's halt state instead of
//! being retried or surfaced as a plain rejection.

use crate::core::types::{ClientOrderId, OrderStatus};
use rust_decimal::Decimal;
use thiserror::Error;

/// A broken invariant in order or position accounting.
///
/// These are bugs or corrupt broker data, never ordinary business failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("filled volume {filled} exceeds order volume {volume} on {client_id}")]
    FilledExceedsVolume {
        client_id: ClientOrderId,
        filled: u64,
        volume: u64,
    },

    #[error("cumulative fill report decreased from {previous} to {reported} on {client_id}")]
    FillVolumeDecreased {
        client_id: ClientOrderId,
        previous: u64,
        reported: u64,
    },

    #[error("close of {requested} lots against position holding only {held} lots of {symbol}")]
    CloseExceedsPosition {
        symbol: String,
        requested: u64,
        held: u64,
    },

    #[error("order {client_id} attempted transition out of terminal state {state}")]
    TerminalTransition {
        client_id: ClientOrderId,
        state: OrderStatus,
    },
}

/// Failures raised when loading or validating configuration.
///
/// All variants are fatal at startup (process exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required config field `{section}.{field}`")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },

    #[error("invalid value for `{section}.{field}`: {reason}")]
    InvalidValue {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Failures from the broker adapter.
///
/// `is_transient` drives retry policy: transient errors are retried with
/// backoff, permanent errors fail the operation immediately.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker call `{op}` timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("broker not connected")]
    NotConnected,

    #[error("unknown symbol `{0}`")]
    InvalidSymbol(String),

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },

    #[error("order rejected by broker: {reason}")]
    Rejected { reason: String },

    #[error("unknown order id `{0}`")]
    UnknownOrder(String),

    #[error("broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. } | BrokerError::NotConnected | BrokerError::Transport(_)
        )
    }
}

/// Failures from order-manager operations, surfaced to callers as explicit
/// results with reason codes rather than panics.
#[derive(Debug, Clone, Error)]
pub enum OrderError {
    #[error("trading is disabled")]
    TradingDisabled,

    #[error("open orders are restricted")]
    OpenRestricted,

    #[error("order volume must be positive")]
    ZeroVolume,

    #[error("rejected by risk rule `{rule_id}`: {reason}")]
    RiskRejected { rule_id: String, reason: String },

    #[error("account check failed: {reason}")]
    AccountRejected { reason: String },

    #[error("order `{0}` not found")]
    NotFound(String),

    #[error("cannot cancel order in state {state}")]
    NotCancellable { state: OrderStatus },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

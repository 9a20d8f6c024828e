//! Core identifier and enum types shared by every subsystem
//!
//! Identifiers are fixed-width integers rather than strings so they are
//! `Copy`, hashable and cheap to log. Broker-assigned ids remain `String`
//! because their format is owned by the counterparty.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-side order identifier, generated locally and unique for the
/// process lifetime.
///
/// Format: `[timestamp:64][random:32][counter:32]`. The counter is
/// thread-local, so ids generated on different threads cannot collide even
/// within one nanosecond tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClientOrderId(pub u128);

impl ClientOrderId {
    #[inline(always)]
    pub const fn new(id: u128) -> Self {
        Self(id)
    }

    /// Generate a new unique id.
    pub fn generate() -> Self {
        Self(generate_id128())
    }

    /// Parse the `Display` form (32 hex digits) back into an id.
    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(Self)
    }

    #[inline(always)]
    pub const fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Trace identifier propagated through a logically related chain of events.
///
/// Doubles as the event-bus shard key: events sharing a trace id land on the
/// same shard and are therefore totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TraceId(pub u64);

impl TraceId {
    #[inline(always)]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generate a fresh trace id for a new causal chain.
    pub fn generate() -> Self {
        Self(generate_id128() as u64)
    }

    #[inline(always)]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Shared id generator: `[timestamp:64][random:32][counter:32]`.
fn generate_id128() -> u128 {
    use rand::Rng;
    use std::time::SystemTime;

    thread_local! {
        static COUNTER: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
        static RNG: std::cell::RefCell<rand::rngs::ThreadRng> =
            std::cell::RefCell::new(rand::thread_rng());
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_nanos(0))
        .as_nanos() as u64;

    let random_part = RNG.with(|rng| rng.borrow_mut().gen::<u32>());

    let counter = COUNTER.with(|c| {
        let val = c.get();
        c.set(val.wrapping_add(1));
        val
    });

    ((timestamp as u128) << 64) | ((random_part as u128) << 32) | (counter as u128)
}

/// Order direction (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// The opposing direction, used when emitting closing orders.
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// Order offset: whether the order opens new exposure or closes existing
/// exposure. Distinct from direction; some futures markets additionally
/// split closes into today/yesterday lots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Offset {
    Open,
    Close,
    CloseToday,
    CloseYesterday,
}

impl Offset {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, Offset::Open)
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Open => write!(f, "OPEN"),
            Offset::Close => write!(f, "CLOSE"),
            Offset::CloseToday => write!(f, "CLOSE_TODAY"),
            Offset::CloseYesterday => write!(f, "CLOSE_YESTERDAY"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order with specified price
    Limit,
    /// Market order (execute at best available price)
    Market,
    /// Stop order, triggers a market order at the stop price
    Stop,
    /// Stop-limit order, triggers a limit order at the stop price
    StopLimit,
    /// Fill-and-kill: fill what is immediately available, cancel the rest
    Fak,
    /// Fill-or-kill: fill completely and immediately or cancel
    Fok,
}

/// Order lifecycle state
///
/// Transitions are only valid along the declared graph; the order manager
/// is the single writer and linearizes every transition under its lock.
///
/// ```text
///   submitting ──→ submitted ──→ partial-filled ──→ filled      (terminal)
///        │              │              │
///        │              ├──────────────┴─→ cancelling ─→ cancelled (terminal)
///        ├──────────→ rejected                                   (terminal)
///        ├──────────→ failed                                     (terminal)
///        └──────────→ unknown   (broker disconnect; reconciled later)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Sent to the broker, not yet acknowledged
    Submitting,
    /// Acknowledged by the broker, resting
    Submitted,
    /// Some volume executed, remainder resting
    PartialFilled,
    /// Cancel requested, not yet confirmed
    Cancelling,
    /// Fully executed (terminal)
    Filled,
    /// Cancelled, possibly after partial execution (terminal)
    Cancelled,
    /// Rejected by risk or broker (terminal)
    Rejected,
    /// Submission failed locally, e.g. timeout or exhausted retries (terminal)
    Failed,
    /// State lost on broker disconnect; reconciled on reconnect
    Unknown,
}

impl OrderStatus {
    /// Terminal states never transition again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }

    /// Active states can still receive fills or broker updates.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// States from which a cancel request is accepted.
    #[inline]
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Submitting | OrderStatus::Submitted | OrderStatus::PartialFilled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Submitting => "submitting",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartialFilled => "partial_filled",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
            OrderStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Side of a position book entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The position side affected by a fill.
    ///
    /// An opening buy builds the long book; an opening sell builds the
    /// short book. A closing buy reduces the short book, a closing sell
    /// reduces the long book.
    pub fn for_fill(direction: Direction, offset: Offset) -> Self {
        match (direction, offset.is_open()) {
            (Direction::Buy, true) | (Direction::Sell, false) => PositionSide::Long,
            (Direction::Sell, true) | (Direction::Buy, false) => PositionSide::Short,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

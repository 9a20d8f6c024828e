//! Event type and payload definitions
//!
//! Events are immutable after publication: producers fill them in, the bus
//! owns them while in flight, handlers see shared references. The payload
//! is an opaque JSON object so producers and consumers agree on fields per
//! event type without the bus caring.

use crate::core::TraceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Priority at or below this value is "urgent" and drains first.
pub const URGENT_PRIORITY: u8 = 5;

/// Lowest (numerically highest) priority.
pub const MIN_PRIORITY: u8 = 9;

/// Unique event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EventId(pub u128);

impl EventId {
    pub fn generate() -> Self {
        Self(crate::core::ClientOrderId::generate().as_u128())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Kind of event flowing through the bus.
///
/// `Custom` carries its own name so subsystems can define private event
/// families (and route them with `prefix.*` patterns) without touching this
/// enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MarketTick,
    MarketBar,
    MarketDepth,
    OrderUpdate,
    TradeFill,
    PositionChange,
    AccountChange,
    StrategySignal,
    System,
    Error,
    Emergency,
    Custom(String),
}

impl EventType {
    /// Stable name used for routing patterns and metrics labels.
    pub fn name(&self) -> &str {
        match self {
            EventType::MarketTick => "market_tick",
            EventType::MarketBar => "market_bar",
            EventType::MarketDepth => "market_depth",
            EventType::OrderUpdate => "order_update",
            EventType::TradeFill => "trade_fill",
            EventType::PositionChange => "position_change",
            EventType::AccountChange => "account_change",
            EventType::StrategySignal => "strategy_signal",
            EventType::System => "system",
            EventType::Error => "error",
            EventType::Emergency => "emergency",
            EventType::Custom(name) => name,
        }
    }

    /// Default priority for events of this type when the producer does not
    /// override it. Emergencies preempt everything; market data is bulk.
    pub fn default_priority(&self) -> u8 {
        match self {
            EventType::Emergency => 0,
            EventType::Error => 1,
            EventType::OrderUpdate | EventType::TradeFill => 2,
            EventType::PositionChange | EventType::AccountChange => 3,
            EventType::StrategySignal => 4,
            EventType::System => 6,
            EventType::MarketTick | EventType::MarketBar | EventType::MarketDepth => 7,
            EventType::Custom(_) => 6,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single event. Immutable once published; the bus resets and recycles
/// the allocation through the event pool after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    /// Opaque key-value payload; always a JSON object.
    pub payload: Map<String, Value>,
    /// Producing subsystem, e.g. "order_manager" or a strategy id.
    pub source: String,
    /// 0 (highest) to 9 (lowest); <= 5 is urgent.
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    /// Shard key; events sharing a trace id are totally ordered.
    pub trace_id: TraceId,
}

impl Event {
    /// Create an event with the type's default priority and a fresh trace id.
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        let priority = event_type.default_priority();
        Self {
            id: EventId::generate(),
            event_type,
            payload: Map::new(),
            source: source.into(),
            priority,
            timestamp: Utc::now(),
            trace_id: TraceId::generate(),
        }
    }

    /// Builder-style payload field insertion.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MIN_PRIORITY);
        self
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    #[inline]
    pub fn is_urgent(&self) -> bool {
        self.priority <= URGENT_PRIORITY
    }

    /// Payload accessor returning a string field, if present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Payload accessor returning a numeric field as f64, if present.
    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    /// Payload accessor returning an unsigned integer field, if present.
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Clear per-publication state so the allocation can be reused.
    ///
    /// Capacity of the payload map is retained, which is the point of
    /// pooling in the first place.
    pub(crate) fn reset(&mut self) {
        self.id = EventId::default();
        self.payload.clear();
        self.source.clear();
        self.priority = self.event_type.default_priority();
        self.trace_id = TraceId::default();
    }
}

/// Why a publish was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Normal queue above its high-water mark, or urgent queue at ceiling
    QueueFull,
    /// Bus circuit breaker open
    BreakerOpen,
    /// Bus not started or already stopped
    NotRunning,
    /// Schema validation failed
    ValidationFailed,
    /// A filter dropped the event
    Filtered,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue-full",
            DropReason::BreakerOpen => "breaker-open",
            DropReason::NotRunning => "not-running",
            DropReason::ValidationFailed => "validation-failed",
            DropReason::Filtered => "filtered",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued on a shard
    Admitted,
    /// Dropped before enqueue, with reason
    Dropped(DropReason),
}

impl PublishOutcome {
    #[inline]
    pub fn is_admitted(&self) -> bool {
        matches!(self, PublishOutcome::Admitted)
    }
}

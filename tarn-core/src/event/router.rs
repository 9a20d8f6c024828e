//! Pattern-based routing
//!
//! Third pipeline stage: map an event's type name to the set of registered
//! handlers. Patterns are literal type names (`"order_update"`), the
//! catch-all `"*"`, or a dotted prefix glob (`"strategy.*"`) which is how
//! custom event families are routed.

use super::dispatch::HandlerEntry;
use super::types::Event;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A parsed routing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches every event
    All,
    /// Matches `head.` followed by anything
    Prefix(String),
    /// Matches a type name exactly
    Literal(String),
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Pattern::All
        } else if let Some(head) = pattern.strip_suffix(".*") {
            Pattern::Prefix(format!("{}.", head))
        } else {
            Pattern::Literal(pattern.to_string())
        }
    }

    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Prefix(prefix) => type_name.starts_with(prefix.as_str()),
            Pattern::Literal(literal) => type_name == literal,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Route {
    id: SubscriptionId,
    pattern: Pattern,
    handler: Arc<HandlerEntry>,
}

/// Subscription registry. Reads are on the hot path (one per event),
/// writes are rare, hence the RwLock.
#[derive(Clone)]
pub struct EventRouter {
    routes: Arc<RwLock<Vec<Route>>>,
    next_id: Arc<AtomicU64>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a handler under a pattern.
    ///
    /// Idempotent per (pattern, handler name): re-registering the same
    /// handler name under the same pattern returns the existing id.
    pub fn subscribe(&self, pattern: &str, handler: Arc<HandlerEntry>) -> SubscriptionId {
        let parsed = Pattern::parse(pattern);
        let mut routes = self.routes.write();

        if let Some(existing) = routes
            .iter()
            .find(|r| r.pattern == parsed && r.handler.name() == handler.name())
        {
            return existing.id;
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        routes.push(Route {
            id,
            pattern: parsed,
            handler,
        });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.id != id);
        routes.len() != before
    }

    /// Handlers whose pattern matches this event.
    pub fn route(&self, event: &Event) -> Vec<Arc<HandlerEntry>> {
        let type_name = event.event_type.name();
        self.routes
            .read()
            .iter()
            .filter(|r| r.pattern.matches(type_name))
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.routes.read().len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::dispatch::HandlerKind;
    use crate::event::types::EventType;

    fn noop(name: &str) -> Arc<HandlerEntry> {
        Arc::new(HandlerEntry::new(name, HandlerKind::Cpu, |_| Ok(())))
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(Pattern::parse("*"), Pattern::All);
        assert_eq!(
            Pattern::parse("strategy.*"),
            Pattern::Prefix("strategy.".into())
        );
        assert_eq!(
            Pattern::parse("order_update"),
            Pattern::Literal("order_update".into())
        );
    }

    #[test]
    fn test_literal_routing() {
        let router = EventRouter::new();
        router.subscribe("order_update", noop("orders"));

        let matching = Event::new(EventType::OrderUpdate, "t");
        let other = Event::new(EventType::MarketTick, "t");
        assert_eq!(router.route(&matching).len(), 1);
        assert!(router.route(&other).is_empty());
    }

    #[test]
    fn test_prefix_routing_hits_custom_types() {
        let router = EventRouter::new();
        router.subscribe("strategy.*", noop("s"));

        let hit = Event::new(EventType::Custom("strategy.heartbeat".into()), "t");
        let miss = Event::new(EventType::Custom("broker.status".into()), "t");
        assert_eq!(router.route(&hit).len(), 1);
        assert!(router.route(&miss).is_empty());
    }

    #[test]
    fn test_catch_all() {
        let router = EventRouter::new();
        router.subscribe("*", noop("audit"));
        let ev = Event::new(EventType::Emergency, "t");
        assert_eq!(router.route(&ev).len(), 1);
    }

    #[test]
    fn test_subscribe_is_idempotent_per_name() {
        let router = EventRouter::new();
        let a = router.subscribe("order_update", noop("orders"));
        let b = router.subscribe("order_update", noop("orders"));
        assert_eq!(a, b);
        assert_eq!(router.subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let router = EventRouter::new();
        let id = router.subscribe("*", noop("audit"));
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        assert_eq!(router.subscription_count(), 0);
    }
}

//! Per-type event object pool
//!
//! Events are drawn from a lock-free free list per event type and returned
//! after dispatch completes (or the event is dropped). Pooling keeps the
//! payload map's allocation alive across publications, so steady-state
//! publishing does not allocate.
//!
//! The pool is bounded (default 10,000 events per type). `acquire` on an
//! empty free list falls back to constructing a fresh event; `release` on a
//! full free list simply drops the event. Neither case is an error.

use super::types::{Event, EventType};
use crossbeam::queue::ArrayQueue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default free-list capacity per event type.
pub const DEFAULT_POOL_CAPACITY: usize = 10_000;

struct TypePool {
    free: ArrayQueue<Event>,
    /// Events handed out and not yet returned
    outstanding: AtomicU64,
}

/// Pool of reusable events keyed by event type.
///
/// Cloning shares the underlying free lists.
#[derive(Clone)]
pub struct EventPool {
    capacity: usize,
    pools: Arc<RwLock<HashMap<EventType, Arc<TypePool>>>>,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn type_pool(&self, event_type: &EventType) -> Arc<TypePool> {
        if let Some(pool) = self.pools.read().get(event_type) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(event_type.clone()).or_insert_with(|| {
            Arc::new(TypePool {
                free: ArrayQueue::new(self.capacity),
                outstanding: AtomicU64::new(0),
            })
        }))
    }

    /// Take a reset event of the given type, constructing one if the free
    /// list is empty.
    pub fn acquire(&self, event_type: EventType, source: &str) -> Event {
        let pool = self.type_pool(&event_type);
        pool.outstanding.fetch_add(1, Ordering::Relaxed);

        match pool.free.pop() {
            Some(mut event) => {
                event.id = super::types::EventId::generate();
                event.source.push_str(source);
                event.timestamp = chrono::Utc::now();
                event.trace_id = crate::core::TraceId::generate();
                event
            }
            None => Event::new(event_type, source),
        }
    }

    /// Return an event after dispatch. The event is reset before it goes
    /// back on the free list; a full free list drops it.
    pub fn release(&self, mut event: Event) {
        let pool = self.type_pool(&event.event_type);
        let _ = pool
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        event.reset();
        let _ = pool.free.push(event);
    }

    /// Free-list depth for one type (0 if the type was never seen).
    pub fn available(&self, event_type: &EventType) -> usize {
        self.pools
            .read()
            .get(event_type)
            .map(|p| p.free.len())
            .unwrap_or(0)
    }

    /// Total pooled events across all types.
    pub fn total_pooled(&self) -> usize {
        self.pools.read().values().map(|p| p.free.len()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

//! Sharded priority queues
//!
//! Each shard holds two bounded FIFO queues: `urgent` (priority <= 5) and
//! `normal`. The shard for an event is `hash(trace_id) % shard_count`, so
//! events sharing a trace id are totally ordered while unrelated traffic
//! spreads across shards with no global lock.
//!
//! Capacity semantics:
//! - the normal queue's capacity *is* the high-water mark: a push that does
//!   not fit is a `queue-full` drop;
//! - the urgent queue is larger (the hard ceiling) so urgent events keep
//!   being admitted while normal traffic is shedding.

use super::types::Event;
use crate::core::TraceId;
use crossbeam::queue::ArrayQueue;
use std::hash::{Hash, Hasher};

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// Default normal-queue capacity per shard (the high-water mark).
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Urgent ceiling as a multiple of the normal capacity.
const URGENT_CEILING_FACTOR: usize = 2;

/// One shard: a pair of bounded FIFO queues.
pub struct Shard {
    urgent: ArrayQueue<Event>,
    normal: ArrayQueue<Event>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            urgent: ArrayQueue::new(capacity * URGENT_CEILING_FACTOR),
            normal: ArrayQueue::new(capacity),
        }
    }

    /// Enqueue, routing on urgency. Err returns the event so the caller can
    /// count the drop without losing the allocation.
    pub fn push(&self, event: Event) -> Result<(), Event> {
        if event.is_urgent() {
            self.urgent.push(event)
        } else {
            self.normal.push(event)
        }
    }

    /// Dequeue honoring strict urgent-first ordering.
    pub fn pop(&self) -> Option<Event> {
        self.urgent.pop().or_else(|| self.normal.pop())
    }

    pub fn urgent_len(&self) -> usize {
        self.urgent.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }
}

/// The full set of shards.
pub struct ShardedQueue {
    shards: Vec<Shard>,
}

impl ShardedQueue {
    pub fn new(shard_count: usize, capacity: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Shard::new(capacity)).collect(),
        }
    }

    /// Shard index for a trace id. Stable for the lifetime of the queue.
    pub fn shard_index(&self, trace_id: TraceId) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        trace_id.as_u64().hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Queue depth per shard, urgent + normal.
    pub fn depths(&self) -> Vec<(usize, usize)> {
        self.shards
            .iter()
            .map(|s| (s.urgent_len(), s.normal_len()))
            .collect()
    }

    pub fn total_len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::EventType;

    fn event(priority: u8, trace: u64) -> Event {
        Event::new(EventType::System, "test")
            .with_priority(priority)
            .with_trace_id(TraceId::new(trace))
    }

    #[test]
    fn test_urgent_drains_before_normal() {
        let shard = Shard::new(16);
        shard.push(event(7, 1)).unwrap();
        shard.push(event(3, 2)).unwrap();
        shard.push(event(8, 3)).unwrap();

        assert_eq!(shard.pop().unwrap().priority, 3);
        assert_eq!(shard.pop().unwrap().priority, 7);
        assert_eq!(shard.pop().unwrap().priority, 8);
        assert!(shard.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority_bucket() {
        let shard = Shard::new(16);
        for i in 0..5u64 {
            shard.push(event(6, i).with_field("seq", i)).unwrap();
        }
        for i in 0..5u64 {
            assert_eq!(shard.pop().unwrap().u64_field("seq"), Some(i));
        }
    }

    #[test]
    fn test_normal_capacity_is_high_water_mark() {
        let shard = Shard::new(2);
        assert!(shard.push(event(7, 1)).is_ok());
        assert!(shard.push(event(7, 2)).is_ok());
        // Capacity + 1 is refused
        assert!(shard.push(event(7, 3)).is_err());
        // Urgent still admitted past the normal high-water mark
        assert!(shard.push(event(2, 4)).is_ok());
    }

    #[test]
    fn test_same_trace_id_maps_to_same_shard() {
        let q = ShardedQueue::new(8, 16);
        let a = q.shard_index(TraceId::new(42));
        let b = q.shard_index(TraceId::new(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_shard_spread() {
        let q = ShardedQueue::new(8, 16);
        let mut seen = std::collections::HashSet::new();
        for t in 0..256u64 {
            seen.insert(q.shard_index(TraceId::new(t)));
        }
        // 256 traces over 8 shards must touch more than one shard
        assert!(seen.len() > 1);
    }
}

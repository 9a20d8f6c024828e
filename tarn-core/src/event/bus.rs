//! The event bus
//!
//! ## Architecture
//!
//! ```text
//!  producers ──publish──► admission ──► shard queues ──► shard workers
//!                         │  breaker        urgent │          │
//!                         │  capacity       normal │          ▼
//!                         ▼                               validate
//!                      dropped                            filter
//!                      (reason counted)                   route
//!                                                         dispatch ──► io pool
//!                                                                  └─► cpu pool
//! ```
//!
//! `publish` is admission control only: it may briefly contend on a shard
//! queue but never waits on handler execution. One worker thread per shard
//! drains urgent-first in adaptive batches and runs the pipeline stages;
//! dispatch fans out to the kind-segregated pools.
//!
//! ## Ordering
//!
//! Within a shard, delivery order is sorted by (priority bucket, arrival).
//! The shard is chosen by `hash(trace_id)`, so events sharing a trace id
//! are totally ordered. Across shards there is no global order.

use super::batch::AdaptiveBatchController;
use super::dispatch::{Dispatcher, HandlerEntry, HandlerKind};
use super::filter::{FilterChain, FilterOutcome};
use super::pool::EventPool;
use super::queue::{ShardedQueue, DEFAULT_QUEUE_CAPACITY, DEFAULT_SHARD_COUNT};
use super::router::{EventRouter, SubscriptionId};
use super::types::{DropReason, Event, EventType, PublishOutcome};
use super::validator::{EventSchema, EventValidator};
use crate::resilience::{BreakerConfig, BreakerState, CircuitBreaker};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Number of shards (queue pairs + worker threads)
    pub shard_count: usize,
    /// Normal-queue capacity per shard; doubles as the high-water mark
    pub queue_capacity: usize,
    /// I/O handler pool width
    pub io_workers: usize,
    /// CPU handler pool width; 0 = available parallelism
    pub cpu_workers: usize,
    /// Target throughput for the adaptive batch controller, events/second
    pub target_rate: f64,
    /// Per-type event pool capacity
    pub pool_capacity: usize,
    /// Bus-level circuit breaker configuration
    pub breaker: BreakerConfig,
    /// Worker sleep when its shard is empty
    pub idle_sleep: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            io_workers: super::dispatch::DEFAULT_IO_WORKERS,
            cpu_workers: 0,
            target_rate: super::batch::DEFAULT_TARGET_RATE,
            pool_capacity: super::pool::DEFAULT_POOL_CAPACITY,
            breaker: BreakerConfig::default(),
            idle_sleep: Duration::from_micros(500),
        }
    }
}

/// Bucket upper bounds for the pipeline latency histogram, microseconds.
const LATENCY_BOUNDS: [u64; 9] = [50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000];

/// Pipeline latency histogram with fixed microsecond buckets.
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len() + 1],
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        let idx = LATENCY_BOUNDS
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(LATENCY_BOUNDS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            let label = if i < LATENCY_BOUNDS.len() {
                format!("le_{}us", LATENCY_BOUNDS[i])
            } else {
                "inf".to_string()
            };
            out.push((label, bucket.load(Ordering::Relaxed)));
        }
        out
    }
}

struct Counters {
    published: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_breaker_open: AtomicU64,
    dropped_not_running: AtomicU64,
    dropped_validation: AtomicU64,
    dropped_filtered: AtomicU64,
    errors_emitted: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            dropped_queue_full: AtomicU64::new(0),
            dropped_breaker_open: AtomicU64::new(0),
            dropped_not_running: AtomicU64::new(0),
            dropped_validation: AtomicU64::new(0),
            dropped_filtered: AtomicU64::new(0),
            errors_emitted: AtomicU64::new(0),
        }
    }

    fn count_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::BreakerOpen => &self.dropped_breaker_open,
            DropReason::NotRunning => &self.dropped_not_running,
            DropReason::ValidationFailed => &self.dropped_validation,
            DropReason::Filtered => &self.dropped_filtered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time bus statistics, cheap to collect.
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    pub running: bool,
    /// (urgent, normal) depth per shard
    pub shard_depths: Vec<(usize, usize)>,
    pub published: u64,
    pub dispatched: u64,
    pub dropped_queue_full: u64,
    pub dropped_breaker_open: u64,
    pub dropped_not_running: u64,
    pub dropped_validation: u64,
    pub dropped_filtered: u64,
    pub handler_errors: u64,
    /// Error events the bus itself emitted for failing handlers
    pub errors_emitted: u64,
    /// Events per second over the last monitor sample
    pub throughput: u64,
    pub batch_size: usize,
    pub breaker_state: &'static str,
    pub pooled_events: usize,
    pub subscriptions: usize,
    /// Pipeline latency histogram (publish to dispatch handoff)
    pub latency_buckets: Vec<(String, u64)>,
}

struct BusInner {
    config: EventBusConfig,
    queues: ShardedQueue,
    pool: EventPool,
    validator: EventValidator,
    filters: FilterChain,
    router: EventRouter,
    dispatcher: Dispatcher,
    breaker: CircuitBreaker,
    controller: AdaptiveBatchController,
    counters: Counters,
    latency: LatencyHistogram,
    throughput: AtomicU64,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The bus handle. Cloning shares the underlying bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self::with_handler_latency_hook(config, None)
    }

    /// Build a bus whose handler execution times also feed an external
    /// observer (the prometheus histogram, in the binary).
    pub fn with_handler_latency_hook(
        config: EventBusConfig,
        latency_hook: Option<super::dispatch::LatencyHook>,
    ) -> Self {
        let cpu_workers = if config.cpu_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            config.cpu_workers
        };

        let inner = Arc::new_cyclic(|weak: &Weak<BusInner>| {
            let mut dispatcher = Dispatcher::new(config.io_workers, cpu_workers);

            let hook_weak = weak.clone();
            dispatcher.set_failure_hook(Arc::new(move |handler, err| {
                if let Some(inner) = hook_weak.upgrade() {
                    BusInner::on_handler_failure(&inner, handler, err);
                }
            }));
            if let Some(hook) = latency_hook.clone() {
                dispatcher.set_latency_hook(hook);
            }

            BusInner {
                queues: ShardedQueue::new(config.shard_count, config.queue_capacity),
                pool: EventPool::new(config.pool_capacity),
                validator: EventValidator::with_defaults(),
                filters: FilterChain::new(),
                router: EventRouter::new(),
                dispatcher,
                breaker: CircuitBreaker::new(config.breaker.clone()),
                controller: AdaptiveBatchController::new(config.target_rate),
                counters: Counters::new(),
                latency: LatencyHistogram::new(),
                throughput: AtomicU64::new(0),
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                config,
            }
        });

        Self { inner }
    }

    /// Start shard workers and the monitor thread. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("event bus already running");
            return;
        }

        let mut workers = self.inner.workers.lock();
        for shard_idx in 0..self.inner.queues.shard_count() {
            let inner = Arc::clone(&self.inner);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("tarn-bus-shard-{}", shard_idx))
                    .spawn(move || inner.shard_worker(shard_idx))
                    .expect("failed to spawn shard worker"),
            );
        }

        let inner = Arc::clone(&self.inner);
        workers.push(
            std::thread::Builder::new()
                .name("tarn-bus-monitor".into())
                .spawn(move || inner.monitor_loop())
                .expect("failed to spawn bus monitor"),
        );

        info!(
            shards = self.inner.queues.shard_count(),
            "event bus started"
        );
    }

    /// Stop the bus: workers drain their shards, then the dispatcher drains
    /// its pools. After `stop` returns no handler will be invoked. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            debug!("event bus already stopped");
            return;
        }

        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.inner.dispatcher.shutdown();
        info!("event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Publish an event. Returns whether it was admitted; drops are counted
    /// by reason. Never blocks on handler execution.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        self.inner.publish(event)
    }

    /// Acquire a pooled event to fill in and publish.
    pub fn acquire_event(&self, event_type: EventType, source: &str) -> Event {
        self.inner.pool.acquire(event_type, source)
    }

    /// Subscribe a handler to a type pattern (`"order_update"`, `"*"`,
    /// `"strategy.*"`). Idempotent per (pattern, handler name).
    pub fn subscribe<F>(
        &self,
        pattern: &str,
        name: impl Into<String>,
        kind: HandlerKind,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entry = Arc::new(HandlerEntry::new(name, kind, handler));
        self.inner.router.subscribe(pattern, entry)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.router.unsubscribe(id)
    }

    /// Register a routing entry for an externally constructed handler.
    pub fn add_router(&self, pattern: &str, handler: Arc<HandlerEntry>) -> SubscriptionId {
        self.inner.router.subscribe(pattern, handler)
    }

    /// Append a filter to the ordered chain.
    pub fn add_filter<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Event) -> FilterOutcome + Send + Sync + 'static,
    {
        self.inner.filters.add(name, filter);
    }

    /// Register a validation schema for an event type.
    pub fn add_validator(&self, event_type: EventType, schema: EventSchema) {
        self.inner.validator.add_schema(event_type, schema);
    }

    /// Bus-level circuit breaker, exposed for operator reset and metrics.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// A sink closure for feeding this bus, e.g. from a coalescing proxy.
    pub fn sink(&self) -> super::batch::EventSink {
        let bus = self.clone();
        Arc::new(move |event| {
            bus.publish(event);
        })
    }

    pub fn stats(&self) -> EventBusStats {
        let inner = &self.inner;
        EventBusStats {
            running: inner.running.load(Ordering::Acquire),
            shard_depths: inner.queues.depths(),
            published: inner.counters.published.load(Ordering::Relaxed),
            dispatched: inner.dispatcher.dispatched_count(),
            dropped_queue_full: inner.counters.dropped_queue_full.load(Ordering::Relaxed),
            dropped_breaker_open: inner.counters.dropped_breaker_open.load(Ordering::Relaxed),
            dropped_not_running: inner.counters.dropped_not_running.load(Ordering::Relaxed),
            dropped_validation: inner.counters.dropped_validation.load(Ordering::Relaxed),
            dropped_filtered: inner.counters.dropped_filtered.load(Ordering::Relaxed),
            handler_errors: inner.dispatcher.handler_error_count(),
            errors_emitted: inner.counters.errors_emitted.load(Ordering::Relaxed),
            throughput: inner.throughput.load(Ordering::Relaxed),
            batch_size: inner.controller.batch_size(),
            breaker_state: match inner.breaker.state() {
                BreakerState::Closed => "closed",
                BreakerState::Open => "open",
                BreakerState::HalfOpen => "half-open",
            },
            pooled_events: inner.pool.total_pooled(),
            subscriptions: inner.router.subscription_count(),
            latency_buckets: inner.latency.snapshot(),
        }
    }
}

impl BusInner {
    fn publish(&self, event: Event) -> PublishOutcome {
        if !self.running.load(Ordering::Acquire) {
            self.counters.count_drop(DropReason::NotRunning);
            self.pool.release(event);
            return PublishOutcome::Dropped(DropReason::NotRunning);
        }

        // Breaker gates publication: Open sheds everything, HalfOpen meters
        // probes through.
        if !self.breaker.is_call_permitted() {
            self.counters.count_drop(DropReason::BreakerOpen);
            self.pool.release(event);
            return PublishOutcome::Dropped(DropReason::BreakerOpen);
        }

        let shard_idx = self.queues.shard_index(event.trace_id);
        match self.queues.shard(shard_idx).push(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Admitted
            }
            Err(event) => {
                self.counters.count_drop(DropReason::QueueFull);
                self.pool.release(event);
                PublishOutcome::Dropped(DropReason::QueueFull)
            }
        }
    }

    /// One shard's worker loop: drain urgent-first in adaptive batches, run
    /// the pipeline per event. On stop, drain what was admitted.
    fn shard_worker(self: Arc<Self>, shard_idx: usize) {
        loop {
            let running = self.running.load(Ordering::Acquire);
            let batch = self.controller.batch_size();
            let mut processed = 0usize;

            while processed < batch {
                match self.queues.shard(shard_idx).pop() {
                    Some(event) => {
                        self.process(event);
                        processed += 1;
                    }
                    None => break,
                }
            }

            if !running && self.queues.shard(shard_idx).is_empty() {
                break;
            }
            if processed == 0 {
                std::thread::sleep(self.config.idle_sleep);
            }
        }
    }

    /// Pipeline: validate → filter → route → dispatch.
    fn process(&self, event: Event) {
        if let Err(reason) = self.validator.validate(&event) {
            debug!(event_type = %event.event_type, reason, "event failed validation");
            self.counters.count_drop(DropReason::ValidationFailed);
            self.breaker.record_failure();
            self.pool.release(event);
            return;
        }

        let event = match self.filters.apply(event) {
            Ok(event) => event,
            Err((filter_name, event)) => {
                debug!(filter = %filter_name, "event dropped by filter");
                self.counters.count_drop(DropReason::Filtered);
                self.pool.release(event);
                return;
            }
        };

        let handlers = self.router.route(&event);

        let queued_for = chrono::Utc::now()
            .signed_duration_since(event.timestamp)
            .to_std()
            .unwrap_or_default();
        self.latency.record(queued_for);

        self.dispatcher.dispatch(event, handlers, &self.pool);
        self.breaker.record_success();
    }

    /// Handler failure path: count into the breaker and surface an error
    /// event for observers.
    fn on_handler_failure(self: &Arc<Self>, handler: &str, err: &str) {
        self.breaker.record_failure();

        let event = self
            .pool
            .acquire(EventType::Error, "event_bus")
            .with_field("handler", handler)
            .with_field("error", err)
            .with_priority(1);
        self.counters.errors_emitted.fetch_add(1, Ordering::Relaxed);
        self.publish(event);
    }

    fn monitor_loop(self: Arc<Self>) {
        let mut last_dispatched = self.dispatcher.dispatched_count();
        let mut last_sample = Instant::now();

        while crate::utils::interruptible_sleep(&self.running, Duration::from_secs(1)) {
            let dispatched = self.dispatcher.dispatched_count();
            let elapsed = last_sample.elapsed();
            let delta = dispatched.saturating_sub(last_dispatched);

            self.controller.observe(delta, elapsed);
            self.throughput
                .store((delta as f64 / elapsed.as_secs_f64()) as u64, Ordering::Relaxed);

            if self.breaker.state() == BreakerState::Open {
                warn!("event bus circuit breaker is open; publishes are shedding");
            }

            last_dispatched = dispatched;
            last_sample = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::URGENT_PRIORITY;
    use crate::core::TraceId;
    use std::sync::atomic::AtomicU64;

    fn small_bus() -> EventBus {
        EventBus::new(EventBusConfig {
            shard_count: 1,
            queue_capacity: 64,
            io_workers: 1,
            cpu_workers: 1,
            idle_sleep: Duration::from_micros(100),
            ..Default::default()
        })
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_publish_before_start_drops_not_running() {
        let bus = small_bus();
        let outcome = bus.publish(Event::new(EventType::System, "t"));
        assert_eq!(
            outcome,
            PublishOutcome::Dropped(DropReason::NotRunning)
        );
        assert_eq!(bus.stats().dropped_not_running, 1);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let bus = small_bus();
        bus.start();
        bus.start();
        assert!(bus.is_running());
        bus.stop();
        bus.stop();
        assert!(!bus.is_running());
    }

    #[test]
    fn test_publish_dispatches_to_subscriber() {
        let bus = small_bus();
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("system", "counter", HandlerKind::Cpu, move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        bus.start();
        assert!(bus.publish(Event::new(EventType::System, "t")).is_admitted());
        wait_until(|| hits.load(Ordering::Relaxed) == 1);
        bus.stop();
    }

    #[test]
    fn test_admitted_events_delivered_on_stop() {
        let bus = small_bus();
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("*", "drain-counter", HandlerKind::Cpu, move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        bus.start();
        for _ in 0..50 {
            assert!(bus.publish(Event::new(EventType::System, "t")).is_admitted());
        }
        bus.stop();
        // Everything admitted before stop was delivered
        assert_eq!(hits.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_urgent_processed_before_normal() {
        // Worker sleeps 300ms on an empty shard, leaving a window to queue
        // a mixed batch that it then drains in one pass, urgent-first.
        let bus = EventBus::new(EventBusConfig {
            shard_count: 1,
            queue_capacity: 256,
            io_workers: 1,
            cpu_workers: 1,
            idle_sleep: Duration::from_millis(300),
            ..Default::default()
        });
        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            bus.subscribe("system", "order-probe", HandlerKind::Cpu, move |ev| {
                order.lock().push(ev.priority);
                Ok(())
            });
        }

        bus.start();
        std::thread::sleep(Duration::from_millis(50));

        let trace = TraceId::new(7);
        let mut events = Vec::new();
        for _ in 0..10 {
            events.push(
                Event::new(EventType::System, "t")
                    .with_priority(8)
                    .with_trace_id(trace),
            );
            events.push(
                Event::new(EventType::System, "t")
                    .with_priority(2)
                    .with_trace_id(trace),
            );
        }
        for ev in events {
            assert!(bus.publish(ev).is_admitted());
        }

        wait_until(|| order.lock().len() == 20);
        bus.stop();

        let seen = order.lock();
        let first_normal = seen
            .iter()
            .position(|&p| p > URGENT_PRIORITY)
            .expect("normal events present");
        // All urgent events drain before the first normal one
        assert!(seen[..first_normal]
            .iter()
            .all(|&p| p <= URGENT_PRIORITY));
        assert_eq!(seen[..first_normal].len(), 10);
    }

    #[test]
    fn test_queue_full_drops_with_reason() {
        let bus = EventBus::new(EventBusConfig {
            shard_count: 1,
            queue_capacity: 4,
            io_workers: 1,
            cpu_workers: 1,
            idle_sleep: Duration::from_micros(100),
            ..Default::default()
        });
        bus.start();

        // Pre-built events make the publish loop much faster than the
        // worker's per-event pipeline, so the 4-slot queue must overflow.
        let trace = TraceId::new(1);
        let events: Vec<Event> = (0..10_000)
            .map(|_| {
                Event::new(EventType::System, "t")
                    .with_priority(9)
                    .with_trace_id(trace)
            })
            .collect();

        let mut dropped = 0;
        for ev in events {
            if !bus.publish(ev).is_admitted() {
                dropped += 1;
            }
        }
        assert!(dropped > 0);
        assert_eq!(bus.stats().dropped_queue_full, dropped);
        bus.stop();
    }

    #[test]
    fn test_validation_failure_counted() {
        let bus = small_bus();
        bus.start();
        // Tick without required fields
        bus.publish(Event::new(EventType::MarketTick, "feed"));
        wait_until(|| bus.stats().dropped_validation == 1);
        bus.stop();
    }

    #[test]
    fn test_filter_drop_counted() {
        let bus = small_bus();
        bus.add_filter("drop-system", |ev: &Event| {
            if ev.event_type == EventType::System {
                FilterOutcome::Drop
            } else {
                FilterOutcome::Pass
            }
        });
        bus.start();
        bus.publish(Event::new(EventType::System, "t"));
        wait_until(|| bus.stats().dropped_filtered == 1);
        bus.stop();
    }

    #[test]
    fn test_breaker_open_sheds_publishes() {
        let bus = small_bus();
        bus.start();
        bus.breaker().force_open();
        let outcome = bus.publish(Event::new(EventType::System, "t"));
        assert_eq!(outcome, PublishOutcome::Dropped(DropReason::BreakerOpen));
        assert_eq!(bus.stats().dropped_breaker_open, 1);
        bus.stop();
    }

    #[test]
    fn test_handler_failure_emits_error_event() {
        let bus = small_bus();
        let errors_seen = Arc::new(AtomicU64::new(0));
        bus.subscribe("system", "failing", HandlerKind::Cpu, |_| {
            Err(anyhow::anyhow!("boom"))
        });
        {
            let errors_seen = Arc::clone(&errors_seen);
            bus.subscribe("error", "error-observer", HandlerKind::Cpu, move |ev| {
                assert_eq!(ev.str_field("handler"), Some("failing"));
                errors_seen.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        bus.start();
        bus.publish(Event::new(EventType::System, "t"));
        wait_until(|| errors_seen.load(Ordering::Relaxed) == 1);
        bus.stop();
    }

    #[test]
    fn test_stats_shape() {
        let bus = small_bus();
        let stats = bus.stats();
        assert_eq!(stats.shard_depths.len(), 1);
        assert_eq!(stats.breaker_state, "closed");
        assert!(!stats.running);
    }
}

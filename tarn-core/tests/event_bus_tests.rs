//! Event bus behavior: breaker gating, ordering, capacity boundaries,
//! lifecycle laws

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tarn_core::core::TraceId;
use tarn_core::event::{
    DropReason, Event, EventBus, EventBusConfig, EventType, HandlerKind, PublishOutcome,
};
use tarn_core::resilience::{BreakerConfig, BreakerState};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn bus_with_breaker(threshold: u64, recovery: Duration) -> EventBus {
    EventBus::new(EventBusConfig {
        shard_count: 1,
        io_workers: 1,
        cpu_workers: 1,
        breaker: BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            success_threshold: 1,
            half_open_max_probes: 3,
        },
        ..Default::default()
    })
}

#[test]
fn test_breaker_trips_recovers_and_resets() {
    let bus = bus_with_breaker(3, Duration::from_millis(300));
    bus.start();

    // Three consecutive invalid publishes of the same shape
    for _ in 0..3 {
        let bad = Event::new(EventType::MarketTick, "feed").with_field("symbol", "rb2405");
        assert!(bus.publish(bad).is_admitted());
    }
    wait_until("breaker open", || {
        bus.breaker().state() == BreakerState::Open
    });

    // Shedding while open
    let outcome = bus.publish(Event::new(EventType::System, "t"));
    assert_eq!(outcome, PublishOutcome::Dropped(DropReason::BreakerOpen));

    // After the recovery window a probe is admitted; a valid event closes
    // the breaker and resets the failure count
    std::thread::sleep(Duration::from_millis(350));
    let probe = Event::new(EventType::MarketTick, "feed")
        .with_field("symbol", "rb2405")
        .with_field("price", 3500.0);
    assert!(bus.publish(probe).is_admitted());
    wait_until("breaker closed", || {
        bus.breaker().state() == BreakerState::Closed
    });
    assert_eq!(bus.breaker().consecutive_failures(), 0);

    bus.stop();
}

#[test]
fn test_equal_priority_fifo_per_shard() {
    let bus = EventBus::new(EventBusConfig {
        shard_count: 1,
        io_workers: 1,
        cpu_workers: 1,
        idle_sleep: Duration::from_millis(200),
        ..Default::default()
    });
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        bus.subscribe("system", "fifo-probe", HandlerKind::Cpu, move |ev| {
            seen.lock().push(ev.u64_field("seq").unwrap_or(0));
            Ok(())
        });
    }

    bus.start();
    std::thread::sleep(Duration::from_millis(40));
    let trace = TraceId::new(11);
    for seq in 0..50u64 {
        let ev = Event::new(EventType::System, "t")
            .with_field("seq", seq)
            .with_trace_id(trace);
        assert!(bus.publish(ev).is_admitted());
    }

    wait_until("all delivered", || seen.lock().len() == 50);
    bus.stop();

    let order = seen.lock();
    assert_eq!(*order, (0..50).collect::<Vec<u64>>());
}

#[test]
fn test_capacity_boundary_admission() {
    // Single shard, tiny queue, long idle sleep so the worker is asleep
    // while we fill the queue to the boundary
    let bus = EventBus::new(EventBusConfig {
        shard_count: 1,
        queue_capacity: 8,
        io_workers: 1,
        cpu_workers: 1,
        idle_sleep: Duration::from_millis(500),
        ..Default::default()
    });
    bus.start();
    std::thread::sleep(Duration::from_millis(50));

    let trace = TraceId::new(3);
    let make = || {
        Event::new(EventType::System, "t")
            .with_priority(9)
            .with_trace_id(trace)
    };
    // Exactly at capacity: all admitted
    for _ in 0..8 {
        assert!(bus.publish(make()).is_admitted());
    }
    // Capacity + 1: dropped with queue-full
    assert_eq!(
        bus.publish(make()),
        PublishOutcome::Dropped(DropReason::QueueFull)
    );
    // Urgent events still pass the normal high-water mark
    let urgent = Event::new(EventType::Emergency, "t").with_trace_id(trace);
    assert!(bus.publish(urgent).is_admitted());

    bus.stop();
}

#[test]
fn test_lifecycle_idempotence_laws() {
    let bus = EventBus::new(EventBusConfig {
        shard_count: 1,
        io_workers: 1,
        cpu_workers: 1,
        ..Default::default()
    });

    bus.start();
    bus.start();
    assert!(bus.is_running());

    // Same (pattern, name) registers once
    let a = bus.subscribe("system", "dup", HandlerKind::Cpu, |_| Ok(()));
    let b = bus.subscribe("system", "dup", HandlerKind::Cpu, |_| Ok(()));
    assert_eq!(a, b);
    assert_eq!(bus.stats().subscriptions, 1);

    bus.stop();
    bus.stop();
    assert!(!bus.is_running());
}

#[test]
fn test_no_delivery_after_stop() {
    let bus = EventBus::new(EventBusConfig {
        shard_count: 1,
        io_workers: 1,
        cpu_workers: 1,
        ..Default::default()
    });
    let hits = Arc::new(AtomicU64::new(0));
    {
        let hits = Arc::clone(&hits);
        bus.subscribe("*", "counter", HandlerKind::Cpu, move |_| {
            hits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }

    bus.start();
    for _ in 0..10 {
        bus.publish(Event::new(EventType::System, "t"));
    }
    bus.stop();
    let delivered = hits.load(Ordering::Relaxed);
    // Everything admitted before stop was delivered during the drain
    assert_eq!(delivered, 10);

    // Publishes after stop are refused and nothing more is delivered
    assert_eq!(
        bus.publish(Event::new(EventType::System, "t")),
        PublishOutcome::Dropped(DropReason::NotRunning)
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::Relaxed), delivered);
}

#[test]
fn test_trace_ordering_survives_load() {
    let bus = EventBus::new(EventBusConfig {
        shard_count: 4,
        io_workers: 1,
        cpu_workers: 1,
        ..Default::default()
    });
    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        bus.subscribe("system", "trace-probe", HandlerKind::Cpu, move |ev| {
            seen.lock()
                .push((ev.trace_id.as_u64(), ev.u64_field("seq").unwrap_or(0)));
            Ok(())
        });
    }

    bus.start();
    // Interleave three traces; per-trace sequences must stay ordered
    for seq in 0..30u64 {
        for trace in 1..=3u64 {
            let ev = Event::new(EventType::System, "t")
                .with_field("seq", seq)
                .with_trace_id(TraceId::new(trace));
            assert!(bus.publish(ev).is_admitted());
        }
    }
    wait_until("all delivered", || seen.lock().len() == 90);
    bus.stop();

    let entries = seen.lock();
    for trace in 1..=3u64 {
        let per_trace: Vec<u64> = entries
            .iter()
            .filter(|(t, _)| *t == trace)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(per_trace, (0..30).collect::<Vec<u64>>(), "trace {}", trace);
    }
}

//! Adaptive batching and high-frequency stream coalescing
//!
//! Two separate concerns share this module:
//!
//! - [`AdaptiveBatchController`] tunes how many events a shard worker pulls
//!   per iteration, tracking a configured target throughput. It is sampled
//!   once a second by the bus monitor thread.
//! - [`CoalescingProxy`] sits in front of the bus for duplicate-prone
//!   market-data streams and merges ticks/bars per (type, symbol) window so
//!   at most one merged event per key reaches the bus each window.

use super::types::{Event, EventType};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Bounds and default target for the adaptive batch size.
pub const MIN_BATCH_SIZE: usize = 50;
pub const MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_TARGET_RATE: f64 = 10_000.0;

/// Adjusts batch size toward a target event rate.
///
/// Below ~90% of target the batch grows 20%, above ~110% it shrinks 10%.
/// The asymmetry favors recovering throughput over shedding it.
pub struct AdaptiveBatchController {
    batch_size: AtomicUsize,
    target_rate: f64,
}

impl AdaptiveBatchController {
    pub fn new(target_rate: f64) -> Self {
        Self {
            batch_size: AtomicUsize::new(MIN_BATCH_SIZE * 2),
            target_rate,
        }
    }

    /// Current batch size for shard workers.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Feed one observation: events processed over the sample interval.
    pub fn observe(&self, processed: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        let rate = processed as f64 / elapsed.as_secs_f64();
        let current = self.batch_size.load(Ordering::Relaxed);

        let next = if rate < self.target_rate * 0.9 {
            ((current as f64 * 1.2) as usize).min(MAX_BATCH_SIZE)
        } else if rate > self.target_rate * 1.1 {
            ((current as f64 * 0.9) as usize).max(MIN_BATCH_SIZE)
        } else {
            current
        };

        if next != current {
            debug!(rate, current, next, "batch size adjusted");
            self.batch_size.store(next, Ordering::Relaxed);
        }
    }
}

/// Sink the proxy flushes merged events into; in production this is
/// `EventBus::publish`.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Hash, PartialEq, Eq, Clone)]
struct CoalesceKey {
    type_name: String,
    symbol: String,
}

/// Merges high-frequency tick/bar events per (type, symbol) window.
///
/// Within a window the latest tick replaces the prior one while `volume`
/// and `turnover` accumulate; bars merge highs/lows and accumulate volume.
/// Any event type other than ticks and bars passes straight through.
pub struct CoalescingProxy {
    window: Duration,
    sink: EventSink,
    pending: Arc<Mutex<HashMap<CoalesceKey, Event>>>,
    merged_total: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl CoalescingProxy {
    pub fn new(window: Duration, sink: EventSink) -> Self {
        Self {
            window,
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
            merged_total: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            flusher: Mutex::new(None),
        }
    }

    /// Start the window flusher thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        let window = self.window;

        let handle = std::thread::Builder::new()
            .name("tarn-coalesce".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    std::thread::sleep(window);
                    let drained: Vec<Event> = {
                        let mut map = pending.lock();
                        map.drain().map(|(_, ev)| ev).collect()
                    };
                    for event in drained {
                        sink(event);
                    }
                }
            })
            .expect("failed to spawn coalescing flusher");

        *self.flusher.lock() = Some(handle);
        info!(window_ms = self.window.as_millis() as u64, "coalescing proxy started");
    }

    /// Stop the flusher and flush whatever is pending. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        let drained: Vec<Event> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, ev)| ev).collect()
        };
        for event in drained {
            (self.sink)(event);
        }
    }

    /// Submit an event. Ticks and bars are held for the current window;
    /// everything else goes straight to the sink.
    pub fn submit(&self, event: Event) {
        let mergeable = matches!(
            event.event_type,
            EventType::MarketTick | EventType::MarketBar
        );
        let symbol = event.str_field("symbol").map(str::to_owned);

        match (mergeable, symbol) {
            (true, Some(symbol)) => {
                let key = CoalesceKey {
                    type_name: event.event_type.name().to_string(),
                    symbol,
                };
                let mut pending = self.pending.lock();
                match pending.remove(&key) {
                    Some(prior) => {
                        let merged = merge_events(prior, event);
                        self.merged_total.fetch_add(1, Ordering::Relaxed);
                        pending.insert(key, merged);
                    }
                    None => {
                        pending.insert(key, event);
                    }
                }
            }
            _ => (self.sink)(event),
        }
    }

    /// Events that were merged away (not individually delivered).
    pub fn merged_count(&self) -> u64 {
        self.merged_total.load(Ordering::Relaxed)
    }
}

fn num(event: &Event, key: &str) -> f64 {
    event.f64_field(key).unwrap_or(0.0)
}

/// Merge `next` into `prior` according to the stream's semantics.
fn merge_events(prior: Event, next: Event) -> Event {
    let mut merged = next;
    match merged.event_type {
        EventType::MarketTick => {
            // Latest tick wins; volume and turnover accumulate
            let volume = num(&prior, "volume") + num(&merged, "volume");
            let turnover = num(&prior, "turnover") + num(&merged, "turnover");
            merged.payload.insert("volume".into(), Value::from(volume));
            merged
                .payload
                .insert("turnover".into(), Value::from(turnover));
        }
        EventType::MarketBar => {
            let high = num(&prior, "high").max(num(&merged, "high"));
            let low = if prior.payload.contains_key("low") {
                num(&prior, "low").min(num(&merged, "low"))
            } else {
                num(&merged, "low")
            };
            let volume = num(&prior, "volume") + num(&merged, "volume");
            // Open of the window is the first bar's open
            if let Some(open) = prior.payload.get("open").cloned() {
                merged.payload.insert("open".into(), open);
            }
            merged.payload.insert("high".into(), Value::from(high));
            merged.payload.insert("low".into(), Value::from(low));
            merged.payload.insert("volume".into(), Value::from(volume));
        }
        _ => {}
    }
    merged
}

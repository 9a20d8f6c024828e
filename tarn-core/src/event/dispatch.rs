//! Handler dispatch on segregated worker pools
//!
//! Fourth pipeline stage. Handlers declare whether they are I/O-bound or
//! CPU-bound; the dispatcher runs the former on a wide pool (threads spend
//! their time blocked) and the latter on a pool sized near the CPU count.
//!
//! Isolation: every handler invocation is wrapped in `catch_unwind`. A
//! panicking or erroring handler is logged and counted; it never stalls the
//! shard worker or affects sibling handlers. Repeated failures feed the
//! bus-level circuit breaker through the failure hook.

use super::pool::EventPool;
use super::types::Event;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Default I/O pool width.
pub const DEFAULT_IO_WORKERS: usize = 32;

/// Whether a handler mostly blocks on I/O or burns CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Io,
    Cpu,
}

type HandlerFn = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;

/// A registered handler with its failure counter.
pub struct HandlerEntry {
    name: String,
    kind: HandlerKind,
    func: Box<HandlerFn>,
    errors: AtomicU64,
    invocations: AtomicU64,
}

impl HandlerEntry {
    pub fn new<F>(name: impl Into<String>, kind: HandlerKind, func: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            func: Box::new(func),
            errors: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

/// Shared ownership of an in-flight event.
///
/// Handlers receive `&Event` through this guard; when the last clone drops
/// (all handlers finished), the event is reset and returned to the pool.
/// Handlers must not stash the reference past return, which the borrow
/// checker enforces for them.
pub struct InFlightEvent {
    event: Option<Event>,
    pool: EventPool,
}

impl InFlightEvent {
    pub fn new(event: Event, pool: EventPool) -> Self {
        Self {
            event: Some(event),
            pool,
        }
    }

    pub fn event(&self) -> &Event {
        // Only None after drop, which cannot be observed
        self.event.as_ref().unwrap()
    }
}

impl Drop for InFlightEvent {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.pool.release(event);
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed pool of worker threads fed from an unbounded channel.
///
/// Bounding happens upstream at the shard queues; the pool channel only
/// ever holds the handler fan-out of events already admitted.
struct WorkerPool {
    sender: parking_lot::Mutex<Option<Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(name: &'static str, size: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..size.max(1))
            .map(|i| {
                let receiver: Receiver<Job> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn dispatch worker")
            })
            .collect();
        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            workers: parking_lot::Mutex::new(workers),
        }
    }

    fn submit(&self, job: Job) {
        // Receivers only disappear at shutdown
        if let Some(sender) = &*self.sender.lock() {
            let _ = sender.send(job);
        }
    }

    /// Drop the sender and join workers; pending jobs run to completion.
    fn shutdown(&self) {
        self.sender.lock().take();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Hook invoked on every handler failure: (handler name, error text).
pub type FailureHook = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Hook invoked with the execution latency of every handler call.
pub type LatencyHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// The dispatcher: owns both pools and the isolation logic.
pub struct Dispatcher {
    io_pool: WorkerPool,
    cpu_pool: WorkerPool,
    failure_hook: FailureHook,
    latency_hook: LatencyHook,
    dispatched: Arc<AtomicU64>,
    handler_errors: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(io_workers: usize, cpu_workers: usize) -> Self {
        Self {
            io_pool: WorkerPool::new("tarn-io", io_workers),
            cpu_pool: WorkerPool::new("tarn-cpu", cpu_workers),
            failure_hook: Arc::new(|_, _| {}),
            latency_hook: Arc::new(|_| {}),
            dispatched: Arc::new(AtomicU64::new(0)),
            handler_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pool sizes from the environment: wide I/O pool, CPU pool at core count.
    pub fn with_default_sizing() -> Self {
        let cpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(DEFAULT_IO_WORKERS, cpu)
    }

    pub fn set_failure_hook(&mut self, hook: FailureHook) {
        self.failure_hook = hook;
    }

    pub fn set_latency_hook(&mut self, hook: LatencyHook) {
        self.latency_hook = hook;
    }

    /// Fan an event out to its handlers. The event returns to the pool when
    /// the last handler finishes; with no handlers it returns immediately.
    pub fn dispatch(&self, event: Event, handlers: Vec<Arc<HandlerEntry>>, pool: &EventPool) {
        if handlers.is_empty() {
            pool.release(event);
            return;
        }

        let shared = Arc::new(InFlightEvent::new(event, pool.clone()));
        for handler in handlers {
            let shared = Arc::clone(&shared);
            let failure_hook = Arc::clone(&self.failure_hook);
            let latency_hook = Arc::clone(&self.latency_hook);
            let dispatched = Arc::clone(&self.dispatched);
            let handler_errors = Arc::clone(&self.handler_errors);
            let kind = handler.kind;

            let job: Job = Box::new(move || {
                let started = Instant::now();
                handler.invocations.fetch_add(1, Ordering::Relaxed);

                let outcome = catch_unwind(AssertUnwindSafe(|| (handler.func)(shared.event())));

                latency_hook(started.elapsed());
                dispatched.fetch_add(1, Ordering::Relaxed);

                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        handler.errors.fetch_add(1, Ordering::Relaxed);
                        handler_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(handler = handler.name(), %err, "event handler failed");
                        failure_hook(handler.name(), &err.to_string());
                    }
                    Err(panic) => {
                        handler.errors.fetch_add(1, Ordering::Relaxed);
                        handler_errors.fetch_add(1, Ordering::Relaxed);
                        let msg = panic_message(&panic);
                        error!(handler = handler.name(), msg, "event handler panicked");
                        failure_hook(handler.name(), &msg);
                    }
                }
            });

            match kind {
                HandlerKind::Io => self.io_pool.submit(job),
                HandlerKind::Cpu => self.cpu_pool.submit(job),
            }
        }
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn handler_error_count(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    /// Drain outstanding jobs and stop the pools. Idempotent.
    pub fn shutdown(&self) {
        self.io_pool.shutdown();
        self.cpu_pool.shutdown();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<opaque panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::EventType;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_dispatch_runs_all_handlers() {
        let dispatcher = Dispatcher::new(2, 2);
        let pool = EventPool::new(8);
        let hits = Arc::new(AtomicU64::new(0));

        let handlers: Vec<_> = (0..3)
            .map(|i| {
                let hits = Arc::clone(&hits);
                Arc::new(HandlerEntry::new(
                    format!("h{}", i),
                    HandlerKind::Cpu,
                    move |_| {
                        hits.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    },
                ))
            })
            .collect();

        dispatcher.dispatch(Event::new(EventType::System, "t"), handlers, &pool);
        wait_until(|| hits.load(Ordering::Relaxed) == 3);
    }

    #[test]
    fn test_event_returns_to_pool_after_handlers() {
        let dispatcher = Dispatcher::new(1, 1);
        let pool = EventPool::new(8);
        let handler = Arc::new(HandlerEntry::new("h", HandlerKind::Io, |_| Ok(())));

        dispatcher.dispatch(Event::new(EventType::System, "t"), vec![handler], &pool);
        wait_until(|| pool.available(&EventType::System) == 1);
    }

    #[test]
    fn test_no_handlers_releases_immediately() {
        let dispatcher = Dispatcher::new(1, 1);
        let pool = EventPool::new(8);
        dispatcher.dispatch(Event::new(EventType::System, "t"), vec![], &pool);
        assert_eq!(pool.available(&EventType::System), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new(1, 1);
        let pool = EventPool::new(8);
        let survived = Arc::new(AtomicU64::new(0));

        let panicking = Arc::new(HandlerEntry::new("boom", HandlerKind::Cpu, |_| {
            panic!("handler bug")
        }));
        let healthy = {
            let survived = Arc::clone(&survived);
            Arc::new(HandlerEntry::new("ok", HandlerKind::Cpu, move |_| {
                survived.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))
        };

        dispatcher.dispatch(
            Event::new(EventType::System, "t"),
            vec![Arc::clone(&panicking), healthy],
            &pool,
        );

        wait_until(|| survived.load(Ordering::Relaxed) == 1);
        wait_until(|| panicking.error_count() == 1);
        assert_eq!(dispatcher.handler_error_count(), 1);
    }

    #[test]
    fn test_failure_hook_sees_error_text() {
        let mut dispatcher = Dispatcher::new(1, 1);
        let pool = EventPool::new(8);
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            dispatcher.set_failure_hook(Arc::new(move |name, err| {
                seen.lock().push((name.to_string(), err.to_string()));
            }));
        }

        let failing = Arc::new(HandlerEntry::new("db-writer", HandlerKind::Io, |_| {
            Err(anyhow::anyhow!("connection refused"))
        }));
        dispatcher.dispatch(Event::new(EventType::System, "t"), vec![failing], &pool);

        wait_until(|| !seen.lock().is_empty());
        let entries = seen.lock();
        assert_eq!(entries[0].0, "db-writer");
        assert!(entries[0].1.contains("connection refused"));
    }

    #[test]
    fn test_shutdown_drains_pending_jobs() {
        let dispatcher = Dispatcher::new(1, 1);
        let pool = EventPool::new(64);
        let hits = Arc::new(AtomicU64::new(0));

        for _ in 0..20 {
            let hits = Arc::clone(&hits);
            let handler = Arc::new(HandlerEntry::new("slowish", HandlerKind::Cpu, move |_| {
                std::thread::sleep(Duration::from_millis(1));
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));
            dispatcher.dispatch(Event::new(EventType::System, "t"), vec![handler], &pool);
        }

        dispatcher.shutdown();
        assert_eq!(hits.load(Ordering::Relaxed), 20);
    }
}

//! Priority-ordered publish/subscribe event bus.
//!
//! ```text
//! ┌─────────────┐  push   ┌───────────────┐  process()   ┌─────────────┐
//! │ publish()   │────────▶│  ArrayQueue   │─────────────▶│ subscribers │
//! │ publish_isr │────────▶│  (lock-free)  │ drain + sort │ (by pattern)│
//! └─────────────┘         └───────────────┘              └─────────────┘
//! ```
//!
//! The queue is a bounded lock-free ring so the ISR-side publish never
//! blocks and never allocates inside a lock. `process()` is the
//! cooperative drain the scheduler calls every tick: it pulls *all*
//! currently queued events, stable-sorts them by priority, and dispatches
//! within a wall-time budget. Within one `process()` call a CRITICAL
//! event always runs before a LOW event regardless of enqueue order;
//! equal priorities keep FIFO order. The bus does not reorder across
//! calls beyond what that policy implies.
//!
//! Subscriptions may only be registered from the application thread; code
//! on other threads must route registration through a command posted to
//! the application thread.

use crossbeam_queue::ArrayQueue;
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::{pattern, time};

/// Default queue capacity when none is given.
pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// Smoothing factor for the per-event process-time moving average.
const AVG_ALPHA: f64 = 0.3;

// ═══════════════════════════════════════════════════════════════
//  Events
// ═══════════════════════════════════════════════════════════════

/// Dispatch priority. Lower discriminant = dispatched earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// A queued event. Owned by the bus between enqueue and dispatch;
/// subscribers receive a shared reference for the duration of their call.
#[derive(Debug, Clone)]
pub struct Event {
    /// Dot-separated type hierarchy, e.g. `sensor.reading`.
    pub event_type: String,
    pub payload: Value,
    pub priority: EventPriority,
    pub timestamp_ms: u64,
}

impl Event {
    pub fn new(event_type: &str, payload: Value, priority: EventPriority) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            priority,
            timestamp_ms: time::now_ms(),
        }
    }
}

/// Well-known event types published by the core.
pub mod topics {
    pub const SENSOR_READING: &str = "sensor.reading";
    pub const SENSOR_ERROR: &str = "sensor.error";
    pub const SENSOR_CALIBRATION_COMPLETE: &str = "sensor.calibration_complete";
    pub const ACTUATOR_COMMAND: &str = "actuator.command";
    pub const ACTUATOR_EMERGENCY_STOP: &str = "actuator.emergency_stop";
    pub const SYSTEM_HEARTBEAT: &str = "system.heartbeat";
    pub const SYSTEM_HEALTH_WARNING: &str = "system.health_warning";
    pub const SYSTEM_RESTART_REQUESTED: &str = "system.restart_requested";
    pub const SYSTEM_FATAL: &str = "system.fatal";
}

// ═══════════════════════════════════════════════════════════════
//  Subscriptions
// ═══════════════════════════════════════════════════════════════

/// Subscriber callback.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Publish-side filter: return `false` to reject an event before it is
/// queued (rejected events are treated as successfully published).
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct BusSubscription {
    handle: u32,
    pattern: String,
    handler: EventHandler,
    call_count: AtomicU32,
}

// ═══════════════════════════════════════════════════════════════
//  Statistics
// ═══════════════════════════════════════════════════════════════

/// Bus counters. `avg_process_us` is an exponential moving average of the
/// per-event dispatch time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusStats {
    pub total_published: u64,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub queue_depth: usize,
    pub avg_process_us: f64,
}

// ═══════════════════════════════════════════════════════════════
//  EventBus
// ═══════════════════════════════════════════════════════════════

/// The bounded priority-discipline event bus.
pub struct EventBus {
    queue: RwLock<Arc<ArrayQueue<Event>>>,
    subscriptions: Mutex<Vec<Arc<BusSubscription>>>,
    filter: Mutex<Option<EventFilter>>,
    app_thread: Mutex<ThreadId>,
    next_handle: AtomicU32,
    paused: AtomicBool,
    total_published: AtomicU64,
    total_processed: AtomicU64,
    total_dropped: AtomicU64,
    /// EMA of per-event dispatch time, stored as f64 bits.
    avg_process_us: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given queue capacity. The calling thread
    /// becomes the application thread for the subscribe check.
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue: RwLock::new(Arc::new(ArrayQueue::new(queue_size.max(1)))),
            subscriptions: Mutex::new(Vec::new()),
            filter: Mutex::new(None),
            app_thread: Mutex::new(thread::current().id()),
            next_handle: AtomicU32::new(1),
            paused: AtomicBool::new(false),
            total_published: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            avg_process_us: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Re-initialize: drop all pending events, reset statistics, and
    /// resize the queue. Idempotent — safe to call repeatedly.
    pub fn init(&self, queue_size: usize) {
        let fresh = Arc::new(ArrayQueue::new(queue_size.max(1)));
        let old = {
            let mut slot = self.queue.write();
            std::mem::replace(&mut *slot, fresh)
        };
        let mut discarded = 0usize;
        while old.pop().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("bus init: discarded {discarded} pending events");
        }
        *self.app_thread.lock() = thread::current().id();
        self.paused.store(false, Ordering::Relaxed);
        self.reset_stats();
    }

    // ── Publish ───────────────────────────────────────────────

    /// Queue an event for the next `process()` call.
    ///
    /// A full queue drops the event, counts it, and returns
    /// `ResourceExhausted`. A filter rejection is success.
    pub fn publish(&self, event_type: &str, payload: Value, priority: EventPriority) -> Result<()> {
        let event = Event::new(event_type, payload, priority);
        self.total_published.fetch_add(1, Ordering::Relaxed);

        if let Some(filter) = self.filter.lock().clone() {
            if !filter(&event) {
                return Ok(());
            }
        }

        let queue = self.queue.read().clone();
        if let Err(rejected) = queue.push(event) {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::resource_exhausted(format!(
                "event queue full, dropped '{}'",
                rejected.event_type
            )));
        }
        Ok(())
    }

    /// ISR-safe publish: never blocks. Uses try-locks for the filter and
    /// queue handle; contention counts as a drop, matching the lossy
    /// semantics of a saturated interrupt path.
    pub fn publish_from_isr(
        &self,
        event_type: &str,
        payload: Value,
        priority: EventPriority,
    ) -> Result<()> {
        let event = Event::new(event_type, payload, priority);
        self.total_published.fetch_add(1, Ordering::Relaxed);

        if let Some(filter_slot) = self.filter.try_lock() {
            if let Some(filter) = filter_slot.clone() {
                drop(filter_slot);
                if !filter(&event) {
                    return Ok(());
                }
            }
        }

        let Some(queue_slot) = self.queue.try_read() else {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::resource_exhausted("bus re-initializing"));
        };
        let queue = queue_slot.clone();
        drop(queue_slot);

        if queue.push(event).is_err() {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::resource_exhausted("event queue full (ISR)"));
        }
        Ok(())
    }

    /// Install or clear the process-wide publish filter.
    pub fn set_filter(&self, filter: Option<EventFilter>) {
        *self.filter.lock() = filter;
    }

    // ── Subscribe ─────────────────────────────────────────────

    /// Register a handler for event types matching `pattern`.
    ///
    /// Must be called from the application thread; other threads get
    /// `InvalidState`. Handles are ≥ 1 and never reused within a run.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<u32>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if thread::current().id() != *self.app_thread.lock() {
            return Err(Error::invalid_state(
                "subscribe called off the application thread",
            ));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().push(Arc::new(BusSubscription {
            handle,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
            call_count: AtomicU32::new(0),
        }));
        Ok(handle)
    }

    /// Remove the subscription with `handle`. Unknown handles are a no-op.
    pub fn unsubscribe(&self, handle: u32) {
        let mut subs = self.subscriptions.lock();
        if let Some(pos) = subs.iter().position(|s| s.handle == handle) {
            subs.remove(pos);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    // ── Process ───────────────────────────────────────────────

    /// Pause dispatch. Publishes still succeed; `process()` returns 0.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resume dispatch.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Cooperative drain. Pulls all queued events, stable-sorts by
    /// priority, dispatches until `max_ms` of wall time has elapsed, and
    /// re-enqueues the remainder. Returns the number dispatched.
    pub fn process(&self, max_ms: u64) -> usize {
        if self.is_paused() {
            return 0;
        }
        let queue = self.queue.read().clone();

        let mut batch = Vec::new();
        while let Some(event) = queue.pop() {
            batch.push(event);
        }
        if batch.is_empty() {
            return 0;
        }
        // Stable: FIFO order within equal priorities is preserved.
        batch.sort_by_key(|e| e.priority);

        let started = Instant::now();
        let mut processed = 0usize;
        let mut iter = batch.into_iter();
        while let Some(event) = iter.next() {
            if started.elapsed().as_millis() as u64 > max_ms {
                // Out of budget: push the remainder back for the next call.
                for leftover in std::iter::once(event).chain(iter.by_ref()) {
                    if queue.push(leftover).is_err() {
                        self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                break;
            }
            self.dispatch(&event);
            processed += 1;
        }
        processed
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            queue_depth: self.queue.read().len(),
            avg_process_us: f64::from_bits(self.avg_process_us.load(Ordering::Relaxed)),
        }
    }

    /// Zero all counters.
    pub fn reset_stats(&self) {
        self.total_published.store(0, Ordering::Relaxed);
        self.total_processed.store(0, Ordering::Relaxed);
        self.total_dropped.store(0, Ordering::Relaxed);
        self.avg_process_us.store(0f64.to_bits(), Ordering::Relaxed);
    }

    // ── Internal ──────────────────────────────────────────────

    fn dispatch(&self, event: &Event) {
        let matching: Vec<_> = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .filter(|s| pattern::matches(&s.pattern, &event.event_type))
                .cloned()
                .collect()
        };

        let started = Instant::now();
        for sub in matching {
            sub.call_count.fetch_add(1, Ordering::Relaxed);
            let result = catch_unwind(AssertUnwindSafe(|| (sub.handler)(event)));
            if result.is_err() {
                error!(
                    "event handler {} ('{}') panicked on '{}'",
                    sub.handle, sub.pattern, event.event_type
                );
            }
        }
        self.total_processed.fetch_add(1, Ordering::Relaxed);

        let elapsed_us = started.elapsed().as_micros() as f64;
        let prev = f64::from_bits(self.avg_process_us.load(Ordering::Relaxed));
        let next = if prev == 0.0 {
            elapsed_us
        } else {
            AVG_ALPHA * elapsed_us + (1.0 - AVG_ALPHA) * prev
        };
        self.avg_process_us.store(next.to_bits(), Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording_bus(queue_size: usize) -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new(queue_size));
        let record = Arc::new(Mutex::new(Vec::new()));
        let record2 = record.clone();
        bus.subscribe("*", move |e: &Event| {
            record2.lock().push(e.event_type.clone());
        })
        .unwrap();
        (bus, record)
    }

    #[test]
    fn priority_drain_order() {
        let (bus, record) = recording_bus(16);
        bus.publish("a", json!({}), EventPriority::Low).unwrap();
        bus.publish("b", json!({}), EventPriority::Critical).unwrap();
        bus.publish("c", json!({}), EventPriority::Normal).unwrap();
        bus.publish("d", json!({}), EventPriority::High).unwrap();

        let n = bus.process(100);
        assert_eq!(n, 4);
        assert_eq!(*record.lock(), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let (bus, record) = recording_bus(16);
        for name in ["n1", "n2", "n3"] {
            bus.publish(name, json!({}), EventPriority::Normal).unwrap();
        }
        bus.process(100);
        assert_eq!(*record.lock(), vec!["n1", "n2", "n3"]);
    }

    #[test]
    fn queue_saturation_drops_and_counts() {
        let bus = EventBus::new(4);
        for i in 0..8 {
            let r = bus.publish(&format!("e{i}"), json!({}), EventPriority::Normal);
            if i < 4 {
                r.unwrap();
            } else {
                assert!(r.is_err());
            }
        }
        let stats = bus.stats();
        assert_eq!(stats.total_published, 8);
        assert_eq!(stats.total_dropped, 4);
        assert_eq!(stats.queue_depth, 4);
    }

    #[test]
    fn pause_defers_delivery() {
        let (bus, record) = recording_bus(16);
        bus.pause();
        bus.publish("x", json!({}), EventPriority::Normal).unwrap();
        assert_eq!(bus.process(100), 0);
        assert!(record.lock().is_empty());

        bus.resume();
        assert_eq!(bus.process(100), 1);
        assert_eq!(*record.lock(), vec!["x"]);
    }

    #[test]
    fn pattern_subscription_filters_types() {
        let bus = EventBus::new(16);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits2 = hits.clone();
        bus.subscribe("sensor.*", move |e: &Event| {
            hits2.lock().push(e.event_type.clone());
        })
        .unwrap();

        bus.publish(topics::SENSOR_READING, json!({}), EventPriority::Normal)
            .unwrap();
        bus.publish(topics::ACTUATOR_COMMAND, json!({}), EventPriority::Normal)
            .unwrap();
        bus.process(100);
        assert_eq!(*hits.lock(), vec![topics::SENSOR_READING]);
    }

    #[test]
    fn filter_rejection_is_success_not_drop() {
        let bus = EventBus::new(4);
        bus.set_filter(Some(Arc::new(|e: &Event| {
            !e.event_type.starts_with("noise.")
        })));
        bus.publish("noise.tick", json!({}), EventPriority::Low)
            .unwrap();
        bus.publish("signal", json!({}), EventPriority::Normal)
            .unwrap();
        let stats = bus.stats();
        assert_eq!(stats.total_published, 2);
        assert_eq!(stats.total_dropped, 0);
        assert_eq!(stats.queue_depth, 1);
    }

    #[test]
    fn init_discards_pending_and_resets_stats() {
        let bus = EventBus::new(4);
        bus.publish("a", json!({}), EventPriority::Normal).unwrap();
        bus.init(8);
        let stats = bus.stats();
        assert_eq!(stats.total_published, 0);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(bus.process(100), 0);
    }

    #[test]
    fn subscribe_off_app_thread_is_rejected() {
        let bus = Arc::new(EventBus::new(4));
        let bus2 = bus.clone();
        let joined = thread::spawn(move || bus2.subscribe("*", |_| {}).is_err())
            .join()
            .unwrap();
        assert!(joined);
        // ISR-style publish from another thread is allowed.
        let bus3 = bus.clone();
        thread::spawn(move || {
            bus3.publish_from_isr("isr.tick", json!({}), EventPriority::Critical)
                .unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(bus.stats().queue_depth, 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new(8);
        bus.subscribe("*", |_| panic!("handler bug")).unwrap();
        let reached = Arc::new(AtomicU32::new(0));
        let reached2 = reached.clone();
        bus.subscribe("*", move |_| {
            reached2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        bus.publish("x", json!({}), EventPriority::Normal).unwrap();
        assert_eq!(bus.process(100), 1);
        assert_eq!(reached.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn budget_exhaustion_requeues_remainder() {
        let bus = EventBus::new(16);
        bus.subscribe("*", |_| {
            std::thread::sleep(std::time::Duration::from_millis(5));
        })
        .unwrap();
        for i in 0..6 {
            bus.publish(&format!("e{i}"), json!({}), EventPriority::Normal)
                .unwrap();
        }
        // 5 ms per event against a ~8 ms budget: only a prefix fits.
        let first = bus.process(8);
        assert!(first >= 1 && first < 6, "processed {first}");
        let second = bus.process(1000);
        assert_eq!(first + second, 6);
    }

    #[test]
    fn handles_are_monotonic_and_unsubscribe_idempotent() {
        let bus = EventBus::new(4);
        let h1 = bus.subscribe("*", |_| {}).unwrap();
        let h2 = bus.subscribe("*", |_| {}).unwrap();
        assert!(h1 >= 1 && h2 > h1);
        bus.unsubscribe(h1);
        bus.unsubscribe(h1);
        assert_eq!(bus.subscription_count(), 1);
    }
}

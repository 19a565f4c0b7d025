//! Cooperative fixed-tick scheduler.
//!
//! Single-threaded dispatch on a fixed period (default 10 ms). Each
//! tick:
//!
//! 1. Drain the event bus inside a bounded time budget (default 2 ms).
//! 2. Update every RUNNING module in priority-then-registration order,
//!    measuring per-module wall time. A module that blows through its
//!    `max_update_us` gets a warning and an overrun count — never a
//!    kill — and is marked unhealthy only after repeated overruns.
//! 3. Fold the busy/elapsed ratio into the CPU-usage estimate
//!    (exponential moving average; no platform idle counter on host,
//!    so the ratio estimator is the one in use).
//! 4. Sleep precisely to the next tick boundary. An overrunning tick
//!    skips the sleep and is recorded; ticks are delayed, never
//!    reordered.
//!
//! [`tick_once`](Scheduler::tick_once) is public so tests and the
//! application's shutdown path can drive the loop deterministically.

use heapless::HistoryBuffer;
use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::bus::EventBus;
use crate::heartbeat::HeartbeatMonitor;
use crate::module::ModuleState;
use crate::module::lifecycle::ModuleSet;

/// Smoothing factor for the CPU-usage moving average.
const CPU_EMA_ALPHA: f64 = 0.3;

/// Scheduler tuning. Defaults match the firmware's stock profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_period_ms: u64,
    pub bus_budget_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 10,
            bus_budget_ms: 2,
        }
    }
}

/// Counters shared with observers (system monitor, diagnostics).
#[derive(Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    tick_overruns: AtomicU64,
    module_overruns: AtomicU64,
    /// EMA of busy/elapsed, stored as f64 bits.
    cpu_usage_bits: AtomicU64,
}

impl SchedulerStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn tick_overruns(&self) -> u64 {
        self.tick_overruns.load(Ordering::Relaxed)
    }

    pub fn module_overruns(&self) -> u64 {
        self.module_overruns.load(Ordering::Relaxed)
    }

    /// Smoothed CPU usage, 0.0–1.0. Derived from measured busy time, not
    /// a constant.
    pub fn cpu_usage(&self) -> f64 {
        f64::from_bits(self.cpu_usage_bits.load(Ordering::Relaxed))
    }

    fn fold_cpu_sample(&self, busy: Duration, elapsed: Duration) {
        let ratio = if elapsed.is_zero() {
            0.0
        } else {
            (busy.as_secs_f64() / elapsed.as_secs_f64()).clamp(0.0, 1.0)
        };
        let prev = self.cpu_usage();
        let next = if self.ticks() <= 1 {
            ratio
        } else {
            CPU_EMA_ALPHA * ratio + (1.0 - CPU_EMA_ALPHA) * prev
        };
        self.cpu_usage_bits.store(next.to_bits(), Ordering::Relaxed);
    }
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub events_processed: usize,
    pub modules_updated: usize,
    pub module_overruns: u32,
}

/// The cooperative dispatch loop.
pub struct Scheduler {
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    /// Recent per-tick busy times, microseconds, for diagnostics.
    busy_history: HistoryBuffer<u32, 32>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            stats: Arc::new(SchedulerStats::default()),
            busy_history: HistoryBuffer::new(),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Re-tune the loop (applied from the `system` config section at
    /// boot). Statistics and history carry over.
    pub fn set_config(&mut self, config: SchedulerConfig) {
        self.config = config;
    }

    /// Shared counters; clone the handle into observers.
    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Mean of the recorded recent busy times, microseconds.
    pub fn recent_busy_mean_us(&self) -> u32 {
        let len = self.busy_history.len();
        if len == 0 {
            return 0;
        }
        let sum: u64 = self
            .busy_history
            .as_slice()
            .iter()
            .map(|&us| u64::from(us))
            .sum();
        (sum / len as u64) as u32
    }

    /// One tick: bus drain, then module updates. Does not sleep.
    pub fn tick_once(
        &mut self,
        modules: &mut ModuleSet,
        bus: &EventBus,
        heartbeat: &HeartbeatMonitor,
    ) -> TickReport {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport {
            events_processed: bus.process(self.config.bus_budget_ms),
            ..TickReport::default()
        };

        let order: Vec<usize> = modules.update_order().to_vec();
        for idx in order {
            let record = &mut modules.records_mut()[idx];
            if record.state != ModuleState::Running {
                continue;
            }
            let started = Instant::now();
            let result = record.instance.update();
            let elapsed_us = started.elapsed().as_micros() as u64;

            match result {
                Ok(()) => heartbeat.observe(&record.name),
                Err(e) => warn!("module '{}': update failed: {e}", record.name),
            }

            if elapsed_us > u64::from(record.max_update_us) {
                record.overruns = record.overruns.wrapping_add(1);
                record.consecutive_overruns = record.consecutive_overruns.wrapping_add(1);
                report.module_overruns += 1;
                self.stats.module_overruns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "module '{}': update took {elapsed_us} us (budget {} us, overrun #{})",
                    record.name, record.max_update_us, record.overruns
                );
            } else {
                record.consecutive_overruns = 0;
            }
            report.modules_updated += 1;
        }
        report
    }

    /// Sleep out the remainder of the tick period and fold timing
    /// statistics. An overrunning tick skips the sleep and is recorded —
    /// ticks are delayed, never reordered. Returns true on overrun.
    pub fn pace(&mut self, tick_start: Instant) -> bool {
        let period = Duration::from_millis(self.config.tick_period_ms.max(1));
        let busy = tick_start.elapsed();
        self.busy_history
            .write(busy.as_micros().min(u128::from(u32::MAX)) as u32);

        let overran = busy >= period;
        if overran {
            self.stats.tick_overruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                "tick overrun: busy {} us exceeds period {} us",
                busy.as_micros(),
                period.as_micros()
            );
        } else {
            spin_sleep::sleep(period - busy);
        }
        let elapsed = tick_start.elapsed();
        self.stats.fold_cpu_sample(busy, elapsed);
        overran
    }

    /// Run the loop until `stop` is raised. Blocks the calling
    /// (application) thread.
    pub fn run(
        &mut self,
        modules: &mut ModuleSet,
        bus: &EventBus,
        heartbeat: &HeartbeatMonitor,
        stop: &AtomicBool,
    ) {
        while !stop.load(Ordering::Relaxed) {
            let tick_start = Instant::now();
            self.tick_once(modules, bus, heartbeat);
            self.pace(tick_start);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::heartbeat::RecoveryPolicy;
    use crate::module::lifecycle::ModuleRecord;
    use crate::module::{Module, ModuleType};
    use parking_lot::Mutex;
    use serde_json::Value;

    struct Paced {
        tag: &'static str,
        delay: Duration,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Module for Paced {
        fn name(&self) -> &'static str {
            self.tag
        }
        fn configure(&mut self, _: &Value) -> Result<()> {
            Ok(())
        }
        fn init(&mut self) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn update(&mut self) -> Result<()> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.log.lock().push(self.tag);
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn paced_record(
        tag: &'static str,
        module_type: ModuleType,
        delay: Duration,
        budget_us: u32,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> ModuleRecord {
        ModuleRecord {
            name: tag.to_string(),
            module_type,
            priority: 0,
            state: ModuleState::Running,
            max_update_us: budget_us,
            config_section: "system".to_string(),
            dependencies: Vec::new(),
            instance: Box::new(Paced {
                tag,
                delay,
                log: log.clone(),
            }),
            overruns: 0,
            consecutive_overruns: 0,
            restarts: 0,
        }
    }

    fn harness() -> (EventBus, HeartbeatMonitor) {
        (
            EventBus::new(32),
            HeartbeatMonitor::new(RecoveryPolicy::Warn, 3),
        )
    }

    #[test]
    fn modules_update_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::new(vec![
            paced_record("bg", ModuleType::Background, Duration::ZERO, 100_000, &log),
            paced_record("crit", ModuleType::Critical, Duration::ZERO, 100_000, &log),
        ]);
        let (bus, heartbeat) = harness();
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        let report = scheduler.tick_once(&mut modules, &bus, &heartbeat);
        assert_eq!(report.modules_updated, 2);
        assert_eq!(*log.lock(), vec!["crit", "bg"]);
    }

    #[test]
    fn budget_overrun_is_counted_and_others_still_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::new(vec![
            paced_record("slow", ModuleType::High, Duration::from_millis(3), 1_000, &log),
            paced_record("fast", ModuleType::Standard, Duration::ZERO, 100_000, &log),
        ]);
        let (bus, heartbeat) = harness();
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        let report = scheduler.tick_once(&mut modules, &bus, &heartbeat);

        assert_eq!(report.module_overruns, 1);
        assert_eq!(modules.get("slow").unwrap().overruns, 1);
        assert_eq!(modules.get("fast").unwrap().overruns, 0);
        assert_eq!(*log.lock(), vec!["slow", "fast"]);
    }

    #[test]
    fn repeated_overruns_mark_unhealthy() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::new(vec![paced_record(
            "slow",
            ModuleType::Standard,
            Duration::from_millis(2),
            100,
            &log,
        )]);
        let (bus, heartbeat) = harness();
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        for _ in 0..5 {
            scheduler.tick_once(&mut modules, &bus, &heartbeat);
        }
        assert!(!modules.get("slow").unwrap().is_healthy());
    }

    #[test]
    fn errored_modules_are_excluded_from_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut record = paced_record("dead", ModuleType::Standard, Duration::ZERO, 1000, &log);
        record.state = ModuleState::Error;
        let mut modules = ModuleSet::new(vec![record]);
        let (bus, heartbeat) = harness();
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        let report = scheduler.tick_once(&mut modules, &bus, &heartbeat);
        assert_eq!(report.modules_updated, 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn run_loop_ticks_until_stopped_and_estimates_cpu() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::new(vec![paced_record(
            "m",
            ModuleType::Standard,
            Duration::from_millis(1),
            100_000,
            &log,
        )]);
        let (bus, heartbeat) = harness();
        let mut scheduler = Scheduler::new(SchedulerConfig {
            tick_period_ms: 5,
            bus_budget_ms: 1,
        });
        let stats = scheduler.stats();
        let stop = Arc::new(AtomicBool::new(false));

        let stop2 = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            stop2.store(true, Ordering::Relaxed);
        });
        scheduler.run(&mut modules, &bus, &heartbeat, &stop);

        assert!(stats.ticks() >= 5, "ticks: {}", stats.ticks());
        let cpu = stats.cpu_usage();
        assert!(cpu > 0.0 && cpu <= 1.0, "cpu: {cpu}");
        assert!(scheduler.recent_busy_mean_us() >= 900);
    }

    #[test]
    fn bus_drain_happens_before_module_updates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::new(vec![paced_record(
            "m",
            ModuleType::Standard,
            Duration::ZERO,
            100_000,
            &log,
        )]);
        let (bus, heartbeat) = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe("*", move |e| {
            seen2.lock().push(e.event_type.clone());
        })
        .unwrap();
        bus.publish("tick.test", serde_json::json!({}), crate::bus::EventPriority::Normal)
            .unwrap();

        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        let report = scheduler.tick_once(&mut modules, &bus, &heartbeat);
        assert_eq!(report.events_processed, 1);
        assert_eq!(*seen.lock(), vec!["tick.test".to_string()]);
    }
}

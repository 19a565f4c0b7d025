//! Application controller: boot sequencing, runtime state machine, and
//! graceful shutdown.
//!
//! ```text
//! boot():  Config → Shared State → Event Bus → driver registration
//!            → Module Registry → instantiate → configure → init → start
//!            → Scheduler
//! stop():  Scheduler → modules (reverse order, actuators emergency-stop)
//!            → final bus drain → Config flush
//! ```
//!
//! Any boot failure stops the sequence, publishes `system.fatal`,
//! emergency-stops whatever actuators exist, flushes config, and parks
//! the application in ERROR — the scheduler never runs over a partially
//! initialized module set.

use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::bus::{EventBus, EventPriority, topics};
use crate::config::schema::{FieldRule, FieldType, SectionSchema};
use crate::config::storage::SectionStorage;
use crate::config::ConfigStore;
use crate::drivers::register_builtin_drivers;
use crate::error::{Error, Result};
use crate::hal::Hal;
use crate::heartbeat::{HeartbeatMonitor, RecoveryAction, RecoveryPolicy};
use crate::module::lifecycle::ModuleSet;
use crate::module::registry::ModuleRegistry;
use crate::module::{ModuleState, Runtime};
use crate::scheduler::{Scheduler, SchedulerConfig, TickReport};

/// Top-level application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Created,
    Booting,
    Running,
    Error,
    Stopped,
}

/// Owns the core subsystems and their lifecycles.
pub struct Application {
    state: AppState,
    config: Arc<ConfigStore>,
    shared_state: Arc<crate::state::SharedState>,
    bus: Arc<EventBus>,
    hal: Arc<dyn Hal>,
    registry: ModuleRegistry,
    scheduler: Scheduler,
    heartbeat: HeartbeatMonitor,
    modules: Option<ModuleSet>,
    stop_flag: Arc<AtomicBool>,
}

impl Application {
    /// Wire the core together. Nothing touches storage or hardware until
    /// [`boot`](Self::boot).
    pub fn new(storage: Arc<dyn SectionStorage>, hal: Arc<dyn Hal>) -> Self {
        Self::with_registry(storage, hal, ModuleRegistry::with_builtins())
    }

    /// As [`new`](Self::new) but with a caller-assembled module registry.
    pub fn with_registry(
        storage: Arc<dyn SectionStorage>,
        hal: Arc<dyn Hal>,
        registry: ModuleRegistry,
    ) -> Self {
        Self {
            state: AppState::Created,
            config: Arc::new(ConfigStore::new(storage)),
            shared_state: Arc::new(crate::state::SharedState::new()),
            bus: Arc::new(EventBus::new(crate::bus::DEFAULT_QUEUE_SIZE)),
            hal,
            registry,
            scheduler: Scheduler::new(SchedulerConfig::default()),
            heartbeat: HeartbeatMonitor::new(RecoveryPolicy::Restart, 3),
            modules: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn shared_state(&self) -> &Arc<crate::state::SharedState> {
        &self.shared_state
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// `(name, state)` per module, load order. Empty before boot.
    pub fn module_states(&self) -> Vec<(String, ModuleState)> {
        self.modules.as_ref().map(ModuleSet::states).unwrap_or_default()
    }

    /// Handle for requesting a stop from another thread or a signal
    /// handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    // ── Boot ──────────────────────────────────────────────────

    /// Run the boot sequence. On failure the application is left in
    /// ERROR with actuators stopped and config flushed.
    pub fn boot(&mut self) -> Result<()> {
        if self.state != AppState::Created && self.state != AppState::Stopped {
            return Err(Error::invalid_state(format!(
                "boot from {:?} not allowed",
                self.state
            )));
        }
        self.state = AppState::Booting;
        info!("boot: loading configuration");

        match self.boot_sequence() {
            Ok(()) => {
                self.state = AppState::Running;
                info!("boot complete, {} modules running", self.module_states().len());
                Ok(())
            }
            Err(e) => {
                error!("boot failed: {e}");
                self.enter_error(&e);
                Err(e)
            }
        }
    }

    fn boot_sequence(&mut self) -> Result<()> {
        // 1. Config.
        self.config.load()?;
        install_schemas(&self.config);

        // 2. Shared State is allocation-only; 3. Event Bus sized from config.
        let queue_size = self.config.get("system.bus_queue_size", 32usize);
        self.bus.init(queue_size);

        // 4. Driver registries.
        register_builtin_drivers();

        // 5-6. Instantiate modules in dependency order, deliver config.
        let runtime = Runtime {
            state: self.shared_state.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            hal: self.hal.clone(),
            scheduler_stats: self.scheduler.stats(),
        };
        // The set lives in `self` from here on, so the error path can
        // emergency-stop whatever part of it came up.
        let modules = self.modules.insert(self.registry.instantiate(&runtime)?);
        modules.configure_all(&self.config)?;

        // 7-8. Init and start.
        modules.init_all()?;
        modules.start_all()?;

        // Liveness tracking for everything that reached RUNNING.
        for record in modules.records() {
            if record.state == ModuleState::Running {
                self.heartbeat.register(&record.name, record.module_type);
            }
        }
        self.heartbeat
            .set_enabled(self.config.get("system.heartbeat_enabled", true));

        // 9. Scheduler tuning; the caller starts the loop.
        self.scheduler.set_config(SchedulerConfig {
            tick_period_ms: self.config.get("system.tick_period_ms", 10u64).clamp(1, 1000),
            bus_budget_ms: self.config.get("system.bus_process_budget_ms", 2u64).max(1),
        });

        self.stop_flag.store(false, Ordering::Relaxed);
        Ok(())
    }

    // ── Run ───────────────────────────────────────────────────

    /// One tick: scheduler dispatch plus heartbeat recovery.
    pub fn tick(&mut self) -> TickReport {
        let Some(modules) = self.modules.as_mut() else {
            return TickReport::default();
        };
        if self.state != AppState::Running {
            return TickReport::default();
        }
        let report = self.scheduler.tick_once(modules, &self.bus, &self.heartbeat);

        let mut escalate: Option<String> = None;
        for action in self.heartbeat.check() {
            match action {
                RecoveryAction::Warn { name, age_ms } => {
                    self.bus
                        .publish(
                            topics::SYSTEM_HEALTH_WARNING,
                            serde_json::json!({ "module": name, "silent_ms": age_ms }),
                            EventPriority::High,
                        )
                        .ok();
                }
                RecoveryAction::Restart { name, age_ms } => {
                    self.bus
                        .publish(
                            topics::SYSTEM_RESTART_REQUESTED,
                            serde_json::json!({ "module": name, "silent_ms": age_ms }),
                            EventPriority::High,
                        )
                        .ok();
                    if let Err(e) = modules.restart(&name) {
                        // The module stays in ERROR; the restart cap in
                        // the monitor decides when to give up.
                        error!("recovery restart of '{name}' failed: {e}");
                    }
                }
                RecoveryAction::Escalate { name, .. } => {
                    escalate = Some(name);
                }
            }
        }
        if let Some(name) = escalate {
            let err = Error::fatal(format!("module '{name}' unrecoverable"));
            error!("{err}");
            self.enter_error(&err);
        }
        report
    }

    /// Real-time loop until the stop handle is raised or an escalation
    /// leaves RUNNING. Blocks the application thread.
    pub fn run(&mut self) {
        while self.state == AppState::Running && !self.stop_flag.load(Ordering::Relaxed) {
            let tick_start = Instant::now();
            self.tick();
            self.scheduler.pace(tick_start);
        }
        if self.state == AppState::Running {
            self.stop();
        }
    }

    /// Run for a bounded wall-clock duration (simulator, tests).
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.state == AppState::Running
            && !self.stop_flag.load(Ordering::Relaxed)
            && Instant::now() < deadline
        {
            let tick_start = Instant::now();
            self.tick();
            self.scheduler.pace(tick_start);
        }
    }

    // ── Shutdown ──────────────────────────────────────────────

    /// Graceful shutdown: scheduler first, then modules in reverse
    /// dependency order (actuators emergency-stop, config flushes).
    pub fn stop(&mut self) {
        if self.state == AppState::Stopped {
            return;
        }
        info!("application stopping");
        self.stop_flag.store(true, Ordering::Relaxed);

        if let Some(modules) = self.modules.as_mut() {
            modules.stop_all();
        }
        // Deliver shutdown-time events (emergency stop notifications).
        self.bus.process(self.scheduler.config().bus_budget_ms.max(10));

        if let Err(e) = self.config.save() {
            error!("config flush on shutdown failed: {e}");
        }
        self.state = AppState::Stopped;
        info!("application stopped");
    }

    fn enter_error(&mut self, cause: &Error) {
        self.bus
            .publish(
                topics::SYSTEM_FATAL,
                serde_json::json!({ "error": cause.to_string() }),
                EventPriority::Critical,
            )
            .ok();
        if let Some(modules) = self.modules.as_mut() {
            modules.stop_all();
        }
        self.bus.process(10);
        if let Err(e) = self.config.save() {
            error!("config flush in error path failed: {e}");
        }
        self.state = AppState::Error;
    }
}

/// Validation schemas for the sections the core itself owns.
fn install_schemas(config: &ConfigStore) {
    config.set_schema(
        "system",
        SectionSchema::new(vec![
            FieldRule::new("version", FieldType::Int).required(),
            FieldRule::new("tick_period_ms", FieldType::Int).range(1.0, 1000.0),
            FieldRule::new("bus_queue_size", FieldType::Int).range(4.0, 1024.0),
            FieldRule::new("heartbeat_enabled", FieldType::Bool),
        ]),
    );
    config.set_schema(
        "climate",
        SectionSchema::new(vec![
            FieldRule::new("setpoint", FieldType::Float)
                .required()
                .range(-40.0, 60.0),
            FieldRule::new("hysteresis", FieldType::Float).range(0.1, 10.0),
            FieldRule::new("mode", FieldType::Str),
        ]),
    );
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::storage::MemStorage;
    use crate::hal::mock::MockHal;
    use serde_json::json;

    fn seeded_storage(sensors: &serde_json::Value, actuators: &serde_json::Value) -> Arc<MemStorage> {
        let storage = Arc::new(MemStorage::new());
        storage.store("sensors", &sensors.to_string()).unwrap();
        storage.store("actuators", &actuators.to_string()).unwrap();
        storage
    }

    fn demo_storage() -> Arc<MemStorage> {
        seeded_storage(
            &json!({
                "poll_interval_ms": 100,
                "sensors": [
                    { "role": "chamber", "type": "ntc", "config": { "adc": "adc0" } },
                ],
            }),
            &json!({
                "actuators": [
                    { "role": "compressor", "type": "relay",
                      "config": { "pin": "k1", "min_on_time_s": 0 } },
                ],
            }),
        )
    }

    #[test]
    fn boot_reaches_running_with_all_modules() {
        let _clock = crate::time::sim_lock();
        let hal = Arc::new(MockHal::new());
        hal.set_adc_raw("adc0", 2048);
        let mut app = Application::new(demo_storage(), hal);
        app.boot().unwrap();
        assert_eq!(app.state(), AppState::Running);
        for (name, state) in app.module_states() {
            assert_eq!(state, ModuleState::Running, "{name}");
        }
    }

    #[test]
    fn boot_from_running_is_rejected() {
        let _clock = crate::time::sim_lock();
        let mut app = Application::new(Arc::new(MemStorage::new()), Arc::new(MockHal::new()));
        app.boot().unwrap();
        assert!(app.boot().is_err());
    }

    #[test]
    fn stop_reverses_and_reaches_stopped() {
        let _clock = crate::time::sim_lock();
        let hal = Arc::new(MockHal::new());
        let mut app = Application::new(demo_storage(), hal.clone());
        app.boot().unwrap();

        // Drive the compressor on, then stop the application.
        app.shared_state()
            .set("command.actuator.compressor", true)
            .unwrap();
        app.tick();
        assert!(hal.gpio_level("k1"));

        app.stop();
        assert_eq!(app.state(), AppState::Stopped);
        assert!(!hal.gpio_level("k1"), "emergency stop drove the relay off");
        for (_, state) in app.module_states() {
            assert_eq!(state, ModuleState::Stopped);
        }
        // Boot-time dirt was flushed.
        assert!(app.config().dirty_sections().is_empty());
    }

    #[test]
    fn tick_is_inert_after_stop() {
        let _clock = crate::time::sim_lock();
        let mut app = Application::new(Arc::new(MemStorage::new()), Arc::new(MockHal::new()));
        app.boot().unwrap();
        app.stop();
        let report = app.tick();
        assert_eq!(report, TickReport::default());
    }
}

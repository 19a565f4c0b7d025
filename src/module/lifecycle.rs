//! Lifecycle controller for the instantiated module set.
//!
//! Records arrive from the registry in dependency (load) order and are
//! stopped in reverse. Lifecycle failures park a module in ERROR and
//! exclude it from the active set; a failing CRITICAL module aborts the
//! phase so boot can fail cleanly.

use log::{error, info, warn};
use serde_json::Value;

use super::{Module, ModuleState, ModuleType};
use crate::config::ConfigStore;
use crate::error::{Error, Result};

/// One instantiated module plus its scheduling metadata.
pub struct ModuleRecord {
    pub name: String,
    pub module_type: ModuleType,
    pub priority: i32,
    pub state: ModuleState,
    pub max_update_us: u32,
    pub config_section: String,
    pub dependencies: Vec<String>,
    pub instance: Box<dyn Module>,
    /// Budget overruns observed by the scheduler.
    pub overruns: u32,
    pub consecutive_overruns: u32,
    pub restarts: u32,
}

impl ModuleRecord {
    /// A module is unhealthy after sustained budget overruns or when it
    /// says so itself.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_overruns < 5 && self.instance.is_healthy()
    }
}

/// Legal lifecycle transitions (the error edge is always available).
fn transition_allowed(from: ModuleState, to: ModuleState) -> bool {
    use ModuleState::{Configured, Created, Error, Initialized, Running, Stopped};
    matches!(
        (from, to),
        (Created, Configured)
            | (Configured, Initialized)
            | (Initialized, Running)
            | (Running, Stopped)
            | (Error, Initialized)
            | (Stopped, Initialized)
            | (_, Error)
    )
}

/// The instantiated modules, in load order.
pub struct ModuleSet {
    records: Vec<ModuleRecord>,
    /// Indices sorted by (type, priority, registration).
    update_order: Vec<usize>,
}

impl ModuleSet {
    pub fn new(records: Vec<ModuleRecord>) -> Self {
        let mut update_order: Vec<usize> = (0..records.len()).collect();
        update_order.sort_by_key(|&i| (records[i].module_type, records[i].priority, i));
        Self {
            records,
            update_order,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Indices in scheduler dispatch order (CRITICAL first).
    pub fn update_order(&self) -> &[usize] {
        &self.update_order
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [ModuleRecord] {
        &mut self.records
    }

    pub fn get(&self, name: &str) -> Option<&ModuleRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ModuleRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    /// `(name, state)` for every module, in load order.
    pub fn states(&self) -> Vec<(String, ModuleState)> {
        self.records
            .iter()
            .map(|r| (r.name.clone(), r.state))
            .collect()
    }

    // ── Lifecycle phases ──────────────────────────────────────

    /// Deliver each module its config section and move it to CONFIGURED.
    pub fn configure_all(&mut self, config: &ConfigStore) -> Result<()> {
        for idx in 0..self.records.len() {
            let section_name = self.records[idx].config_section.clone();
            let section = config
                .get_value(&section_name)
                .unwrap_or(Value::Null);
            self.phase(idx, ModuleState::Created, ModuleState::Configured, |m| {
                m.configure(&section)
            })?;
        }
        Ok(())
    }

    /// Initialize every configured module in dependency order.
    pub fn init_all(&mut self) -> Result<()> {
        for idx in 0..self.records.len() {
            self.phase(idx, ModuleState::Configured, ModuleState::Initialized, |m| {
                m.init()
            })?;
        }
        Ok(())
    }

    /// Start every initialized module.
    pub fn start_all(&mut self) -> Result<()> {
        for idx in 0..self.records.len() {
            self.phase(idx, ModuleState::Initialized, ModuleState::Running, |m| {
                m.start()
            })?;
        }
        Ok(())
    }

    /// Stop running modules in reverse dependency order.
    pub fn stop_all(&mut self) {
        for record in self.records.iter_mut().rev() {
            if record.state != ModuleState::Running {
                continue;
            }
            match record.instance.stop() {
                Ok(()) => {
                    record.state = ModuleState::Stopped;
                    info!("module '{}' stopped", record.name);
                }
                Err(e) => {
                    record.state = ModuleState::Error;
                    error!("module '{}' failed to stop: {e}", record.name);
                }
            }
        }
    }

    /// Recovery path: stop (if running) → init → start. Counts restarts.
    pub fn restart(&mut self, name: &str) -> Result<()> {
        let record = self
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("module '{name}'")))?;
        warn!("module '{name}': restart requested (restart #{})", record.restarts + 1);
        record.restarts += 1;

        if record.state == ModuleState::Running {
            if let Err(e) = record.instance.stop() {
                record.state = ModuleState::Error;
                return Err(e);
            }
            record.state = ModuleState::Stopped;
        }

        match record.instance.init() {
            Ok(()) => record.state = ModuleState::Initialized,
            Err(e) => {
                record.state = ModuleState::Error;
                return Err(e);
            }
        }
        match record.instance.start() {
            Ok(()) => {
                record.state = ModuleState::Running;
                record.consecutive_overruns = 0;
                Ok(())
            }
            Err(e) => {
                record.state = ModuleState::Error;
                Err(e)
            }
        }
    }

    // ── Internal ──────────────────────────────────────────────

    /// Run one lifecycle step on `idx`. A failure parks the module in
    /// ERROR; only a CRITICAL failure aborts the phase.
    fn phase<F>(&mut self, idx: usize, from: ModuleState, to: ModuleState, step: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Module) -> Result<()>,
    {
        let record = &mut self.records[idx];
        if record.state != from {
            // Skipped: an earlier phase already parked it in ERROR.
            return Ok(());
        }
        debug_assert!(transition_allowed(from, to));
        match step(record.instance.as_mut()) {
            Ok(()) => {
                record.state = to;
                Ok(())
            }
            Err(e) => {
                record.state = ModuleState::Error;
                error!("module '{}': {:?} step failed: {e}", record.name, to);
                if record.module_type == ModuleType::Critical {
                    return Err(Error::fatal(format!(
                        "critical module '{}' failed: {e}",
                        record.name
                    )));
                }
                Ok(())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, storage::MemStorage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable module: fails the chosen steps.
    struct Scripted {
        fail_configure: bool,
        fail_init: bool,
        init_calls: Arc<AtomicU32>,
        stop_calls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn ok() -> Self {
            Self {
                fail_configure: false,
                fail_init: false,
                init_calls: Arc::new(AtomicU32::new(0)),
                stop_calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl Module for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn configure(&mut self, _: &Value) -> Result<()> {
            if self.fail_configure {
                return Err(Error::invalid_argument("scripted configure failure"));
            }
            Ok(())
        }
        fn init(&mut self) -> Result<()> {
            self.init_calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_init {
                return Err(Error::hardware("scripted init failure"));
            }
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn update(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn record(name: &str, module_type: ModuleType, module: Scripted) -> ModuleRecord {
        ModuleRecord {
            name: name.to_string(),
            module_type,
            priority: 0,
            state: ModuleState::Created,
            max_update_us: 1000,
            config_section: "system".to_string(),
            dependencies: Vec::new(),
            instance: Box::new(module),
            overruns: 0,
            consecutive_overruns: 0,
            restarts: 0,
        }
    }

    fn store() -> ConfigStore {
        let store = ConfigStore::new(Arc::new(MemStorage::new()));
        store.load().unwrap();
        store
    }

    #[test]
    fn full_lifecycle_reaches_running_then_stopped() {
        let mut set = ModuleSet::new(vec![record("a", ModuleType::Standard, Scripted::ok())]);
        set.configure_all(&store()).unwrap();
        set.init_all().unwrap();
        set.start_all().unwrap();
        assert_eq!(set.get("a").unwrap().state, ModuleState::Running);
        set.stop_all();
        assert_eq!(set.get("a").unwrap().state, ModuleState::Stopped);
    }

    #[test]
    fn non_critical_failure_parks_in_error_and_continues() {
        let mut bad = Scripted::ok();
        bad.fail_init = true;
        let mut set = ModuleSet::new(vec![
            record("bad", ModuleType::Standard, bad),
            record("good", ModuleType::Standard, Scripted::ok()),
        ]);
        set.configure_all(&store()).unwrap();
        set.init_all().unwrap();
        set.start_all().unwrap();
        assert_eq!(set.get("bad").unwrap().state, ModuleState::Error);
        assert_eq!(set.get("good").unwrap().state, ModuleState::Running);
    }

    #[test]
    fn critical_failure_aborts_the_phase() {
        let mut bad = Scripted::ok();
        bad.fail_configure = true;
        let mut set = ModuleSet::new(vec![record("bad", ModuleType::Critical, bad)]);
        let err = set.configure_all(&store()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
        assert_eq!(set.get("bad").unwrap().state, ModuleState::Error);
    }

    #[test]
    fn errored_module_skips_later_phases() {
        let mut bad = Scripted::ok();
        bad.fail_configure = true;
        let init_calls = bad.init_calls.clone();
        let mut set = ModuleSet::new(vec![record("bad", ModuleType::Standard, bad)]);
        set.configure_all(&store()).unwrap();
        set.init_all().unwrap();
        set.start_all().unwrap();
        assert_eq!(init_calls.load(Ordering::Relaxed), 0);
        assert_eq!(set.get("bad").unwrap().state, ModuleState::Error);
    }

    #[test]
    fn restart_runs_stop_init_start() {
        let module = Scripted::ok();
        let init_calls = module.init_calls.clone();
        let stop_calls = module.stop_calls.clone();
        let mut set = ModuleSet::new(vec![record("m", ModuleType::Standard, module)]);
        set.configure_all(&store()).unwrap();
        set.init_all().unwrap();
        set.start_all().unwrap();

        set.restart("m").unwrap();
        assert_eq!(stop_calls.load(Ordering::Relaxed), 1);
        assert_eq!(init_calls.load(Ordering::Relaxed), 2);
        assert_eq!(set.get("m").unwrap().state, ModuleState::Running);
        assert_eq!(set.get("m").unwrap().restarts, 1);
    }

    #[test]
    fn update_order_puts_critical_first() {
        let set = ModuleSet::new(vec![
            record("bg", ModuleType::Background, Scripted::ok()),
            record("crit", ModuleType::Critical, Scripted::ok()),
            record("std", ModuleType::Standard, Scripted::ok()),
        ]);
        let names: Vec<&str> = set
            .update_order()
            .iter()
            .map(|&i| set.records()[i].name.as_str())
            .collect();
        assert_eq!(names, vec!["crit", "std", "bg"]);
    }

    #[test]
    fn stop_is_reverse_load_order() {
        // Load order a, b: stop must hit b first. Observed via a shared
        // list stamped at stop time.
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct Stamping {
            tag: &'static str,
            order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        }
        impl Module for Stamping {
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
                Ok(())
            }
            fn stop(&mut self) -> Result<()> {
                self.order.lock().push(self.tag);
                Ok(())
            }
        }

        let mut set = ModuleSet::new(vec![
            ModuleRecord {
                name: "a".to_string(),
                module_type: ModuleType::Standard,
                priority: 0,
                state: ModuleState::Created,
                max_update_us: 1000,
                config_section: "system".to_string(),
                dependencies: Vec::new(),
                instance: Box::new(Stamping {
                    tag: "a",
                    order: order.clone(),
                }),
                overruns: 0,
                consecutive_overruns: 0,
                restarts: 0,
            },
            ModuleRecord {
                name: "b".to_string(),
                module_type: ModuleType::Standard,
                priority: 0,
                state: ModuleState::Created,
                max_update_us: 1000,
                config_section: "system".to_string(),
                dependencies: vec!["a".to_string()],
                instance: Box::new(Stamping {
                    tag: "b",
                    order: order.clone(),
                }),
                overruns: 0,
                consecutive_overruns: 0,
                restarts: 0,
            },
        ]);
        set.configure_all(&store()).unwrap();
        set.init_all().unwrap();
        set.start_all().unwrap();
        set.stop_all();
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }
}

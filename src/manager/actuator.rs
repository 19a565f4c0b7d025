//! Actuator manager: command routing, status publication, emergency stop.
//!
//! Every instance subscribes its command key on Shared State. The
//! subscription callback only enqueues `(role, payload)` — dispatch to
//! the driver happens in `update()` on the application thread, in the
//! order Shared State delivered the commands. This keeps drivers
//! single-threaded and preserves command ordering across instances.
//!
//! ```text
//! set("command.actuator.compressor", true)
//!        │ state callback (enqueue)
//!        ▼
//! pending queue ──update()──▶ driver.execute_command()
//!                                   │
//!                    status_key ◀───┴──▶ actuator.command event
//! ```
//!
//! `stop()` emergency-stops every driver, bypassing protection timers.

use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::bus::{EventPriority, topics};
use crate::drivers::{ActuatorDriver, actuator_registry};
use crate::error::Result;
use crate::module::{Module, Runtime};
use crate::state::StateValue;
use crate::time;

const DEFAULT_STATUS_REPUBLISH_MS: u64 = 1000;

/// One configured actuator.
struct ActuatorInstance {
    role: String,
    type_name: String,
    command_key: String,
    status_key: String,
    driver: Box<dyn ActuatorDriver>,
    subscription_handle: u32,
    command_count: u32,
    error_count: u32,
}

/// The actuator manager module.
pub struct ActuatorManager {
    rt: Runtime,
    instances: Vec<ActuatorInstance>,
    /// Commands observed on Shared State, in delivery order.
    pending: Arc<Mutex<VecDeque<(String, Value)>>>,
    status_republish_ms: u64,
    last_republish_ms: u64,
}

impl ActuatorManager {
    pub const NAME: &'static str = "actuator_manager";

    pub fn new(rt: Runtime) -> Self {
        Self {
            rt,
            instances: Vec::new(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            status_republish_ms: DEFAULT_STATUS_REPUBLISH_MS,
            last_republish_ms: 0,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn roles(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.role.clone()).collect()
    }

    /// Force every actuator to its safe state, bypassing protection
    /// timers, then publish statuses and announce the stop.
    pub fn emergency_stop_all(&mut self) {
        error!("actuator manager: EMERGENCY STOP for {} instances", self.instances.len());
        for instance in &mut self.instances {
            instance.driver.emergency_stop();
        }
        self.publish_all_statuses();
        self.rt
            .bus
            .publish(
                topics::ACTUATOR_EMERGENCY_STOP,
                json!({ "roles": self.roles() }),
                EventPriority::Critical,
            )
            .ok();
    }

    /// Per-instance snapshot for the diagnostics surface.
    pub fn diagnostics(&self) -> Value {
        let entries: Vec<Value> = self
            .instances
            .iter()
            .map(|i| {
                json!({
                    "role": i.role,
                    "type": i.type_name,
                    "command_key": i.command_key,
                    "commands": i.command_count,
                    "errors": i.error_count,
                    "driver": i.driver.diagnostics(),
                })
            })
            .collect();
        json!({ "actuators": entries })
    }

    fn drop_instances(&mut self) {
        for instance in &self.instances {
            self.rt.state.unsubscribe(instance.subscription_handle);
        }
        self.instances.clear();
        self.pending.lock().clear();
    }

    fn publish_all_statuses(&mut self) {
        // Split borrows: collect first, then write through rt.
        let updates: Vec<(String, Value)> = self
            .instances
            .iter()
            .map(|i| {
                (
                    i.status_key.clone(),
                    serde_json::to_value(i.driver.get_status()).unwrap_or(Value::Null),
                )
            })
            .collect();
        for (key, status) in updates {
            if let Err(e) = self.rt.state.set(&key, StateValue::Doc(status)) {
                warn!("actuator status publish to '{key}' failed: {e}");
            }
        }
    }

    fn dispatch_pending(&mut self) {
        loop {
            let Some((role, payload)) = self.pending.lock().pop_front() else {
                break;
            };
            let Some(instance) = self.instances.iter_mut().find(|i| i.role == role) else {
                continue; // Instance dropped since the command arrived.
            };
            instance.command_count = instance.command_count.wrapping_add(1);
            let result = instance.driver.execute_command(&payload);
            let success = result.is_ok();
            if let Err(e) = result {
                instance.error_count = instance.error_count.wrapping_add(1);
                warn!("actuator '{role}': command failed: {e}");
            }
            let status = serde_json::to_value(instance.driver.get_status()).unwrap_or(Value::Null);
            let status_key = instance.status_key.clone();
            if let Err(e) = self.rt.state.set(&status_key, StateValue::Doc(status)) {
                warn!("actuator status publish to '{status_key}' failed: {e}");
            }
            self.rt
                .bus
                .publish(
                    topics::ACTUATOR_COMMAND,
                    json!({ "role": role, "command": payload, "success": success }),
                    EventPriority::Normal,
                )
                .ok();
        }
    }
}

impl Module for ActuatorManager {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        self.drop_instances();

        self.status_republish_ms = config
            .get("status_republish_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_STATUS_REPUBLISH_MS)
            .max(10);

        let entries = config
            .get("actuators")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in &entries {
            let Some(role) = entry.get("role").and_then(Value::as_str) else {
                warn!("actuator entry without 'role' skipped: {entry}");
                continue;
            };
            let Some(type_name) = entry.get("type").and_then(Value::as_str) else {
                warn!("actuator '{role}': missing 'type', skipped");
                continue;
            };
            let Some(mut driver) = actuator_registry().create(type_name) else {
                warn!("actuator '{role}': unknown driver type '{type_name}', skipped");
                continue;
            };
            let driver_config = entry.get("config").cloned().unwrap_or_else(|| json!({}));
            if let Err(e) = driver.init(self.rt.hal.as_ref(), &driver_config) {
                warn!("actuator '{role}': init failed ({e}), skipped");
                continue;
            }
            let command_key = entry
                .get("command_key")
                .and_then(Value::as_str)
                .map_or_else(|| format!("command.actuator.{role}"), str::to_string);
            let status_key = entry
                .get("status_key")
                .and_then(Value::as_str)
                .map_or_else(|| format!("state.actuator.{role}"), str::to_string);

            // The callback must stay cheap: commands queue here and run
            // in update() on the application thread.
            let pending = self.pending.clone();
            let callback_role = role.to_string();
            let subscription_handle = self.rt.state.subscribe(&command_key, move |_, value| {
                pending
                    .lock()
                    .push_back((callback_role.clone(), value.to_json()));
            });

            info!("actuator '{role}' ({type_name}) listening on '{command_key}'");
            self.instances.push(ActuatorInstance {
                role: role.to_string(),
                type_name: type_name.to_string(),
                command_key,
                status_key,
                driver,
                subscription_handle,
                command_count: 0,
                error_count: 0,
            });
        }

        self.publish_all_statuses();
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.last_republish_ms = time::now_ms();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.dispatch_pending();

        // Protection timers, ramps, and deferred switches advance here.
        for instance in &mut self.instances {
            instance.driver.update();
        }

        let now = time::now_ms();
        if now.saturating_sub(self.last_republish_ms) >= self.status_republish_ms {
            self.last_republish_ms = now;
            self.publish_all_statuses();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.emergency_stop_all();
        self.drop_instances();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.instances
            .iter()
            .all(|i| i.driver.get_status().is_healthy)
    }
}

impl Drop for ActuatorManager {
    fn drop(&mut self) {
        // Command-key subscriptions must not outlive their instances.
        self.drop_instances();
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::{ConfigStore, storage::MemStorage};
    use crate::drivers::{ActuatorStatus, register_builtin_drivers};
    use crate::hal::mock::MockHal;
    use crate::state::SharedState;

    fn runtime() -> (Runtime, Arc<MockHal>) {
        register_builtin_drivers();
        let hal = Arc::new(MockHal::new());
        let config = Arc::new(ConfigStore::new(Arc::new(MemStorage::new())));
        config.load().unwrap();
        let rt = Runtime {
            state: Arc::new(SharedState::new()),
            bus: Arc::new(EventBus::new(64)),
            config,
            hal: hal.clone(),
            scheduler_stats: Arc::new(crate::scheduler::SchedulerStats::default()),
        };
        (rt, hal)
    }

    fn compressor_config(min_on_s: u32) -> Value {
        json!({
            "actuators": [
                {
                    "role": "compressor",
                    "type": "relay",
                    "config": { "pin": "relay_k1", "min_on_time_s": min_on_s },
                },
            ],
        })
    }

    fn status_of(state: &SharedState, key: &str) -> ActuatorStatus {
        state.get_as(key).expect("status present")
    }

    #[test]
    fn command_key_drives_the_relay() {
        let _clock = time::sim_lock();
        let (rt, hal) = runtime();
        let state = rt.state.clone();
        let bus = rt.bus.clone();

        let mut mgr = ActuatorManager::new(rt);
        mgr.configure(&compressor_config(0)).unwrap();
        mgr.init().unwrap();

        // Initial status is published on configure.
        assert!(!status_of(&state, "state.actuator.compressor").is_active);

        state.set("command.actuator.compressor", true).unwrap();
        mgr.update().unwrap();

        assert!(hal.gpio_level("relay_k1"));
        assert!(status_of(&state, "state.actuator.compressor").is_active);

        // actuator.command event carries role and success.
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired2 = fired.clone();
        bus.subscribe(topics::ACTUATOR_COMMAND, move |e| {
            fired2.lock().push((
                e.payload["role"].as_str().unwrap().to_string(),
                e.payload["success"].as_bool().unwrap(),
            ));
        })
        .unwrap();
        bus.process(100);
        assert_eq!(*fired.lock(), vec![("compressor".to_string(), true)]);
    }

    #[test]
    fn protection_window_defers_via_manager_updates() {
        let clock = time::sim_lock();
        let (rt, _hal) = runtime();
        let state = rt.state.clone();
        let mut mgr = ActuatorManager::new(rt);
        mgr.configure(&compressor_config(5)).unwrap();
        mgr.init().unwrap();

        state.set("command.actuator.compressor", true).unwrap();
        clock.advance_ms(100);
        mgr.update().unwrap();
        assert!(status_of(&state, "state.actuator.compressor").is_active);
        assert_eq!(
            status_of(&state, "state.actuator.compressor").state_description,
            "ON"
        );

        // Off at t=2 s: refused, still ON at t=3 s.
        clock.set_ms(2000);
        state.set("command.actuator.compressor", false).unwrap();
        mgr.update().unwrap();
        clock.set_ms(3000);
        mgr.update().unwrap();
        assert!(status_of(&state, "state.actuator.compressor").is_active);

        // Window expires: deferred off applies on the next update.
        clock.set_ms(5200);
        mgr.update().unwrap();
        assert!(!status_of(&state, "state.actuator.compressor").is_active);
    }

    #[test]
    fn emergency_stop_overrides_protection_and_announces() {
        let clock = time::sim_lock();
        let (rt, hal) = runtime();
        let state = rt.state.clone();
        let bus = rt.bus.clone();
        let mut mgr = ActuatorManager::new(rt);
        mgr.configure(&compressor_config(600)).unwrap();
        mgr.init().unwrap();

        state.set("command.actuator.compressor", true).unwrap();
        clock.advance_ms(50);
        mgr.update().unwrap();
        assert!(hal.gpio_level("relay_k1"));

        let stops = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let stops2 = stops.clone();
        bus.subscribe(topics::ACTUATOR_EMERGENCY_STOP, move |_| {
            stops2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        })
        .unwrap();

        mgr.stop().unwrap();
        bus.process(100);
        assert!(!hal.gpio_level("relay_k1"));
        assert_eq!(stops.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(mgr.instance_count(), 0);
    }

    #[test]
    fn reconfigure_unsubscribes_old_command_keys() {
        let _clock = time::sim_lock();
        let (rt, _hal) = runtime();
        let state = rt.state.clone();
        let mut mgr = ActuatorManager::new(rt);
        mgr.configure(&compressor_config(0)).unwrap();
        assert_eq!(state.subscription_count(), 1);

        mgr.configure(&json!({ "actuators": [] })).unwrap();
        assert_eq!(state.subscription_count(), 0);
        // Commands to the old key no longer queue anything.
        state.set("command.actuator.compressor", true).unwrap();
        mgr.update().unwrap();
        assert_eq!(mgr.instance_count(), 0);
    }

    #[test]
    fn failed_command_counts_and_keeps_instance_alive() {
        let _clock = time::sim_lock();
        let (rt, _hal) = runtime();
        let state = rt.state.clone();
        let mut mgr = ActuatorManager::new(rt);
        mgr.configure(&compressor_config(0)).unwrap();

        state.set("command.actuator.compressor", "garbage").unwrap();
        mgr.update().unwrap();
        assert_eq!(mgr.instances[0].error_count, 1);

        state.set("command.actuator.compressor", true).unwrap();
        mgr.update().unwrap();
        assert!(status_of(&state, "state.actuator.compressor").is_active);
    }

    #[test]
    fn periodic_status_republish() {
        let clock = time::sim_lock();
        let (rt, _hal) = runtime();
        let state = rt.state.clone();
        let mut mgr = ActuatorManager::new(rt);
        mgr.configure(&json!({
            "status_republish_ms": 1000,
            "actuators": [
                { "role": "fan", "type": "pwm", "config": { "channel": "fan_pwm" } },
            ],
        }))
        .unwrap();
        mgr.init().unwrap();

        let initial = state.entry("state.actuator.fan").unwrap().update_count;
        clock.advance_ms(1100);
        mgr.update().unwrap();
        // Same status content — change suppression means no new update,
        // but the write happened (update_count unchanged is acceptable
        // only if value is equal; force a change to observe).
        state.set("command.actuator.fan", 42.0).unwrap();
        clock.advance_ms(1100);
        mgr.update().unwrap();
        let after = state.entry("state.actuator.fan").unwrap().update_count;
        assert!(after > initial);
        assert!(status_of(&state, "state.actuator.fan").is_active);
    }
}

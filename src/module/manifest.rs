//! Static module manifests.
//!
//! A manifest is the declarative description of a module bundled with
//! the firmware: identity, scheduling class, dependencies, update
//! budget, configuration section, and the events/state keys it touches.
//! The registry wires the system from these tables at boot; the
//! event/key lists exist for static cross-checking and the UI generator,
//! not for runtime enforcement.

use super::{Module, ModuleType, Runtime};
use crate::manager::actuator::ActuatorManager;
use crate::manager::sensor::SensorManager;
use crate::monitor::SystemMonitor;

/// Declarative description of one module.
#[derive(Clone)]
pub struct ModuleManifest {
    pub name: &'static str,
    pub version: &'static str,
    pub module_type: ModuleType,
    /// Tie-breaker within a type: lower runs earlier.
    pub priority: i32,
    pub dependencies: &'static [&'static str],
    /// Per-tick wall budget for `update()`, microseconds.
    pub max_update_us: u32,
    pub config_section: &'static str,
    pub published_events: &'static [&'static str],
    pub subscribed_events: &'static [&'static str],
    pub published_keys: &'static [&'static str],
    pub subscribed_keys: &'static [&'static str],
    pub factory: fn(&Runtime) -> Box<dyn Module>,
}

/// Manifests for the modules built into the core.
///
/// Actuators start after sensors so interlock logic sees live readings
/// from the first tick; the monitor trails everything it reports on.
pub fn builtin_manifests() -> Vec<ModuleManifest> {
    vec![
        ModuleManifest {
            name: SensorManager::NAME,
            version: "1.2.0",
            module_type: ModuleType::High,
            priority: 10,
            dependencies: &[],
            max_update_us: 3_000,
            config_section: "sensors",
            published_events: &["sensor.reading", "sensor.error", "sensor.calibration_complete"],
            subscribed_events: &[],
            published_keys: &["state.sensor.*"],
            subscribed_keys: &[],
            factory: |rt| Box::new(SensorManager::new(rt.clone())),
        },
        ModuleManifest {
            name: ActuatorManager::NAME,
            version: "1.2.0",
            module_type: ModuleType::Critical,
            priority: 10,
            dependencies: &[SensorManager::NAME],
            max_update_us: 3_000,
            config_section: "actuators",
            published_events: &["actuator.command", "actuator.emergency_stop"],
            subscribed_events: &[],
            published_keys: &["state.actuator.*"],
            subscribed_keys: &["command.actuator.*"],
            factory: |rt| Box::new(ActuatorManager::new(rt.clone())),
        },
        ModuleManifest {
            name: SystemMonitor::NAME,
            version: "1.0.1",
            module_type: ModuleType::Background,
            priority: 50,
            dependencies: &[SensorManager::NAME, ActuatorManager::NAME],
            max_update_us: 1_000,
            config_section: "system",
            published_events: &["system.heartbeat"],
            subscribed_events: &[],
            published_keys: &[
                "state.system.uptime",
                "state.system.cpu_usage",
                "state.system.heartbeat_enabled",
            ],
            subscribed_keys: &[],
            factory: |rt| Box::new(SystemMonitor::new(rt.clone())),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_manifest_dependencies_resolve() {
        let manifests = builtin_manifests();
        for manifest in &manifests {
            for dep in manifest.dependencies {
                assert!(
                    manifests.iter().any(|m| m.name == *dep),
                    "{}: unresolved dependency '{dep}'",
                    manifest.name
                );
            }
        }
    }

    #[test]
    fn builtin_names_are_unique() {
        let manifests = builtin_manifests();
        for (i, a) in manifests.iter().enumerate() {
            for b in &manifests[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}

//! Driver traits, registries, and the built-in driver set.
//!
//! A driver encapsulates one hardware device behind a uniform interface.
//! Managers create drivers through the type registries and own them
//! exclusively; drivers hold HAL resources obtained at `init` and release
//! them when dropped.
//!
//! ```text
//! config entry { type: "relay", ... }
//!        │ lookup
//!        ▼
//! ActuatorRegistry ──factory──▶ Box<dyn ActuatorDriver> ──▶ manager
//! ```
//!
//! Registration is an explicit pass ([`register_builtin_drivers`]) called
//! from the application boot sequence — Rust offers no dependable
//! static-initialization ordering to hang self-registration on.

pub mod ds18b20;
pub mod ntc;
pub mod pwm;
pub mod relay;

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::Result;
use crate::hal::Hal;
use crate::time;

// ═══════════════════════════════════════════════════════════════
//  Readings and status
// ═══════════════════════════════════════════════════════════════

/// One sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    pub unit: String,
    pub timestamp_ms: u64,
    pub is_valid: bool,
    pub error_message: String,
}

impl SensorReading {
    /// A valid sample stamped now.
    pub fn ok(value: f64, unit: &str) -> Self {
        Self {
            value,
            unit: unit.to_string(),
            timestamp_ms: time::now_ms(),
            is_valid: true,
            error_message: String::new(),
        }
    }

    /// An invalid sample carrying an error description.
    pub fn invalid(unit: &str, error: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            unit: unit.to_string(),
            timestamp_ms: time::now_ms(),
            is_valid: false,
            error_message: error.into(),
        }
    }

    /// Placeholder before the first poll.
    pub fn not_read_yet() -> Self {
        Self {
            value: 0.0,
            unit: "°C".to_string(),
            timestamp_ms: 0,
            is_valid: false,
            error_message: "Not read yet".to_string(),
        }
    }
}

/// Actuator state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorStatus {
    pub is_active: bool,
    pub current_value: f64,
    pub state_description: String,
    pub last_change_ms: u64,
    pub is_healthy: bool,
    pub error_message: String,
}

impl ActuatorStatus {
    pub fn inactive(description: &str) -> Self {
        Self {
            is_active: false,
            current_value: 0.0,
            state_description: description.to_string(),
            last_change_ms: time::now_ms(),
            is_healthy: true,
            error_message: String::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Driver traits
// ═══════════════════════════════════════════════════════════════

/// A sensor device behind a uniform polling interface.
pub trait SensorDriver: Send {
    /// One-time setup: acquire HAL resources and apply `config`.
    fn init(&mut self, hal: &dyn Hal, config: &Value) -> Result<()>;

    /// Hot path: take a sample. Failures are reported in the reading,
    /// not as errors.
    fn read(&mut self) -> SensorReading;

    /// Optional periodic tick for conversion state machines.
    fn update(&mut self) {}

    fn type_name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Live configuration for read-back.
    fn get_config(&self) -> Value;

    /// Apply a configuration delta at runtime.
    fn set_config(&mut self, config: &Value) -> Result<()>;

    /// Declarative UI description for the adaptive interface generator.
    fn ui_schema(&self) -> Value {
        Value::Null
    }

    fn diagnostics(&self) -> Value {
        Value::Null
    }

    /// Optional calibration routine.
    fn calibrate(&mut self, _payload: &Value) -> Result<()> {
        Err(crate::error::Error::invalid_state(format!(
            "driver '{}' does not support calibration",
            self.type_name()
        )))
    }
}

/// An actuator device behind a uniform command interface.
pub trait ActuatorDriver: Send {
    fn init(&mut self, hal: &dyn Hal, config: &Value) -> Result<()>;

    /// Hot path: apply a command payload.
    fn execute_command(&mut self, payload: &Value) -> Result<()>;

    /// Periodic tick: advances protection timers, ramps, blinks.
    fn update(&mut self) {}

    fn get_status(&self) -> ActuatorStatus;

    /// Force the safe state, bypassing protection timers.
    fn emergency_stop(&mut self);

    fn type_name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn get_config(&self) -> Value;

    fn set_config(&mut self, config: &Value) -> Result<()>;

    fn ui_schema(&self) -> Value {
        Value::Null
    }

    fn diagnostics(&self) -> Value {
        Value::Null
    }
}

// ═══════════════════════════════════════════════════════════════
//  Registries
// ═══════════════════════════════════════════════════════════════

pub type SensorFactory = Box<dyn Fn() -> Box<dyn SensorDriver> + Send + Sync>;
pub type ActuatorFactory = Box<dyn Fn() -> Box<dyn ActuatorDriver> + Send + Sync>;

/// Type → factory map. One instance each for sensors and actuators.
pub struct DriverRegistry<F> {
    label: &'static str,
    factories: Mutex<HashMap<String, F>>,
}

impl<F> DriverRegistry<F> {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Register a factory. Re-registering a type replaces the previous
    /// factory with a warning.
    pub fn register(&self, type_name: &str, factory: F) {
        let mut factories = self.factories.lock();
        if factories.insert(type_name.to_string(), factory).is_some() {
            warn!(
                "{} registry: '{type_name}' re-registered, replacing previous factory",
                self.label
            );
        }
    }

    /// Registered type identifiers, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.lock().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.lock().contains_key(type_name)
    }
}

impl DriverRegistry<SensorFactory> {
    /// Instantiate a driver of `type_name`.
    pub fn create(&self, type_name: &str) -> Option<Box<dyn SensorDriver>> {
        self.factories.lock().get(type_name).map(|f| f())
    }
}

impl DriverRegistry<ActuatorFactory> {
    pub fn create(&self, type_name: &str) -> Option<Box<dyn ActuatorDriver>> {
        self.factories.lock().get(type_name).map(|f| f())
    }
}

/// Process-wide sensor driver registry.
pub fn sensor_registry() -> &'static DriverRegistry<SensorFactory> {
    static REGISTRY: OnceLock<DriverRegistry<SensorFactory>> = OnceLock::new();
    REGISTRY.get_or_init(|| DriverRegistry::new("sensor"))
}

/// Process-wide actuator driver registry.
pub fn actuator_registry() -> &'static DriverRegistry<ActuatorFactory> {
    static REGISTRY: OnceLock<DriverRegistry<ActuatorFactory>> = OnceLock::new();
    REGISTRY.get_or_init(|| DriverRegistry::new("actuator"))
}

/// Explicit registration pass for the built-in driver set. Called from
/// the application boot sequence; idempotent (re-registration replaces).
pub fn register_builtin_drivers() {
    sensor_registry().register("ntc", Box::new(|| Box::new(ntc::NtcSensor::new())));
    sensor_registry().register(
        "ds18b20",
        Box::new(|| Box::new(ds18b20::Ds18b20Sensor::new())),
    );
    actuator_registry().register("relay", Box::new(|| Box::new(relay::RelayDriver::new())));
    actuator_registry().register("pwm", Box::new(|| Box::new(pwm::PwmDriver::new())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registration_is_idempotent() {
        register_builtin_drivers();
        register_builtin_drivers();
        let sensors = sensor_registry().list();
        assert!(sensors.contains(&"ntc".to_string()));
        assert!(sensors.contains(&"ds18b20".to_string()));
        let actuators = actuator_registry().list();
        assert!(actuators.contains(&"relay".to_string()));
        assert!(actuators.contains(&"pwm".to_string()));
    }

    #[test]
    fn unknown_type_yields_no_driver() {
        register_builtin_drivers();
        assert!(sensor_registry().create("warp_core").is_none());
        assert!(!actuator_registry().contains("warp_core"));
    }
}

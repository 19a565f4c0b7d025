//! Sensor manager: periodic polling and reading publication.
//!
//! Owns every sensor instance built from the `sensors` config section.
//! Each tick it advances driver conversion state machines; at the poll
//! cadence it reads every instance, stores the reading under the
//! instance's publish key, and emits a `sensor.reading` event. A failing
//! driver never aborts the iteration — failures are counted and surface
//! through the health score.

use log::{info, warn};
use serde_json::{Value, json};

use crate::bus::{EventPriority, topics};
use crate::drivers::{SensorDriver, SensorReading, sensor_registry};
use crate::error::{Error, Result};
use crate::module::{Module, Runtime};
use crate::state::StateValue;
use crate::time;

/// Floor for the poll interval; anything lower is clamped up.
const MIN_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// One configured sensor: a role, its driver, and its bookkeeping.
struct SensorInstance {
    role: String,
    type_name: String,
    publish_key: String,
    driver: Box<dyn SensorDriver>,
    last_reading: SensorReading,
    poll_failures: u32,
}

/// The sensor manager module.
pub struct SensorManager {
    rt: Runtime,
    instances: Vec<SensorInstance>,
    poll_interval_ms: u64,
    publish_on_error: bool,
    last_poll_ms: u64,
    total_read_errors: u64,
}

impl SensorManager {
    pub const NAME: &'static str = "sensor_manager";

    pub fn new(rt: Runtime) -> Self {
        Self {
            rt,
            instances: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            publish_on_error: false,
            last_poll_ms: 0,
            total_read_errors: 0,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn total_read_errors(&self) -> u64 {
        self.total_read_errors
    }

    /// Roles currently managed, in configuration order.
    pub fn roles(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.role.clone()).collect()
    }

    /// Run a driver calibration for `role` and announce completion.
    pub fn calibrate(&mut self, role: &str, payload: &Value) -> Result<()> {
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.role == role)
            .ok_or_else(|| Error::not_found(format!("sensor role '{role}'")))?;
        instance.driver.calibrate(payload)?;
        self.rt
            .bus
            .publish(
                topics::SENSOR_CALIBRATION_COMPLETE,
                json!({ "role": role }),
                EventPriority::Normal,
            )
            .ok();
        Ok(())
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
                    "publish_key": i.publish_key,
                    "available": i.driver.is_available(),
                    "poll_failures": i.poll_failures,
                    "last_valid": i.last_reading.is_valid,
                })
            })
            .collect();
        json!({
            "poll_interval_ms": self.poll_interval_ms,
            "total_read_errors": self.total_read_errors,
            "sensors": entries,
        })
    }

    /// Fraction of instances that are available and not failing, 0–100.
    /// Any instance past 10 consecutive failures makes the manager
    /// unhealthy outright.
    pub fn health(&self) -> u8 {
        if self.instances.is_empty() {
            return 100;
        }
        if self.instances.iter().any(|i| i.poll_failures > 10) {
            return 0;
        }
        let good = self
            .instances
            .iter()
            .filter(|i| i.driver.is_available() && i.poll_failures < 3)
            .count();
        ((good * 100) / self.instances.len()) as u8
    }

    fn poll_all(&mut self) {
        for instance in &mut self.instances {
            let reading = instance.driver.read();
            let valid = reading.is_valid;
            instance.last_reading = reading.clone();

            if valid {
                instance.poll_failures = 0;
            } else {
                instance.poll_failures = instance.poll_failures.wrapping_add(1);
                self.total_read_errors += 1;
                self.rt
                    .bus
                    .publish(
                        topics::SENSOR_ERROR,
                        json!({
                            "role": instance.role,
                            "error": reading.error_message,
                            "failures": instance.poll_failures,
                        }),
                        EventPriority::High,
                    )
                    .ok();
            }

            if valid || self.publish_on_error {
                match StateValue::from_serialize(&reading) {
                    Ok(value) => {
                        if let Err(e) = self.rt.state.set(&instance.publish_key, value) {
                            warn!(
                                "sensor '{}': publish to '{}' failed: {e}",
                                instance.role, instance.publish_key
                            );
                        }
                    }
                    Err(e) => warn!("sensor '{}': serialize failed: {e}", instance.role),
                }
                self.rt
                    .bus
                    .publish(
                        topics::SENSOR_READING,
                        json!({
                            "role": instance.role,
                            "value": reading.value,
                            "unit": reading.unit,
                            "is_valid": valid,
                        }),
                        EventPriority::Normal,
                    )
                    .ok();
            }
        }
    }
}

impl Module for SensorManager {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        // Dropping instances releases drivers and their HAL handles.
        self.instances.clear();

        self.poll_interval_ms = config
            .get("poll_interval_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(MIN_POLL_INTERVAL_MS);
        self.publish_on_error = config
            .get("publish_on_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let entries = config
            .get("sensors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in &entries {
            let Some(role) = entry.get("role").and_then(Value::as_str) else {
                warn!("sensor entry without 'role' skipped: {entry}");
                continue;
            };
            let Some(type_name) = entry.get("type").and_then(Value::as_str) else {
                warn!("sensor '{role}': missing 'type', skipped");
                continue;
            };
            let Some(mut driver) = sensor_registry().create(type_name) else {
                warn!("sensor '{role}': unknown driver type '{type_name}', skipped");
                continue;
            };
            let driver_config = entry.get("config").cloned().unwrap_or_else(|| json!({}));
            if let Err(e) = driver.init(self.rt.hal.as_ref(), &driver_config) {
                warn!("sensor '{role}': init failed ({e}), skipped");
                continue;
            }
            let publish_key = entry
                .get("publish_key")
                .and_then(Value::as_str)
                .map_or_else(|| format!("state.sensor.{role}"), str::to_string);
            info!("sensor '{role}' ({type_name}) -> '{publish_key}'");
            self.instances.push(SensorInstance {
                role: role.to_string(),
                type_name: type_name.to_string(),
                publish_key,
                driver,
                last_reading: SensorReading::not_read_yet(),
                poll_failures: 0,
            });
        }
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.last_poll_ms = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        // Conversion state machines run every tick regardless of cadence.
        for instance in &mut self.instances {
            instance.driver.update();
        }

        let now = time::now_ms();
        if now.saturating_sub(self.last_poll_ms) < self.poll_interval_ms {
            return Ok(());
        }
        self.last_poll_ms = now;
        self.poll_all();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.instances.clear();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.health() > 0
    }

    fn health_score(&self) -> u8 {
        self.health()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

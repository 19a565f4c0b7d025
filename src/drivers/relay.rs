//! Relay actuator with compressor-protection timers.
//!
//! Compressors and pumps are destroyed by short-cycling, so the relay
//! enforces `min_on_time_s` / `min_off_time_s`: a command to switch
//! inside the protection window is refused (counted, not an error) and
//! the commanded state is remembered. When the window expires, a pending
//! command is applied on the next `update()`.
//!
//! `emergency_stop()` bypasses protection and forces the relay off.
//!
//! ## Safety contract
//!
//! The driver is a dumb actuator: interlocks and fault gating live in the
//! managers above it. The only policy it owns is the protection window.

use log::{info, warn};
use serde_json::{Value, json};

use crate::drivers::{ActuatorDriver, ActuatorStatus};
use crate::error::{Error, Result};
use crate::hal::{GpioOutput, Hal};
use crate::time;

#[derive(Debug, Clone, Copy, PartialEq)]
struct RelayConfig {
    min_on_time_s: u32,
    min_off_time_s: u32,
    inrush_delay_ms: u32,
    /// Invert the output pin (relay wired active-low).
    active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_on_time_s: 0,
            min_off_time_s: 0,
            inrush_delay_ms: 0,
            active_low: false,
        }
    }
}

impl RelayConfig {
    fn from_value(config: &Value) -> Self {
        Self {
            min_on_time_s: config
                .get("min_on_time_s")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            min_off_time_s: config
                .get("min_off_time_s")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            inrush_delay_ms: config
                .get("inrush_delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            active_low: config
                .get("active_low")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// GPIO relay with minimum on/off hold times.
pub struct RelayDriver {
    pin: Option<Box<dyn GpioOutput>>,
    config: RelayConfig,
    is_on: bool,
    /// Commanded state waiting out a protection window.
    pending: Option<bool>,
    last_change_ms: u64,
    protection_blocks: u32,
    command_count: u32,
    error_message: String,
}

impl RelayDriver {
    pub fn new() -> Self {
        Self {
            pin: None,
            config: RelayConfig::default(),
            is_on: false,
            pending: None,
            last_change_ms: 0,
            protection_blocks: 0,
            command_count: 0,
            error_message: String::new(),
        }
    }

    /// Commands refused by the protection window so far.
    pub fn protection_blocks(&self) -> u32 {
        self.protection_blocks
    }

    /// Milliseconds the current state must still hold before a switch is
    /// honored. Zero when the window is open.
    fn protection_remaining_ms(&self, now: u64) -> u64 {
        let hold_s = if self.is_on {
            self.config.min_on_time_s
        } else {
            self.config.min_off_time_s
        };
        let hold_ms = u64::from(hold_s) * 1000;
        let elapsed = now.saturating_sub(self.last_change_ms);
        hold_ms.saturating_sub(elapsed)
    }

    fn parse_command(payload: &Value) -> Result<bool> {
        if let Some(on) = payload.as_bool() {
            return Ok(on);
        }
        if let Some(on) = payload.get("state").and_then(Value::as_bool) {
            return Ok(on);
        }
        // Numeric convention: nonzero = on.
        if let Some(n) = payload.as_f64() {
            return Ok(n != 0.0);
        }
        Err(Error::invalid_argument(format!(
            "relay command must be bool, number, or {{state}}: {payload}"
        )))
    }

    fn apply(&mut self, on: bool) -> Result<()> {
        let pin = self
            .pin
            .as_mut()
            .ok_or_else(|| Error::invalid_state("relay not initialized"))?;
        pin.set_state(on != self.config.active_low)?;
        self.is_on = on;
        self.last_change_ms = time::now_ms();
        self.error_message.clear();
        Ok(())
    }
}

impl ActuatorDriver for RelayDriver {
    fn init(&mut self, hal: &dyn Hal, config: &Value) -> Result<()> {
        self.config = RelayConfig::from_value(config);
        let pin_id = config
            .get("pin")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument("relay config missing 'pin'"))?;
        let mut pin = hal.gpio_output(pin_id)?;
        // Known-safe power-on state.
        pin.set_state(self.config.active_low)?;
        self.pin = Some(pin);
        self.is_on = false;
        self.last_change_ms = time::now_ms();
        Ok(())
    }

    fn execute_command(&mut self, payload: &Value) -> Result<()> {
        let on = Self::parse_command(payload)?;
        self.command_count = self.command_count.wrapping_add(1);

        if on == self.is_on {
            self.pending = None;
            return Ok(());
        }

        let now = time::now_ms();
        let remaining = self.protection_remaining_ms(now);
        if remaining > 0 {
            self.protection_blocks = self.protection_blocks.wrapping_add(1);
            self.pending = Some(on);
            info!(
                "relay: {} blocked by protection for {remaining} ms",
                if on { "turn-on" } else { "turn-off" }
            );
            return Ok(());
        }

        self.apply(on)?;
        self.pending = None;
        if on && self.config.inrush_delay_ms > 0 {
            // Let inrush current subside before the caller continues.
            std::thread::sleep(std::time::Duration::from_millis(u64::from(
                self.config.inrush_delay_ms,
            )));
        }
        Ok(())
    }

    fn update(&mut self) {
        let Some(target) = self.pending else { return };
        if target == self.is_on {
            self.pending = None;
            return;
        }
        if self.protection_remaining_ms(time::now_ms()) > 0 {
            return;
        }
        match self.apply(target) {
            Ok(()) => {
                self.pending = None;
                info!(
                    "relay: applied deferred {} after protection window",
                    if target { "turn-on" } else { "turn-off" }
                );
            }
            Err(e) => {
                warn!("relay: deferred switch failed: {e}");
                self.error_message = e.to_string();
            }
        }
    }

    fn get_status(&self) -> ActuatorStatus {
        ActuatorStatus {
            is_active: self.is_on,
            current_value: if self.is_on { 1.0 } else { 0.0 },
            state_description: if self.is_on { "ON" } else { "OFF" }.to_string(),
            last_change_ms: self.last_change_ms,
            is_healthy: self.pin.is_some() && self.error_message.is_empty(),
            error_message: self.error_message.clone(),
        }
    }

    fn emergency_stop(&mut self) {
        self.pending = None;
        if let Err(e) = self.apply(false) {
            warn!("relay: emergency stop could not drive pin: {e}");
            self.error_message = e.to_string();
        }
    }

    fn type_name(&self) -> &'static str {
        "relay"
    }

    fn description(&self) -> &'static str {
        "GPIO relay with min on/off protection"
    }

    fn is_available(&self) -> bool {
        self.pin.is_some()
    }

    fn get_config(&self) -> Value {
        json!({
            "min_on_time_s": self.config.min_on_time_s,
            "min_off_time_s": self.config.min_off_time_s,
            "inrush_delay_ms": self.config.inrush_delay_ms,
            "active_low": self.config.active_low,
        })
    }

    fn set_config(&mut self, config: &Value) -> Result<()> {
        self.config = RelayConfig::from_value(config);
        Ok(())
    }

    fn ui_schema(&self) -> Value {
        json!({
            "type": "toggle",
            "label": "Relay",
            "command": { "kind": "bool" },
        })
    }

    fn diagnostics(&self) -> Value {
        json!({
            "command_count": self.command_count,
            "protection_blocks": self.protection_blocks,
            "pending": self.pending,
            "last_change_ms": self.last_change_ms,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

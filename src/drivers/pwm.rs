//! Variable-duty PWM actuator (fans, dimmable lighting, proportional
//! valves) on a hardware PWM channel.
//!
//! Commands carry a duty in percent. The driver clamps to the configured
//! `[min_duty_percent, max_duty_percent]` band and, when `ramp_time_ms`
//! is set, slews linearly to the target across successive `update()`
//! calls instead of stepping. Gamma correction is applied at the very
//! end, just before conversion to the 8-bit hardware representation.

use log::warn;
use serde_json::{Value, json};

use crate::drivers::{ActuatorDriver, ActuatorStatus};
use crate::error::{Error, Result};
use crate::hal::{Hal, PwmChannel};
use crate::time;

/// Duty changes smaller than this skip the ramp.
const RAMP_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PwmConfig {
    min_duty_percent: f64,
    max_duty_percent: f64,
    ramp_time_ms: u32,
    gamma: f64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            min_duty_percent: 0.0,
            max_duty_percent: 100.0,
            ramp_time_ms: 0,
            gamma: 1.0,
        }
    }
}

impl PwmConfig {
    fn from_value(config: &Value) -> Self {
        let defaults = Self::default();
        Self {
            min_duty_percent: config
                .get("min_duty_percent")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.min_duty_percent),
            max_duty_percent: config
                .get("max_duty_percent")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.max_duty_percent),
            ramp_time_ms: config
                .get("ramp_time_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            gamma: config.get("gamma").and_then(Value::as_f64).unwrap_or(1.0),
        }
    }
}

struct Ramp {
    from: f64,
    target: f64,
    start_ms: u64,
    duration_ms: u64,
}

/// PWM actuator with clamping, ramping, and gamma correction.
pub struct PwmDriver {
    channel: Option<Box<dyn PwmChannel>>,
    config: PwmConfig,
    /// Logical duty in percent, before gamma.
    duty: f64,
    ramp: Option<Ramp>,
    last_change_ms: u64,
    command_count: u32,
    error_message: String,
}

impl PwmDriver {
    pub fn new() -> Self {
        Self {
            channel: None,
            config: PwmConfig::default(),
            duty: 0.0,
            ramp: None,
            last_change_ms: 0,
            command_count: 0,
            error_message: String::new(),
        }
    }

    /// Logical duty currently driven, percent.
    pub fn current_duty(&self) -> f64 {
        self.duty
    }

    fn parse_command(payload: &Value) -> Result<f64> {
        if let Some(duty) = payload.as_f64() {
            return Ok(duty);
        }
        if let Some(duty) = payload.get("duty").and_then(Value::as_f64) {
            return Ok(duty);
        }
        Err(Error::invalid_argument(format!(
            "pwm command must be a number or {{duty}}: {payload}"
        )))
    }

    fn clamp(&self, duty: f64) -> f64 {
        duty.clamp(0.0, 100.0)
            .clamp(self.config.min_duty_percent, self.config.max_duty_percent)
    }

    fn drive(&mut self, duty: f64) -> Result<()> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::invalid_state("pwm not initialized"))?;
        // Gamma-correct the normalized duty, then widen to 8-bit.
        let normalized = (duty / 100.0).clamp(0.0, 1.0);
        let corrected = normalized.powf(self.config.gamma);
        let raw = (corrected * 255.0).round() as u8;
        channel.set_duty_raw(raw)?;
        self.duty = duty;
        self.last_change_ms = time::now_ms();
        Ok(())
    }
}

impl ActuatorDriver for PwmDriver {
    fn init(&mut self, hal: &dyn Hal, config: &Value) -> Result<()> {
        self.config = PwmConfig::from_value(config);
        if self.config.gamma <= 0.0 {
            return Err(Error::invalid_argument("pwm gamma must be positive"));
        }
        if self.config.min_duty_percent > self.config.max_duty_percent {
            return Err(Error::invalid_argument(
                "pwm min_duty_percent exceeds max_duty_percent",
            ));
        }
        let channel_id = config
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument("pwm config missing 'channel'"))?;
        let mut channel = hal.pwm_channel(channel_id)?;
        channel.set_duty_raw(0)?;
        self.channel = Some(channel);
        self.duty = 0.0;
        self.last_change_ms = time::now_ms();
        Ok(())
    }

    fn execute_command(&mut self, payload: &Value) -> Result<()> {
        let target = self.clamp(Self::parse_command(payload)?);
        self.command_count = self.command_count.wrapping_add(1);

        if self.config.ramp_time_ms > 0 && (target - self.duty).abs() > RAMP_EPSILON {
            self.ramp = Some(Ramp {
                from: self.duty,
                target,
                start_ms: time::now_ms(),
                duration_ms: u64::from(self.config.ramp_time_ms),
            });
            return Ok(());
        }
        self.ramp = None;
        self.drive(target)
    }

    fn update(&mut self) {
        let Some(ramp) = &self.ramp else { return };
        let elapsed = time::now_ms().saturating_sub(ramp.start_ms);
        let duty = if elapsed >= ramp.duration_ms {
            ramp.target
        } else {
            let progress = elapsed as f64 / ramp.duration_ms as f64;
            ramp.from + (ramp.target - ramp.from) * progress
        };
        let finished = elapsed >= ramp.duration_ms;
        if let Err(e) = self.drive(duty) {
            warn!("pwm: ramp step failed: {e}");
            self.error_message = e.to_string();
            self.ramp = None;
            return;
        }
        if finished {
            self.ramp = None;
        }
    }

    fn get_status(&self) -> ActuatorStatus {
        ActuatorStatus {
            is_active: self.duty > 0.0,
            current_value: self.duty,
            state_description: format!("{:.0}%", self.duty),
            last_change_ms: self.last_change_ms,
            is_healthy: self.channel.is_some() && self.error_message.is_empty(),
            error_message: self.error_message.clone(),
        }
    }

    fn emergency_stop(&mut self) {
        self.ramp = None;
        if let Err(e) = self.drive(0.0) {
            warn!("pwm: emergency stop could not drive channel: {e}");
            self.error_message = e.to_string();
        }
    }

    fn type_name(&self) -> &'static str {
        "pwm"
    }

    fn description(&self) -> &'static str {
        "PWM output with ramping and gamma correction"
    }

    fn is_available(&self) -> bool {
        self.channel.is_some()
    }

    fn get_config(&self) -> Value {
        json!({
            "min_duty_percent": self.config.min_duty_percent,
            "max_duty_percent": self.config.max_duty_percent,
            "ramp_time_ms": self.config.ramp_time_ms,
            "gamma": self.config.gamma,
        })
    }

    fn set_config(&mut self, config: &Value) -> Result<()> {
        let next = PwmConfig::from_value(config);
        if next.gamma <= 0.0 || next.min_duty_percent > next.max_duty_percent {
            return Err(Error::invalid_argument("bad pwm config"));
        }
        self.config = next;
        Ok(())
    }

    fn ui_schema(&self) -> Value {
        json!({
            "type": "slider",
            "label": "Duty",
            "min": self.config.min_duty_percent,
            "max": self.config.max_duty_percent,
            "unit": "%",
        })
    }

    fn diagnostics(&self) -> Value {
        json!({
            "command_count": self.command_count,
            "duty": self.duty,
            "ramping": self.ramp.is_some(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;

    fn pwm(hal: &MockHal, config: Value) -> PwmDriver {
        let mut driver = PwmDriver::new();
        driver.init(hal, &config).unwrap();
        driver
    }

    #[test]
    fn immediate_apply_without_ramp() {
        let _clock = time::sim_lock();
        let hal = MockHal::new();
        let mut driver = pwm(&hal, json!({"channel": "fan"}));
        driver.execute_command(&json!(40.0)).unwrap();
        assert_eq!(driver.current_duty(), 40.0);
        assert_eq!(hal.pwm_duty_raw("fan"), 102); // 40% of 255
    }

    #[test]
    fn duty_clamps_to_configured_band() {
        let _clock = time::sim_lock();
        let hal = MockHal::new();
        let mut driver = pwm(
            &hal,
            json!({"channel": "fan", "min_duty_percent": 20.0, "max_duty_percent": 80.0}),
        );
        driver.execute_command(&json!(150.0)).unwrap();
        assert_eq!(driver.current_duty(), 80.0);
        driver.execute_command(&json!({"duty": 5.0})).unwrap();
        assert_eq!(driver.current_duty(), 20.0);
    }

    #[test]
    fn ramp_slews_linearly_over_updates() {
        let clock = time::sim_lock();
        let hal = MockHal::new();
        let mut driver = pwm(&hal, json!({"channel": "fan", "ramp_time_ms": 1000}));

        driver.execute_command(&json!(100.0)).unwrap();
        // Command returns immediately; duty unchanged until updates run.
        assert_eq!(driver.current_duty(), 0.0);

        clock.advance_ms(250);
        driver.update();
        assert!((driver.current_duty() - 25.0).abs() < 1.0);

        clock.advance_ms(250);
        driver.update();
        assert!((driver.current_duty() - 50.0).abs() < 1.0);

        clock.advance_ms(600);
        driver.update();
        assert_eq!(driver.current_duty(), 100.0);
        assert_eq!(hal.pwm_duty_raw("fan"), 255);
    }

    #[test]
    fn tiny_change_skips_the_ramp() {
        let _clock = time::sim_lock();
        let hal = MockHal::new();
        let mut driver = pwm(&hal, json!({"channel": "fan", "ramp_time_ms": 1000}));
        driver.execute_command(&json!(0.05)).unwrap();
        assert!((driver.current_duty() - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn gamma_correction_shapes_the_raw_duty() {
        let _clock = time::sim_lock();
        let hal = MockHal::new();
        let mut driver = pwm(&hal, json!({"channel": "led", "gamma": 2.2}));
        driver.execute_command(&json!(50.0)).unwrap();
        // 0.5^2.2 ≈ 0.2176 → ≈ 55/255
        assert_eq!(hal.pwm_duty_raw("led"), 55);
    }

    #[test]
    fn emergency_stop_cancels_ramp_and_zeroes() {
        let clock = time::sim_lock();
        let hal = MockHal::new();
        let mut driver = pwm(&hal, json!({"channel": "fan", "ramp_time_ms": 5000}));
        driver.execute_command(&json!(90.0)).unwrap();
        clock.advance_ms(1000);
        driver.update();
        assert!(driver.current_duty() > 0.0);

        driver.emergency_stop();
        assert_eq!(driver.current_duty(), 0.0);
        assert!(!driver.get_status().is_active);
        clock.advance_ms(10_000);
        driver.update();
        assert_eq!(driver.current_duty(), 0.0);
    }

    #[test]
    fn bad_config_is_rejected() {
        let hal = MockHal::new();
        let mut driver = PwmDriver::new();
        assert!(
            driver
                .init(&hal, &json!({"channel": "x", "gamma": 0.0}))
                .is_err()
        );
        assert!(
            driver
                .init(
                    &hal,
                    &json!({"channel": "x", "min_duty_percent": 90.0, "max_duty_percent": 10.0})
                )
                .is_err()
        );
        assert!(driver.init(&hal, &json!({})).is_err());
    }
}

//! NTC thermistor temperature sensor (10 kOhm @ 25 C, B = 3950 by
//! default).
//!
//! Wired in a voltage divider with a fixed resistor and read through an
//! ADC channel. The simplified Beta (Steinhart-Hart) equation converts
//! resistance to temperature. Readings at the ADC rails mean a shorted
//! or disconnected probe and are reported invalid.

use serde_json::{Value, json};

use crate::drivers::{SensorDriver, SensorReading};
use crate::error::{Error, Result};
use crate::hal::{AdcChannel, Hal};

const ADC_MAX: f64 = 4095.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct NtcConfig {
    r25_ohm: f64,
    beta: f64,
    r_divider_ohm: f64,
    v_ref: f64,
    /// Additive calibration offset, degrees C.
    offset_c: f64,
}

impl Default for NtcConfig {
    fn default() -> Self {
        Self {
            r25_ohm: 10_000.0,
            beta: 3950.0,
            r_divider_ohm: 10_000.0,
            v_ref: 3.3,
            offset_c: 0.0,
        }
    }
}

impl NtcConfig {
    fn from_value(config: &Value) -> Self {
        let d = Self::default();
        Self {
            r25_ohm: config
                .get("r25_ohm")
                .and_then(Value::as_f64)
                .unwrap_or(d.r25_ohm),
            beta: config.get("beta").and_then(Value::as_f64).unwrap_or(d.beta),
            r_divider_ohm: config
                .get("r_divider_ohm")
                .and_then(Value::as_f64)
                .unwrap_or(d.r_divider_ohm),
            v_ref: config
                .get("v_ref")
                .and_then(Value::as_f64)
                .unwrap_or(d.v_ref),
            offset_c: config
                .get("offset_c")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        }
    }
}

/// Beta-equation NTC probe on an ADC channel.
pub struct NtcSensor {
    adc: Option<Box<dyn AdcChannel>>,
    config: NtcConfig,
}

impl NtcSensor {
    pub fn new() -> Self {
        Self {
            adc: None,
            config: NtcConfig::default(),
        }
    }

    fn raw_to_celsius(&self, raw: u16) -> Option<f64> {
        let voltage = (f64::from(raw) / ADC_MAX) * self.config.v_ref;
        // Rails mean an open or shorted divider.
        if voltage <= 0.01 || voltage >= self.config.v_ref - 0.01 {
            return None;
        }
        let r_ntc = self.config.r_divider_ohm * voltage / (self.config.v_ref - voltage);
        let t25_k = 298.15;
        let inv_t = (1.0 / t25_k) + (1.0 / self.config.beta) * (r_ntc / self.config.r25_ohm).ln();
        if inv_t <= 0.0 {
            return None;
        }
        Some((1.0 / inv_t) - 273.15 + self.config.offset_c)
    }
}

impl SensorDriver for NtcSensor {
    fn init(&mut self, hal: &dyn Hal, config: &Value) -> Result<()> {
        self.config = NtcConfig::from_value(config);
        if self.config.beta <= 0.0 || self.config.r25_ohm <= 0.0 {
            return Err(Error::invalid_argument("ntc beta and r25 must be positive"));
        }
        let channel_id = config
            .get("adc")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument("ntc config missing 'adc'"))?;
        self.adc = Some(hal.adc_channel(channel_id)?);
        Ok(())
    }

    fn read(&mut self) -> SensorReading {
        let Some(adc) = self.adc.as_mut() else {
            return SensorReading::invalid("°C", "not initialized");
        };
        let raw = match adc.read_raw() {
            Ok(raw) => raw,
            Err(e) => return SensorReading::invalid("°C", format!("ADC read failed: {e}")),
        };
        match self.raw_to_celsius(raw) {
            Some(celsius) => SensorReading::ok(celsius, "°C"),
            None => SensorReading::invalid("°C", format!("probe open or shorted (raw {raw})")),
        }
    }

    fn type_name(&self) -> &'static str {
        "ntc"
    }

    fn description(&self) -> &'static str {
        "NTC thermistor on ADC (Beta equation)"
    }

    fn is_available(&self) -> bool {
        self.adc.is_some()
    }

    fn get_config(&self) -> Value {
        json!({
            "r25_ohm": self.config.r25_ohm,
            "beta": self.config.beta,
            "r_divider_ohm": self.config.r_divider_ohm,
            "v_ref": self.config.v_ref,
            "offset_c": self.config.offset_c,
        })
    }

    fn set_config(&mut self, config: &Value) -> Result<()> {
        let next = NtcConfig::from_value(config);
        if next.beta <= 0.0 || next.r25_ohm <= 0.0 {
            return Err(Error::invalid_argument("bad ntc config"));
        }
        self.config = next;
        Ok(())
    }

    fn ui_schema(&self) -> Value {
        json!({
            "type": "gauge",
            "label": "Temperature",
            "unit": "°C",
            "min": -40.0,
            "max": 125.0,
        })
    }

    fn diagnostics(&self) -> Value {
        json!({ "offset_c": self.config.offset_c })
    }

    /// Single-point calibration: `{"reference_c": <known temperature>}`
    /// adjusts the additive offset from the current raw reading.
    fn calibrate(&mut self, payload: &Value) -> Result<()> {
        let reference = payload
            .get("reference_c")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::invalid_argument("calibrate payload needs 'reference_c'"))?;
        let reading = self.read();
        if !reading.is_valid {
            return Err(Error::invalid_state("cannot calibrate from invalid reading"));
        }
        self.config.offset_c += reference - reading.value;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;

    fn ntc(hal: &MockHal) -> NtcSensor {
        let mut sensor = NtcSensor::new();
        sensor.init(hal, &json!({"adc": "adc_chamber"})).unwrap();
        sensor
    }

    #[test]
    fn midscale_reads_room_temperature() {
        let hal = MockHal::new();
        hal.set_adc_raw("adc_chamber", 2048);
        let mut sensor = ntc(&hal);
        let reading = sensor.read();
        assert!(reading.is_valid);
        // Half-rail means R_ntc == R_divider == R25 → 25 C.
        assert!((reading.value - 25.0).abs() < 0.5, "{}", reading.value);
        assert_eq!(reading.unit, "°C");
    }

    #[test]
    fn rail_readings_are_invalid() {
        let hal = MockHal::new();
        let mut sensor = ntc(&hal);
        hal.set_adc_raw("adc_chamber", 0);
        assert!(!sensor.read().is_valid);
        hal.set_adc_raw("adc_chamber", 4095);
        assert!(!sensor.read().is_valid);
    }

    #[test]
    fn colder_probe_reads_lower() {
        let hal = MockHal::new();
        let mut sensor = ntc(&hal);
        // Higher NTC resistance (cold) → higher divider voltage → higher raw.
        hal.set_adc_raw("adc_chamber", 3000);
        let cold = sensor.read();
        hal.set_adc_raw("adc_chamber", 2048);
        let room = sensor.read();
        assert!(cold.value < room.value);
    }

    #[test]
    fn single_point_calibration_shifts_readings() {
        let hal = MockHal::new();
        hal.set_adc_raw("adc_chamber", 2048);
        let mut sensor = ntc(&hal);
        let before = sensor.read().value;
        sensor.calibrate(&json!({"reference_c": before + 1.5})).unwrap();
        let after = sensor.read().value;
        assert!((after - before - 1.5).abs() < 1e-9);
    }

    #[test]
    fn missing_adc_id_fails_init() {
        let hal = MockHal::new();
        let mut sensor = NtcSensor::new();
        assert!(sensor.init(&hal, &json!({})).is_err());
    }
}

//! DS18B20 digital temperature sensor on a 1-Wire bus.
//!
//! A 12-bit conversion takes up to 750 ms; blocking that long inside the
//! tick loop is not allowed, so the driver runs a two-phase state
//! machine advanced by `update()`:
//!
//! ```text
//! Idle ──start convert (0x44)──▶ Converting ──750 ms──▶ read scratchpad
//!  ▲                                                         │
//!  └──────────────── latest reading stored ◀─────────────────┘
//! ```
//!
//! `read()` returns the most recently completed conversion; it never
//! touches the bus.

use heapless::Vec as HVec;
use log::warn;
use serde_json::{Value, json};

use crate::drivers::{SensorDriver, SensorReading};
use crate::error::{Error, Result};
use crate::hal::{Hal, OneWireBus};
use crate::time;

/// Worst-case 12-bit conversion time.
const CONVERT_TIME_MS: u64 = 750;

const CMD_SKIP_ROM: u8 = 0xCC;
const CMD_CONVERT_T: u8 = 0x44;
const CMD_READ_SCRATCHPAD: u8 = 0xBE;

/// Dallas/Maxim CRC-8 (polynomial 0x31 reflected).
pub fn dallas_crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        let mut byte = *byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
    }
    crc
}

enum ConvertState {
    Idle,
    Converting { since_ms: u64 },
}

/// Single DS18B20 per bus (skip-ROM addressing).
pub struct Ds18b20Sensor {
    bus: Option<Box<dyn OneWireBus>>,
    state: ConvertState,
    latest: Option<SensorReading>,
    presence_ok: bool,
    crc_failures: u32,
    offset_c: f64,
}

impl Ds18b20Sensor {
    pub fn new() -> Self {
        Self {
            bus: None,
            state: ConvertState::Idle,
            latest: None,
            presence_ok: false,
            crc_failures: 0,
            offset_c: 0.0,
        }
    }

    fn start_conversion(&mut self) {
        let Some(bus) = self.bus.as_mut() else { return };
        match bus.reset() {
            Ok(true) => {}
            Ok(false) => {
                self.presence_ok = false;
                self.latest = Some(SensorReading::invalid("°C", "no presence on bus"));
                return;
            }
            Err(e) => {
                self.presence_ok = false;
                self.latest = Some(SensorReading::invalid("°C", format!("bus reset: {e}")));
                return;
            }
        }
        self.presence_ok = true;
        if let Err(e) = bus.write_bytes(&[CMD_SKIP_ROM, CMD_CONVERT_T]) {
            warn!("ds18b20: convert command failed: {e}");
            return;
        }
        self.state = ConvertState::Converting {
            since_ms: time::now_ms(),
        };
    }

    fn finish_conversion(&mut self) {
        self.state = ConvertState::Idle;
        let Some(bus) = self.bus.as_mut() else { return };

        let result = (|| -> Result<[u8; 9]> {
            if !bus.reset()? {
                return Err(Error::hardware("no presence on bus"));
            }
            bus.write_bytes(&[CMD_SKIP_ROM, CMD_READ_SCRATCHPAD])?;
            let mut scratch = [0u8; 9];
            bus.read_bytes(&mut scratch)?;
            Ok(scratch)
        })();

        let scratch = match result {
            Ok(scratch) => scratch,
            Err(e) => {
                self.presence_ok = false;
                self.latest = Some(SensorReading::invalid("°C", e.to_string()));
                return;
            }
        };

        if dallas_crc8(&scratch[..8]) != scratch[8] {
            self.crc_failures = self.crc_failures.wrapping_add(1);
            self.latest = Some(SensorReading::invalid("°C", "scratchpad CRC mismatch"));
            return;
        }

        let sixteenths = i16::from_le_bytes([scratch[0], scratch[1]]);
        let celsius = f64::from(sixteenths) / 16.0 + self.offset_c;
        self.latest = Some(SensorReading::ok(celsius, "°C"));
    }
}

impl SensorDriver for Ds18b20Sensor {
    fn init(&mut self, hal: &dyn Hal, config: &Value) -> Result<()> {
        let bus_id = config
            .get("bus")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument("ds18b20 config missing 'bus'"))?;
        self.offset_c = config
            .get("offset_c")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let mut bus = hal.onewire_bus(bus_id)?;
        self.presence_ok = bus.reset()?;
        self.bus = Some(bus);
        self.state = ConvertState::Idle;
        Ok(())
    }

    fn read(&mut self) -> SensorReading {
        match &self.latest {
            Some(reading) => reading.clone(),
            None => SensorReading::invalid("°C", "no conversion completed yet"),
        }
    }

    fn update(&mut self) {
        match self.state {
            ConvertState::Idle => self.start_conversion(),
            ConvertState::Converting { since_ms } => {
                if time::now_ms().saturating_sub(since_ms) >= CONVERT_TIME_MS {
                    self.finish_conversion();
                }
            }
        }
    }

    fn type_name(&self) -> &'static str {
        "ds18b20"
    }

    fn description(&self) -> &'static str {
        "DS18B20 1-Wire temperature sensor"
    }

    fn is_available(&self) -> bool {
        self.bus.is_some() && self.presence_ok
    }

    fn get_config(&self) -> Value {
        json!({ "offset_c": self.offset_c })
    }

    fn set_config(&mut self, config: &Value) -> Result<()> {
        self.offset_c = config
            .get("offset_c")
            .and_then(Value::as_f64)
            .unwrap_or(self.offset_c);
        Ok(())
    }

    fn ui_schema(&self) -> Value {
        json!({
            "type": "gauge",
            "label": "Temperature",
            "unit": "°C",
            "min": -55.0,
            "max": 125.0,
        })
    }

    fn diagnostics(&self) -> Value {
        // Keep the last few scratchpad health indicators compact.
        let mut flags: HVec<&str, 2> = HVec::new();
        if !self.presence_ok {
            let _ = flags.push("no_presence");
        }
        if self.crc_failures > 0 {
            let _ = flags.push("crc_failures");
        }
        json!({
            "presence_ok": self.presence_ok,
            "crc_failures": self.crc_failures,
            "flags": flags.as_slice(),
            "offset_c": self.offset_c,
        })
    }

    /// Offset calibration: `{"reference_c": <known temperature>}`.
    fn calibrate(&mut self, payload: &Value) -> Result<()> {
        let reference = payload
            .get("reference_c")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::invalid_argument("calibrate payload needs 'reference_c'"))?;
        let reading = self.read();
        if !reading.is_valid {
            return Err(Error::invalid_state("cannot calibrate from invalid reading"));
        }
        self.offset_c += reference - reading.value;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

//! Scripted in-memory HAL for tests and the simulator binary.
//!
//! Every resource is shared between the driver-held handle and the
//! [`MockHal`], so a test can observe a relay's output pin or inject an
//! ADC value while the runtime owns the driver:
//!
//! ```text
//! driver ──▶ MockGpioOutput ──┐
//!                             ├── Arc<AtomicBool> ◀── test asserts
//! MockHal.gpio_level("r1") ───┘
//! ```
//!
//! The 1-Wire mock emulates a single DS18B20 on the bus: it answers the
//! convert / read-scratchpad command sequence with a scratchpad built
//! from the injected temperature, including a valid Dallas CRC.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};

use crate::drivers::ds18b20::dallas_crc8;
use crate::error::{Error, Result};
use crate::hal::{AdcChannel, GpioInput, GpioOutput, Hal, I2cBus, OneWireBus, PwmChannel};

// ── Resource cells ────────────────────────────────────────────

#[derive(Default)]
struct OneWireCell {
    /// Injected temperature in milli-degrees C.
    temp_milli_c: i32,
    /// Whether a device answers the presence pulse.
    present: bool,
    /// Last command byte seen (0x44 convert, 0xBE read scratchpad).
    last_command: u8,
}

#[derive(Default)]
struct Resources {
    outputs: HashMap<String, Arc<AtomicBool>>,
    inputs: HashMap<String, Arc<AtomicBool>>,
    adcs: HashMap<String, Arc<AtomicU16>>,
    pwms: HashMap<String, Arc<AtomicU8>>,
    onewire: HashMap<String, Arc<Mutex<OneWireCell>>>,
    i2c: HashMap<String, Arc<Mutex<Vec<(u8, Vec<u8>)>>>>,
    failing: HashSet<String>,
}

/// In-memory HAL. Resources are created on first request.
#[derive(Default)]
pub struct MockHal {
    resources: Mutex<Resources>,
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request for `id` fail with `HardwareError`.
    pub fn set_failing(&self, id: &str, failing: bool) {
        let mut res = self.resources.lock();
        if failing {
            res.failing.insert(id.to_string());
        } else {
            res.failing.remove(id);
        }
    }

    /// Observe the level last commanded on an output pin.
    pub fn gpio_level(&self, id: &str) -> bool {
        self.resources
            .lock()
            .outputs
            .entry(id.to_string())
            .or_default()
            .load(Ordering::Relaxed)
    }

    /// Inject the level of an input pin.
    pub fn set_input(&self, id: &str, high: bool) {
        self.resources
            .lock()
            .inputs
            .entry(id.to_string())
            .or_default()
            .store(high, Ordering::Relaxed);
    }

    /// Inject a raw ADC conversion value (12-bit).
    pub fn set_adc_raw(&self, id: &str, raw: u16) {
        self.resources
            .lock()
            .adcs
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AtomicU16::new(2048)))
            .store(raw, Ordering::Relaxed);
    }

    /// Observe the raw duty last commanded on a PWM channel.
    pub fn pwm_duty_raw(&self, id: &str) -> u8 {
        self.resources
            .lock()
            .pwms
            .entry(id.to_string())
            .or_default()
            .load(Ordering::Relaxed)
    }

    /// Inject the DS18B20 temperature on a 1-Wire bus.
    pub fn set_onewire_temp(&self, id: &str, celsius: f64) {
        let cell = self.onewire_cell(id);
        let mut cell = cell.lock();
        cell.temp_milli_c = (celsius * 1000.0) as i32;
        cell.present = true;
    }

    /// Detach the device from a 1-Wire bus (presence pulse fails).
    pub fn set_onewire_present(&self, id: &str, present: bool) {
        self.onewire_cell(id).lock().present = present;
    }

    /// Bytes written to an I²C bus so far, per transaction.
    pub fn i2c_writes(&self, id: &str) -> Vec<(u8, Vec<u8>)> {
        self.i2c_log(id).lock().clone()
    }

    fn i2c_log(&self, id: &str) -> Arc<Mutex<Vec<(u8, Vec<u8>)>>> {
        self.resources
            .lock()
            .i2c
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn check_failing(&self, id: &str) -> Result<()> {
        if self.resources.lock().failing.contains(id) {
            return Err(Error::hardware(format!("mock resource '{id}' failing")));
        }
        Ok(())
    }

    fn onewire_cell(&self, id: &str) -> Arc<Mutex<OneWireCell>> {
        self.resources
            .lock()
            .onewire
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(OneWireCell {
                    temp_milli_c: 25_000,
                    present: true,
                    last_command: 0,
                }))
            })
            .clone()
    }
}

impl Hal for MockHal {
    fn gpio_output(&self, id: &str) -> Result<Box<dyn GpioOutput>> {
        self.check_failing(id)?;
        let level = self
            .resources
            .lock()
            .outputs
            .entry(id.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MockGpioOutput { level }))
    }

    fn gpio_input(&self, id: &str) -> Result<Box<dyn GpioInput>> {
        self.check_failing(id)?;
        let level = self
            .resources
            .lock()
            .inputs
            .entry(id.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MockGpioInput { level }))
    }

    fn adc_channel(&self, id: &str) -> Result<Box<dyn AdcChannel>> {
        self.check_failing(id)?;
        let raw = self
            .resources
            .lock()
            .adcs
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AtomicU16::new(2048)))
            .clone();
        Ok(Box::new(MockAdcChannel { raw }))
    }

    fn pwm_channel(&self, id: &str) -> Result<Box<dyn PwmChannel>> {
        self.check_failing(id)?;
        let duty = self
            .resources
            .lock()
            .pwms
            .entry(id.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MockPwmChannel { duty }))
    }

    fn onewire_bus(&self, id: &str) -> Result<Box<dyn OneWireBus>> {
        self.check_failing(id)?;
        Ok(Box::new(MockOneWire {
            cell: self.onewire_cell(id),
        }))
    }

    fn i2c_bus(&self, id: &str) -> Result<Box<dyn I2cBus>> {
        self.check_failing(id)?;
        Ok(Box::new(MockI2c {
            log: self.i2c_log(id),
        }))
    }
}

// ── Handles ───────────────────────────────────────────────────

struct MockGpioOutput {
    level: Arc<AtomicBool>,
}

impl GpioOutput for MockGpioOutput {
    fn set_state(&mut self, high: bool) -> Result<()> {
        self.level.store(high, Ordering::Relaxed);
        Ok(())
    }

    fn is_set_high(&self) -> bool {
        self.level.load(Ordering::Relaxed)
    }
}

struct MockGpioInput {
    level: Arc<AtomicBool>,
}

impl GpioInput for MockGpioInput {
    fn is_high(&mut self) -> Result<bool> {
        Ok(self.level.load(Ordering::Relaxed))
    }
}

struct MockAdcChannel {
    raw: Arc<AtomicU16>,
}

impl AdcChannel for MockAdcChannel {
    fn read_raw(&mut self) -> Result<u16> {
        Ok(self.raw.load(Ordering::Relaxed))
    }
}

struct MockPwmChannel {
    duty: Arc<AtomicU8>,
}

impl PwmChannel for MockPwmChannel {
    fn set_duty_raw(&mut self, duty: u8) -> Result<()> {
        self.duty.store(duty, Ordering::Relaxed);
        Ok(())
    }

    fn duty_raw(&self) -> u8 {
        self.duty.load(Ordering::Relaxed)
    }
}

struct MockOneWire {
    cell: Arc<Mutex<OneWireCell>>,
}

impl OneWireBus for MockOneWire {
    fn reset(&mut self) -> Result<bool> {
        Ok(self.cell.lock().present)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let mut cell = self.cell.lock();
        if !cell.present {
            return Err(Error::hardware("no presence on 1-wire bus"));
        }
        // Remember the last function command (skip-ROM 0xCC is addressing).
        for byte in data {
            if *byte != 0xCC {
                cell.last_command = *byte;
            }
        }
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let cell = self.cell.lock();
        if !cell.present {
            return Err(Error::hardware("no presence on 1-wire bus"));
        }
        if cell.last_command != 0xBE {
            return Err(Error::hardware("read without read-scratchpad command"));
        }
        // DS18B20 scratchpad: temp in 1/16 °C steps, 12-bit config, CRC.
        let sixteenths = (cell.temp_milli_c as i64 * 16 / 1000) as i16;
        let mut scratch = [0u8; 9];
        scratch[0] = (sixteenths & 0xFF) as u8;
        scratch[1] = ((sixteenths >> 8) & 0xFF) as u8;
        scratch[2] = 0x4B; // TH default
        scratch[3] = 0x46; // TL default
        scratch[4] = 0x7F; // 12-bit resolution
        scratch[5] = 0xFF;
        scratch[6] = 0x0C;
        scratch[7] = 0x10;
        scratch[8] = dallas_crc8(&scratch[..8]);
        let n = buf.len().min(scratch.len());
        buf[..n].copy_from_slice(&scratch[..n]);
        Ok(())
    }
}

struct MockI2c {
    log: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
}

impl I2cBus for MockI2c {
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        self.log.lock().push((addr, data.to_vec()));
        Ok(())
    }

    fn write_read(&mut self, addr: u8, data: &[u8], buf: &mut [u8]) -> Result<()> {
        self.log.lock().push((addr, data.to_vec()));
        buf.fill(0);
        Ok(())
    }
}

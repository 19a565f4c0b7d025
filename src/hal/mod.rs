//! Hardware abstraction boundary.
//!
//! The core never touches registers: drivers obtain resources from a
//! [`Hal`] by identifier string at `init` and hold them for the life of
//! the instance. Identifiers come from the board descriptor; the HAL
//! promises that handles stay valid for the lifetime of the application.
//!
//! Two implementations ship with the crate: [`ehal`] adapts any
//! `embedded-hal` 1.0 pin into the contract (board crates plug in
//! unchanged), and [`mock`] is the fully scripted in-memory HAL used by
//! tests and the simulator binary.

pub mod ehal;
pub mod mock;

use crate::error::Result;

/// Push-pull digital output.
pub trait GpioOutput: Send {
    fn set_state(&mut self, high: bool) -> Result<()>;

    /// Last commanded level (not a readback of the physical pin).
    fn is_set_high(&self) -> bool;

    fn set_high(&mut self) -> Result<()> {
        self.set_state(true)
    }

    fn set_low(&mut self) -> Result<()> {
        self.set_state(false)
    }
}

/// Digital input.
pub trait GpioInput: Send {
    fn is_high(&mut self) -> Result<bool>;
}

/// Single ADC channel.
pub trait AdcChannel: Send {
    /// Raw conversion result, 12-bit right-aligned.
    fn read_raw(&mut self) -> Result<u16>;
}

/// Hardware PWM channel (LEDC or equivalent).
pub trait PwmChannel: Send {
    /// Set the duty in the hardware representation, 8-bit.
    fn set_duty_raw(&mut self, duty: u8) -> Result<()>;

    /// Last commanded raw duty.
    fn duty_raw(&self) -> u8;
}

/// Bit-banged or peripheral-backed 1-Wire bus.
pub trait OneWireBus: Send {
    /// Issue a reset pulse; true if any device answered presence.
    fn reset(&mut self) -> Result<bool>;

    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Shared I²C bus. Drivers address devices per transaction.
pub trait I2cBus: Send {
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()>;

    fn write_read(&mut self, addr: u8, data: &[u8], buf: &mut [u8]) -> Result<()>;
}

/// The board-level resource factory consumed by drivers at `init`.
pub trait Hal: Send + Sync {
    fn gpio_output(&self, id: &str) -> Result<Box<dyn GpioOutput>>;

    fn gpio_input(&self, id: &str) -> Result<Box<dyn GpioInput>>;

    fn adc_channel(&self, id: &str) -> Result<Box<dyn AdcChannel>>;

    fn pwm_channel(&self, id: &str) -> Result<Box<dyn PwmChannel>>;

    fn onewire_bus(&self, id: &str) -> Result<Box<dyn OneWireBus>>;

    fn i2c_bus(&self, id: &str) -> Result<Box<dyn I2cBus>>;
}

//! Adapters from `embedded-hal` 1.0 traits into the core HAL contract.
//!
//! Board support crates expose their pins through `embedded-hal`; these
//! wrappers let a board hand those pins to the core without writing glue
//! per driver. Errors from the underlying pin map to
//! [`ErrorKind::HardwareError`](crate::error::ErrorKind::HardwareError).

use embedded_hal::digital::{InputPin, OutputPin};

use crate::error::{Error, Result};
use crate::hal::{GpioInput, GpioOutput};

/// Wrap an `embedded-hal` output pin. Tracks the last commanded level
/// because `OutputPin` has no readback.
pub struct EhalOutput<P> {
    pin: P,
    high: bool,
}

impl<P: OutputPin + Send> EhalOutput<P> {
    pub fn new(pin: P, initial_high: bool) -> Self {
        Self {
            pin,
            high: initial_high,
        }
    }
}

impl<P: OutputPin + Send> GpioOutput for EhalOutput<P> {
    fn set_state(&mut self, high: bool) -> Result<()> {
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|e| Error::hardware(format!("gpio write: {e:?}")))?;
        self.high = high;
        Ok(())
    }

    fn is_set_high(&self) -> bool {
        self.high
    }
}

/// Wrap an `embedded-hal` input pin.
pub struct EhalInput<P> {
    pin: P,
}

impl<P: InputPin + Send> EhalInput<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: InputPin + Send> GpioInput for EhalInput<P> {
    fn is_high(&mut self) -> Result<bool> {
        self.pin
            .is_high()
            .map_err(|e| Error::hardware(format!("gpio read: {e:?}")))
    }
}

//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     the narrow seams between the node's core and its physical peripherals:
//!     an i2c bus for the bmp280 and an on/off output for the status led.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (logging mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": without the `hardware` feature nothing here
//!       touches /dev, so the node builds and runs on any host.
//!     - drivers are generic over these traits, so tests substitute fakes.
//!
//! relationships:
//!     - used by: sensors/bmp280.rs (I2cBus), main.rs (led output)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

use crate::error::SensorError;

/// Register-oriented access to an I2C bus.
pub trait I2cBus: Send {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), SensorError>;
    fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<(), SensorError>;
}

/// The status LED driven by the persisted `switch_state`.
pub trait SwitchOutput: Send {
    fn set(&mut self, on: bool) -> Result<()>;
    fn is_on(&self) -> bool;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For Non-Hardware Build)
// ==============================================================================================

/// LED stand-in that only records and logs its state.
#[cfg(any(test, not(feature = "hardware")))]
#[derive(Debug, Default)]
pub struct MockLed {
    pin: u8,
    on: bool,
}

#[cfg(any(test, not(feature = "hardware")))]
impl MockLed {
    pub fn new(pin: u8) -> Self {
        Self { pin, on: false }
    }
}

#[cfg(any(test, not(feature = "hardware")))]
impl SwitchOutput for MockLed {
    fn set(&mut self, on: bool) -> Result<()> {
        tracing::debug!("[MOCK LED] Pin {} set to {}", self.pin, if on { "ON" } else { "OFF" });
        self.on = on;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

/// Open the LED output on `pin`.
#[cfg(not(feature = "hardware"))]
pub fn led_output(pin: u8) -> Result<Box<dyn SwitchOutput>> {
    tracing::info!("Using MOCK LED (No hardware access)");
    Ok(Box::new(MockLed::new(pin)))
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

#[cfg(feature = "hardware")]
pub use real::{led_output, open_i2c, RppalI2c};

#[cfg(feature = "hardware")]
mod real {
    use super::{I2cBus, SwitchOutput};
    use crate::error::SensorError;
    use anyhow::{Context, Result};
    use rppal::gpio::{Gpio, OutputPin};
    use rppal::i2c::I2c;

    pub struct RppalI2c {
        bus: I2c,
    }

    /// Open the default Pi I2C bus (/dev/i2c-1).
    pub fn open_i2c() -> Result<RppalI2c> {
        let bus = I2c::new().context("failed to open i2c bus")?;
        tracing::info!("Using REAL HARDWARE I2C (rppal), bus {}", bus.bus());
        Ok(RppalI2c { bus })
    }

    impl RppalI2c {
        fn select(&mut self, addr: u8) -> Result<(), SensorError> {
            self.bus
                .set_slave_address(u16::from(addr))
                .map_err(|e| SensorError::Bus(e.to_string()))
        }
    }

    impl I2cBus for RppalI2c {
        fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), SensorError> {
            self.select(addr)?;
            self.bus
                .write(bytes)
                .map(|_| ())
                .map_err(|e| SensorError::Bus(e.to_string()))
        }

        fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<(), SensorError> {
            self.select(addr)?;
            self.bus
                .write_read(write, read)
                .map_err(|e| SensorError::Bus(e.to_string()))
        }
    }

    pub struct LedPin {
        pin: OutputPin,
        on: bool,
    }

    pub fn led_output(pin: u8) -> Result<Box<dyn SwitchOutput>> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let mut pin = gpio
            .get(pin)
            .with_context(|| format!("gpio {pin} unavailable"))?
            .into_output_low();
        // keep the led as last set when the process exits
        pin.set_reset_on_drop(false);
        tracing::info!("Using REAL HARDWARE LED (rppal) on gpio {}", pin.pin());
        Ok(Box::new(LedPin { pin, on: false }))
    }

    impl SwitchOutput for LedPin {
        fn set(&mut self, on: bool) -> Result<()> {
            if on {
                self.pin.set_high();
            } else {
                self.pin.set_low();
            }
            self.on = on;
            Ok(())
        }

        fn is_on(&self) -> bool {
            self.on
        }
    }
}

//! DHT11 humidity/temperature sensor on a single-wire GPIO line.
//!
//! The line driver only has to hand back the raw 40-bit frame; decoding and
//! checksum verification live here so they can be tested without hardware.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::domain::Field;
use crate::error::SensorError;
use crate::sensors::SensorReader;

/// The part needs at least this long between conversions.
pub const MIN_READ_INTERVAL: Duration = Duration::from_secs(1);

/// Source of raw DHT11 frames.
pub trait Dht11Line: Send {
    fn read_frame(&mut self) -> Result<[u8; 5], SensorError>;
}

/// Decode a frame into `(humidity %, temperature °C)`.
pub fn decode_frame(frame: [u8; 5]) -> Result<(f64, f64), SensorError> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        return Err(SensorError::Checksum);
    }
    let humidity = f64::from(frame[0]) + f64::from(frame[1]) / 10.0;
    let magnitude = f64::from(frame[2]) + f64::from(frame[3] & 0x7F) / 10.0;
    let temperature = if frame[3] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };
    Ok((humidity, temperature))
}

pub struct Dht11<L> {
    line: L,
    // one conversion, failed or not, serves both fields of a sample
    last: Option<(Instant, Result<[u8; 5], SensorError>)>,
}

impl<L: Dht11Line> Dht11<L> {
    pub fn new(line: L) -> Self {
        Self { line, last: None }
    }

    fn frame(&mut self) -> Result<(f64, f64), SensorError> {
        if let Some((at, result)) = &self.last {
            if at.elapsed() < MIN_READ_INTERVAL {
                return result.clone().and_then(decode_frame);
            }
        }
        let result = self.line.read_frame();
        if let Ok(frame) = &result {
            trace!("dht11 frame {}", hex::encode(frame));
        }
        self.last = Some((Instant::now(), result.clone()));
        result.and_then(decode_frame)
    }
}

impl<L: Dht11Line> SensorReader for Dht11<L> {
    fn name(&self) -> &str {
        "dht11"
    }

    fn supports(&self, field: Field) -> bool {
        matches!(field, Field::Humidity | Field::Temperature)
    }

    fn read_humidity(&mut self) -> Result<f64, SensorError> {
        self.frame().map(|(humidity, _)| humidity)
    }

    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        self.frame().map(|(_, temperature)| temperature)
    }
}

#[cfg(feature = "hardware")]
pub use gpio_line::GpioLine;

#[cfg(feature = "hardware")]
mod gpio_line {
    use super::Dht11Line;
    use crate::error::SensorError;
    use anyhow::{Context, Result};
    use rppal::gpio::{Gpio, IoPin, Level, Mode};
    use std::time::{Duration, Instant};

    // a "1" bit holds the line high for ~70us, a "0" for ~27us
    const ONE_THRESHOLD: Duration = Duration::from_micros(45);

    /// Bit-banged DHT11 protocol over an rppal pin. Userspace timing is
    /// best-effort; a missed edge surfaces as a timeout or checksum error.
    pub struct GpioLine {
        pin: IoPin,
    }

    impl GpioLine {
        pub fn open(pin: u8) -> Result<Self> {
            let gpio = Gpio::new().context("failed to open gpio")?;
            let pin = gpio
                .get(pin)
                .with_context(|| format!("gpio {pin} unavailable"))?
                .into_io(Mode::Output);
            Ok(Self { pin })
        }

        fn wait_while(&self, level: Level, limit: Duration) -> Result<Duration, SensorError> {
            let start = Instant::now();
            while self.pin.read() == level {
                if start.elapsed() > limit {
                    return Err(SensorError::Timeout);
                }
            }
            Ok(start.elapsed())
        }
    }

    impl Dht11Line for GpioLine {
        fn read_frame(&mut self) -> Result<[u8; 5], SensorError> {
            self.pin.set_mode(Mode::Output);
            self.pin.set_low();
            std::thread::sleep(Duration::from_millis(18));
            self.pin.set_high();
            self.pin.set_mode(Mode::Input);

            let edge = Duration::from_micros(200);
            self.wait_while(Level::High, edge)?;
            self.wait_while(Level::Low, edge)?;
            self.wait_while(Level::High, edge)?;

            let mut frame = [0u8; 5];
            for bit in 0..40 {
                self.wait_while(Level::Low, edge)?;
                let high = self.wait_while(Level::High, edge)?;
                if high > ONE_THRESHOLD {
                    frame[bit / 8] |= 0x80 >> (bit % 8);
                }
            }
            Ok(frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldFault;
    use std::collections::VecDeque;

    struct ScriptedLine {
        frames: VecDeque<Result<[u8; 5], SensorError>>,
        reads: usize,
    }

    impl Dht11Line for ScriptedLine {
        fn read_frame(&mut self) -> Result<[u8; 5], SensorError> {
            self.reads += 1;
            self.frames.pop_front().unwrap_or(Err(SensorError::Timeout))
        }
    }

    fn line(frames: Vec<Result<[u8; 5], SensorError>>) -> ScriptedLine {
        ScriptedLine {
            frames: frames.into(),
            reads: 0,
        }
    }

    #[test]
    fn decodes_valid_frame() {
        assert_eq!(decode_frame([48, 0, 21, 5, 74]), Ok((48.0, 21.5)));
    }

    #[test]
    fn decodes_negative_temperature() {
        let frame = [30, 0, 3, 0x82, 30u8.wrapping_add(3).wrapping_add(0x82)];
        assert_eq!(decode_frame(frame), Ok((30.0, -3.2)));
    }

    #[test]
    fn rejects_bad_checksum() {
        assert_eq!(decode_frame([48, 0, 21, 5, 75]), Err(SensorError::Checksum));
    }

    #[test]
    fn one_conversion_serves_both_fields() {
        let mut sensor = Dht11::new(line(vec![Ok([48, 0, 21, 5, 74])]));
        let reading = sensor.sample();
        assert_eq!(reading.humidity_pct.value(), Some(48.0));
        assert_eq!(reading.temperature_c.value(), Some(21.5));
        assert!(!reading.pressure_hpa.is_valid());
        assert_eq!(sensor.line.reads, 1);
    }

    #[test]
    fn checksum_error_marks_fields_without_second_conversion() {
        let mut sensor = Dht11::new(line(vec![Ok([48, 0, 21, 5, 0]), Ok([48, 0, 21, 5, 74])]));
        let reading = sensor.sample();
        assert_eq!(reading.humidity_pct.fault(), Some(FieldFault::Checksum));
        assert_eq!(reading.temperature_c.fault(), Some(FieldFault::Checksum));
        assert_eq!(sensor.line.reads, 1);
    }

    #[test]
    fn timed_out_conversion_is_not_retried_within_a_sample() {
        let mut sensor = Dht11::new(line(vec![Err(SensorError::Timeout)]));
        let reading = sensor.sample();
        assert_eq!(reading.humidity_pct.fault(), Some(FieldFault::Timeout));
        assert_eq!(reading.temperature_c.fault(), Some(FieldFault::Timeout));
        assert_eq!(sensor.line.reads, 1);
    }
}

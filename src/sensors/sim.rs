//! Simulated sensors for running the node off-device.
//!
//! Values drift slowly around plausible indoor conditions so the HTTP API and
//! the scheduler have something realistic to serve without any hardware.

use std::time::Instant;

use crate::domain::Field;
use crate::error::SensorError;
use crate::sensors::SensorReader;

pub struct SimulatedSensor {
    name: String,
    fields: Vec<Field>,
    started: Instant,
}

impl SimulatedSensor {
    pub fn new(name: impl Into<String>, fields: &[Field]) -> Self {
        Self {
            name: name.into(),
            fields: fields.to_vec(),
            started: Instant::now(),
        }
    }

    /// Stands in for a BMP280 (temperature and pressure).
    pub fn bmp280() -> Self {
        Self::new("sim-bmp280", &[Field::Temperature, Field::Pressure])
    }

    /// Stands in for a DHT11 (humidity and temperature).
    pub fn dht11() -> Self {
        Self::new("sim-dht11", &[Field::Humidity, Field::Temperature])
    }

    fn wave(&self, base: f64, amplitude: f64, period_secs: f64) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        base + amplitude * (t * std::f64::consts::TAU / period_secs).sin()
    }

    fn value(&self, field: Field) -> Result<f64, SensorError> {
        if !self.supports(field) {
            return Err(SensorError::Unsupported(field));
        }
        Ok(match field {
            Field::Temperature => self.wave(22.0, 1.5, 600.0),
            Field::Humidity => self.wave(45.0, 5.0, 900.0),
            Field::Pressure => self.wave(1013.25, 2.0, 1800.0),
        })
    }
}

impl SensorReader for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, field: Field) -> bool {
        self.fields.contains(&field)
    }

    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        self.value(Field::Temperature)
    }

    fn read_humidity(&mut self) -> Result<f64, SensorError> {
        self.value(Field::Humidity)
    }

    fn read_pressure(&mut self) -> Result<f64, SensorError> {
        self.value(Field::Pressure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldFault;

    #[test]
    fn only_configured_fields_are_served() {
        let mut sensor = SimulatedSensor::bmp280();
        let reading = sensor.sample();
        let celsius = reading.temperature_c.value().unwrap();
        let hpa = reading.pressure_hpa.value().unwrap();
        assert!((20.0..=24.0).contains(&celsius));
        assert!((1010.0..=1016.0).contains(&hpa));
        assert_eq!(reading.humidity_pct.fault(), Some(FieldFault::Unsupported));
    }
}

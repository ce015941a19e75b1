use serde::Serialize;
use std::fmt;

use crate::error::SensorError;

/// One of the three quantities a weather node measures.
///
/// Doubles as the sensor capability set: a reader "supports" a field when it
/// can measure that quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Temperature,
    Humidity,
    Pressure,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Temperature, Field::Humidity, Field::Pressure];

    pub const fn index(self) -> usize {
        match self {
            Field::Temperature => 0,
            Field::Humidity => 1,
            Field::Pressure => 2,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
            Field::Pressure => "pressure",
        };
        f.write_str(name)
    }
}

/// Why a field carries no usable number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFault {
    /// Nothing has been sampled yet.
    NoData,
    Timeout,
    ReadFailed,
    Checksum,
    Unsupported,
    /// The driver produced NaN or an infinity.
    NonFinite,
}

/// A single measured value: either a finite number or an explicit fault.
///
/// The inner representation is private so a non-finite number can never be
/// stored as a valid measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement(Result<f64, FieldFault>);

impl Measurement {
    pub fn valid(value: f64) -> Self {
        if value.is_finite() {
            Self(Ok(value))
        } else {
            Self(Err(FieldFault::NonFinite))
        }
    }

    pub const fn invalid(fault: FieldFault) -> Self {
        Self(Err(fault))
    }

    pub fn value(&self) -> Option<f64> {
        self.0.ok()
    }

    pub fn fault(&self) -> Option<FieldFault> {
        self.0.err()
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_ok()
    }
}

impl From<Result<f64, SensorError>> for Measurement {
    fn from(result: Result<f64, SensorError>) -> Self {
        match result {
            Ok(value) => Measurement::valid(value),
            Err(err) => Measurement::invalid(err.fault()),
        }
    }
}

/// One sampled snapshot of temperature, humidity and pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: Measurement,
    pub humidity_pct: Measurement,
    pub pressure_hpa: Measurement,
    /// monotonic milliseconds since boot of the tick that produced it;
    /// `None` only for the "no data yet" sentinel
    pub sampled_at_ms: Option<u64>,
}

impl Reading {
    /// Sentinel returned before the first sample is published.
    pub const fn no_data() -> Self {
        Self::all_invalid(FieldFault::NoData)
    }

    pub const fn all_invalid(fault: FieldFault) -> Self {
        Self {
            temperature_c: Measurement::invalid(fault),
            humidity_pct: Measurement::invalid(fault),
            pressure_hpa: Measurement::invalid(fault),
            sampled_at_ms: None,
        }
    }

    pub fn get(&self, field: Field) -> Measurement {
        match field {
            Field::Temperature => self.temperature_c,
            Field::Humidity => self.humidity_pct,
            Field::Pressure => self.pressure_hpa,
        }
    }

    pub fn set(&mut self, field: Field, value: Measurement) {
        match field {
            Field::Temperature => self.temperature_c = value,
            Field::Humidity => self.humidity_pct = value,
            Field::Pressure => self.pressure_hpa = value,
        }
    }

    /// `(temperature, humidity, pressure)` when every field is valid.
    pub fn complete(&self) -> Option<(f64, f64, f64)> {
        Some((
            self.temperature_c.value()?,
            self.humidity_pct.value()?,
            self.pressure_hpa.value()?,
        ))
    }

    /// Fields currently carrying a fault.
    pub fn faults(&self) -> impl Iterator<Item = (Field, FieldFault)> + '_ {
        Field::ALL
            .into_iter()
            .filter_map(|field| self.get(field).fault().map(|fault| (field, fault)))
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::no_data()
    }
}

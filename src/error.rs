//! ==============================================================================
//! error.rs - typed errors for sensors, settings and the scheduler
//! ==============================================================================
//!
//! sensor errors never cross the scheduler boundary: they are folded into a
//! `FieldFault` on the affected field of a `Reading`. settings errors are
//! returned to callers of `load`/`set`. startup glue uses `anyhow` on top.
//!
//! ==============================================================================

use crate::domain::{Field, FieldFault};
use thiserror::Error;

/// Failure of a single sensor capability read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor read timed out")]
    Timeout,

    #[error("bus error: {0}")]
    Bus(String),

    #[error("checksum mismatch")]
    Checksum,

    #[error("{0} is not supported by this sensor")]
    Unsupported(Field),

    #[error("sensor not found: {0}")]
    NotFound(String),
}

impl SensorError {
    /// The invalidity flag this error leaves on the affected field.
    pub fn fault(&self) -> FieldFault {
        match self {
            Self::Timeout => FieldFault::Timeout,
            Self::Checksum => FieldFault::Checksum,
            Self::Unsupported(_) => FieldFault::Unsupported,
            Self::Bus(_) | Self::NotFound(_) => FieldFault::ReadFailed,
        }
    }
}

/// Errors from the durable settings store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("unknown settings key: {0}")]
    UnknownKey(String),

    #[error("invalid value type for {key}: expected {expected}")]
    InvalidValueType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("failed to persist settings: {0}")]
    PersistFailure(String),

    #[error("settings storage corrupt: {0}")]
    StorageCorrupt(String),
}

/// Errors raised while wiring up the sample scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("{0} already has a designated reader")]
    DuplicateSource(Field),

    #[error("sensor {sensor} cannot provide {field}")]
    UnsupportedField { sensor: String, field: Field },

    #[error("sampling interval must be non-zero")]
    ZeroInterval,
}

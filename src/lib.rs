//! ==============================================================================
//! weather-node - periodic sensor sampling behind a small HTTP API
//! ==============================================================================
//!
//! data flow:
//!
//!     ┌────────────┐  tick   ┌──────────────┐  publish  ┌─────────────────┐
//!     │ scheduler  │ ──────> │ sensors      │ ────────> │ SharedReading   │
//!     │ (interval) │         │ bmp280/dht11 │           │ State (Arc swap)│
//!     └────────────┘         └──────────────┘           └────────┬────────┘
//!                                                                │ current()
//!     ┌────────────┐                                     ┌───────┴────────┐
//!     │ settings   │  boot-time load, switch state       │ http           │
//!     │ (fsync'd)  │                                     │ / and /weather │
//!     └────────────┘                                     └────────────────┘
//!
//! ==============================================================================

pub mod config;
pub mod domain;
pub mod error;
pub mod hal;
pub mod http;
pub mod scheduler;
pub mod sensors;
pub mod settings;
pub mod state;

pub use domain::{Field, FieldFault, Measurement, Reading};
pub use error::{SchedulerError, SensorError, SettingsError};
pub use state::SharedReadingState;

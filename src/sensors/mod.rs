//! ==============================================================================
//! sensors/mod.rs - polymorphic sensor sampling
//! ==============================================================================
//!
//! purpose:
//!     one trait over the capability set {temperature, humidity, pressure}.
//!     each physical part implements the subset it can measure; everything
//!     else answers `Unsupported`.
//!
//! failure model:
//!     - `sample()` reads each supported field once. a failing field is marked
//!       invalid on its own and never poisons the other fields.
//!     - no retries here. retry policy belongs above the scheduler.
//!     - drivers block (i2c, bit-banged gpio). `sample_bounded` pushes the
//!       call onto the blocking pool and gives up after a fixed timeout,
//!       returning an all-invalid reading instead of stalling the caller.
//!
//! ==============================================================================

pub mod bmp280;
pub mod dht11;
pub mod sim;

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use tracing::warn;

use crate::domain::{Field, FieldFault, Measurement, Reading};
use crate::error::SensorError;

/// Default upper bound for one sensor's `sample()`.
pub const DEFAULT_SAMPLE_TIMEOUT: Duration = Duration::from_millis(1000);

pub trait SensorReader: Send {
    /// Short human-readable name used in logs ("bmp280", "dht11").
    fn name(&self) -> &str;

    fn supports(&self, field: Field) -> bool;

    fn read_temperature(&mut self) -> Result<f64, SensorError> {
        Err(SensorError::Unsupported(Field::Temperature))
    }

    fn read_humidity(&mut self) -> Result<f64, SensorError> {
        Err(SensorError::Unsupported(Field::Humidity))
    }

    fn read_pressure(&mut self) -> Result<f64, SensorError> {
        Err(SensorError::Unsupported(Field::Pressure))
    }

    fn read(&mut self, field: Field) -> Result<f64, SensorError> {
        match field {
            Field::Temperature => self.read_temperature(),
            Field::Humidity => self.read_humidity(),
            Field::Pressure => self.read_pressure(),
        }
    }

    /// Read every supported field once.
    fn sample(&mut self) -> Reading {
        let mut reading = Reading::all_invalid(FieldFault::Unsupported);
        for field in Field::ALL {
            if !self.supports(field) {
                continue;
            }
            let result = self.read(field);
            if let Err(err) = &result {
                warn!("[{}] {field} read failed: {err}", self.name());
            }
            reading.set(field, Measurement::from(result));
        }
        reading
    }
}

/// A reader shared between the scheduler and the blocking pool.
///
/// The name and capability set are captured up front so they can be queried
/// while a slow `sample()` still holds the reader's lock.
#[derive(Clone)]
pub struct SensorHandle {
    name: Arc<str>,
    supported: [bool; 3],
    reader: Arc<Mutex<Box<dyn SensorReader>>>,
}

impl SensorHandle {
    pub fn new(reader: impl SensorReader + 'static) -> Self {
        let name: Arc<str> = Arc::from(reader.name());
        let supported = Field::ALL.map(|field| reader.supports(field));
        Self {
            name,
            supported,
            reader: Arc::new(Mutex::new(Box::new(reader))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports(&self, field: Field) -> bool {
        self.supported[field.index()]
    }
}

/// Run `sample()` off the async executor, bounded by `timeout`.
///
/// On timeout the reading is all-invalid with [`FieldFault::Timeout`]; the
/// abandoned call finishes on the blocking pool and its result is dropped.
/// Until it does, further calls for the same reader return the same
/// all-invalid reading without touching the driver.
pub async fn sample_bounded(handle: &SensorHandle, timeout: Duration) -> Reading {
    let reader = Arc::clone(&handle.reader);
    // never queue behind an abandoned call: a reader still busy from an
    // earlier timeout is skipped instead of parking another blocking thread
    let task = tokio::task::spawn_blocking(move || match reader.try_lock() {
        Ok(mut guard) => Some(guard.sample()),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner().sample()),
        Err(TryLockError::WouldBlock) => None,
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Some(reading))) => reading,
        Ok(Ok(None)) => {
            warn!("[{}] previous sample still running, skipped", handle.name());
            Reading::all_invalid(FieldFault::Timeout)
        }
        Ok(Err(join_err)) => {
            warn!("[{}] sample aborted: {join_err}", handle.name());
            Reading::all_invalid(FieldFault::ReadFailed)
        }
        Err(_) => {
            warn!(
                "[{}] {} after {}ms",
                handle.name(),
                SensorError::Timeout,
                timeout.as_millis()
            );
            Reading::all_invalid(FieldFault::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct HumidityOnly {
        value: Result<f64, SensorError>,
    }

    impl SensorReader for HumidityOnly {
        fn name(&self) -> &str {
            "hygro"
        }

        fn supports(&self, field: Field) -> bool {
            field == Field::Humidity
        }

        fn read_humidity(&mut self) -> Result<f64, SensorError> {
            self.value.clone()
        }
    }

    struct Sleepy(Duration);

    impl SensorReader for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn supports(&self, _field: Field) -> bool {
            true
        }

        fn read_temperature(&mut self) -> Result<f64, SensorError> {
            std::thread::sleep(self.0);
            Ok(20.0)
        }

        fn read_humidity(&mut self) -> Result<f64, SensorError> {
            Ok(50.0)
        }

        fn read_pressure(&mut self) -> Result<f64, SensorError> {
            Ok(1000.0)
        }
    }

    #[test]
    fn unsupported_fields_are_marked() {
        let mut sensor = HumidityOnly { value: Ok(48.0) };
        let reading = sensor.sample();
        assert_eq!(reading.humidity_pct.value(), Some(48.0));
        assert_eq!(reading.temperature_c.fault(), Some(FieldFault::Unsupported));
        assert_eq!(reading.pressure_hpa.fault(), Some(FieldFault::Unsupported));
        assert_eq!(
            sensor.read_pressure(),
            Err(SensorError::Unsupported(Field::Pressure))
        );
    }

    #[test]
    fn failure_only_invalidates_its_field() {
        let mut sensor = HumidityOnly {
            value: Err(SensorError::Checksum),
        };
        let reading = sensor.sample();
        assert_eq!(reading.humidity_pct.fault(), Some(FieldFault::Checksum));
    }

    #[test]
    fn handle_captures_capabilities() {
        let handle = SensorHandle::new(HumidityOnly { value: Ok(1.0) });
        assert_eq!(handle.name(), "hygro");
        assert!(handle.supports(Field::Humidity));
        assert!(!handle.supports(Field::Temperature));
    }

    #[tokio::test]
    async fn bounded_sample_returns_reading() {
        let handle = SensorHandle::new(Sleepy(Duration::ZERO));
        let reading = sample_bounded(&handle, Duration::from_secs(1)).await;
        assert_eq!(reading.complete(), Some((20.0, 50.0, 1000.0)));
    }

    struct Hung {
        delay: Duration,
        entered: Arc<AtomicUsize>,
    }

    impl SensorReader for Hung {
        fn name(&self) -> &str {
            "hung"
        }

        fn supports(&self, field: Field) -> bool {
            field == Field::Humidity
        }

        fn read_humidity(&mut self) -> Result<f64, SensorError> {
            // only the first call hangs
            let calls = self.entered.fetch_add(1, Ordering::SeqCst);
            if calls == 0 {
                std::thread::sleep(self.delay);
            }
            Ok(45.0)
        }
    }

    #[tokio::test]
    async fn hung_reader_does_not_pile_up_blocking_calls() {
        let entered = Arc::new(AtomicUsize::new(0));
        let handle = SensorHandle::new(Hung {
            delay: Duration::from_millis(300),
            entered: Arc::clone(&entered),
        });

        for _ in 0..5 {
            let reading = sample_bounded(&handle, Duration::from_millis(20)).await;
            assert_eq!(reading, Reading::all_invalid(FieldFault::Timeout));
        }
        // the skipped calls never reached the driver
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let reading = sample_bounded(&handle, Duration::from_millis(200)).await;
        assert_eq!(reading.humidity_pct.value(), Some(45.0));
        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_sample_times_out_all_invalid() {
        let handle = SensorHandle::new(Sleepy(Duration::from_millis(500)));
        let started = std::time::Instant::now();
        let reading = sample_bounded(&handle, Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(reading, Reading::all_invalid(FieldFault::Timeout));
    }
}

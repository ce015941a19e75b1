//! ==============================================================================
//! scheduler.rs - periodic sampling state machine
//! ==============================================================================
//!
//! purpose:
//!     decides when to sample, samples every designated reader, merges the
//!     per-field results into one `Reading` and publishes it.
//!
//! state machine:
//!     Idle --(interval elapsed)--> Sampling --> Publishing --> Idle
//!
//!     `tick(now)` before the interval has elapsed is a no-op and never touches
//!     a reader. a tick that does fire always publishes, even when every
//!     sensor failed; failed fields carry their fault instead of a number.
//!
//! field ownership:
//!     each field comes from exactly one designated reader. the builder
//!     rejects two readers claiming the same field, and a reader claiming a
//!     field it cannot measure.
//!
//! ==============================================================================

use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::{Field, FieldFault, Measurement, Reading};
use crate::error::SchedulerError;
use crate::sensors::{sample_bounded, SensorHandle, DEFAULT_SAMPLE_TIMEOUT};
use crate::state::SharedReadingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sampling,
    Publishing,
}

/// Private to the scheduler; nothing outside can move the clock.
#[derive(Debug, Clone, Copy)]
struct ScheduleState {
    interval_ms: u32,
    last_tick_at_ms: u64,
}

impl ScheduleState {
    fn is_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_tick_at_ms) >= u64::from(self.interval_ms)
    }

    fn due_at(&self) -> u64 {
        self.last_tick_at_ms + u64::from(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Interval not elapsed; nothing sampled.
    Skipped,
    Published(Reading),
}

/// Monotonic milliseconds since the node started.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    start: Instant,
}

impl Uptime {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::start()
    }
}

pub struct SchedulerBuilder {
    state: SharedReadingState,
    interval_ms: u32,
    start_at_ms: u64,
    sensor_timeout: Duration,
    log_readings: bool,
    sources: Vec<(SensorHandle, Vec<Field>)>,
}

impl SchedulerBuilder {
    /// Designate `handle` as the source of `fields`.
    pub fn reader(mut self, handle: SensorHandle, fields: &[Field]) -> Self {
        self.sources.push((handle, fields.to_vec()));
        self
    }

    pub fn sensor_timeout(mut self, timeout: Duration) -> Self {
        self.sensor_timeout = timeout;
        self
    }

    /// Boot time in uptime milliseconds; the first sample fires one interval later.
    pub fn start_at(mut self, now_ms: u64) -> Self {
        self.start_at_ms = now_ms;
        self
    }

    /// Log every published reading at info level.
    pub fn log_readings(mut self, enabled: bool) -> Self {
        self.log_readings = enabled;
        self
    }

    pub fn build(self) -> Result<SampleScheduler, SchedulerError> {
        if self.interval_ms == 0 {
            return Err(SchedulerError::ZeroInterval);
        }

        let mut designation: [Option<usize>; 3] = [None; 3];
        for (i, (handle, fields)) in self.sources.iter().enumerate() {
            for &field in fields {
                if !handle.supports(field) {
                    return Err(SchedulerError::UnsupportedField {
                        sensor: handle.name().to_string(),
                        field,
                    });
                }
                let slot = &mut designation[field.index()];
                if slot.is_some() {
                    return Err(SchedulerError::DuplicateSource(field));
                }
                *slot = Some(i);
            }
        }

        for field in Field::ALL {
            if designation[field.index()].is_none() {
                warn!("no reader designated for {field}; it will always report no data");
            }
        }

        Ok(SampleScheduler {
            state: self.state,
            schedule: ScheduleState {
                interval_ms: self.interval_ms,
                last_tick_at_ms: self.start_at_ms,
            },
            handles: self.sources.into_iter().map(|(handle, _)| handle).collect(),
            designation,
            sensor_timeout: self.sensor_timeout,
            log_readings: self.log_readings,
            phase: Phase::Idle,
            streaks: [0; 3],
        })
    }
}

pub struct SampleScheduler {
    state: SharedReadingState,
    schedule: ScheduleState,
    handles: Vec<SensorHandle>,
    // index into `handles` for each field
    designation: [Option<usize>; 3],
    sensor_timeout: Duration,
    log_readings: bool,
    phase: Phase,
    streaks: [u32; 3],
}

impl SampleScheduler {
    pub fn builder(state: SharedReadingState, interval_ms: u32) -> SchedulerBuilder {
        SchedulerBuilder {
            state,
            interval_ms,
            start_at_ms: 0,
            sensor_timeout: DEFAULT_SAMPLE_TIMEOUT,
            log_readings: false,
            sources: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.schedule.interval_ms))
    }

    /// Consecutive published ticks on which `field` was invalid.
    pub fn failure_streak(&self, field: Field) -> u32 {
        self.streaks[field.index()]
    }

    /// Time until the next tick would fire.
    pub fn due_in(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.schedule.due_at().saturating_sub(now_ms))
    }

    pub async fn tick(&mut self, now_ms: u64) -> TickOutcome {
        if !self.schedule.is_due(now_ms) {
            return TickOutcome::Skipped;
        }

        self.phase = Phase::Sampling;
        let samples = self.sample_all().await;

        self.phase = Phase::Publishing;
        let mut reading = Reading::no_data();
        for field in Field::ALL {
            let measurement = match self.designation[field.index()] {
                Some(i) => samples[i]
                    .map(|sample| sample.get(field))
                    .unwrap_or(Measurement::invalid(FieldFault::ReadFailed)),
                None => Measurement::invalid(FieldFault::NoData),
            };
            reading.set(field, measurement);
        }
        reading.sampled_at_ms = Some(now_ms);

        self.state.publish(reading);
        self.schedule.last_tick_at_ms = now_ms;
        self.phase = Phase::Idle;

        self.track_failures(&reading);
        if self.log_readings {
            info!(
                "Temperature = {} *C, Humidity = {} %, Pressure = {} hPa",
                show(reading.temperature_c),
                show(reading.humidity_pct),
                show(reading.pressure_hpa),
            );
        }
        TickOutcome::Published(reading)
    }

    /// Production loop: tick, then sleep until the next tick is due.
    pub async fn run(mut self, uptime: Uptime) {
        info!(
            "sampling every {}ms ({} reader(s))",
            self.schedule.interval_ms,
            self.handles.len()
        );
        loop {
            self.tick(uptime.now_ms()).await;
            tokio::time::sleep(self.due_in(uptime.now_ms())).await;
        }
    }

    /// Sample every reader concurrently, each bounded by the sensor timeout.
    async fn sample_all(&self) -> Vec<Option<Reading>> {
        let mut tasks = JoinSet::new();
        for (i, handle) in self.handles.iter().enumerate() {
            let handle = handle.clone();
            let timeout = self.sensor_timeout;
            tasks.spawn(async move { (i, sample_bounded(&handle, timeout).await) });
        }

        let mut samples = vec![None; self.handles.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, reading)) => samples[i] = Some(reading),
                Err(e) => warn!("sampling task failed: {e}"),
            }
        }
        samples
    }

    fn track_failures(&mut self, reading: &Reading) {
        for field in Field::ALL {
            if self.designation[field.index()].is_none() {
                continue;
            }
            let streak = &mut self.streaks[field.index()];
            match reading.get(field).fault() {
                Some(fault) => {
                    *streak += 1;
                    if *streak == 1 || *streak % 10 == 0 {
                        warn!("{field} invalid for {streak} consecutive tick(s): {fault:?}");
                    }
                }
                None if *streak > 0 => {
                    debug!("{field} recovered after {streak} failed tick(s)");
                    *streak = 0;
                }
                None => {}
            }
        }
    }
}

fn show(measurement: Measurement) -> String {
    match measurement.value() {
        Some(v) => format!("{v:.2}"),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::sensors::SensorReader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        values: [Option<f64>; 3],
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Fixed {
        fn new(name: &'static str, values: [Option<f64>; 3]) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let sensor = Self {
                name,
                values,
                delay: Duration::ZERO,
                calls: Arc::clone(&calls),
            };
            (sensor, calls)
        }

        fn value(&self, field: Field) -> Result<f64, SensorError> {
            self.values[field.index()].ok_or(SensorError::Unsupported(field))
        }
    }

    impl SensorReader for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, field: Field) -> bool {
            self.values[field.index()].is_some()
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

        fn sample(&mut self) -> Reading {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let mut reading = Reading::all_invalid(FieldFault::Unsupported);
            for field in Field::ALL {
                if self.supports(field) {
                    reading.set(field, Measurement::from(self.read(field)));
                }
            }
            reading
        }
    }

    fn station(state: &SharedReadingState) -> (SampleScheduler, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (bmp, bmp_calls) = Fixed::new("bmp280", [Some(21.5), None, Some(1013.2)]);
        let (dht, dht_calls) = Fixed::new("dht11", [Some(22.0), Some(48.0), None]);
        let scheduler = SampleScheduler::builder(state.clone(), 5000)
            .reader(SensorHandle::new(bmp), &[Field::Temperature, Field::Pressure])
            .reader(SensorHandle::new(dht), &[Field::Humidity])
            .build()
            .unwrap();
        (scheduler, bmp_calls, dht_calls)
    }

    #[test]
    fn builder_rejects_bad_wiring() {
        let state = SharedReadingState::new();
        let (a, _) = Fixed::new("a", [Some(1.0), None, None]);
        let (b, _) = Fixed::new("b", [Some(2.0), None, None]);

        let duplicate = SampleScheduler::builder(state.clone(), 1000)
            .reader(SensorHandle::new(a), &[Field::Temperature])
            .reader(SensorHandle::new(b), &[Field::Temperature])
            .build();
        assert_eq!(
            duplicate.err(),
            Some(SchedulerError::DuplicateSource(Field::Temperature))
        );

        let (c, _) = Fixed::new("c", [Some(1.0), None, None]);
        let unsupported = SampleScheduler::builder(state.clone(), 1000)
            .reader(SensorHandle::new(c), &[Field::Pressure])
            .build();
        assert!(matches!(
            unsupported.err(),
            Some(SchedulerError::UnsupportedField { field: Field::Pressure, .. })
        ));

        let zero = SampleScheduler::builder(state, 0).build();
        assert_eq!(zero.err(), Some(SchedulerError::ZeroInterval));
    }

    #[tokio::test]
    async fn sub_interval_ticks_never_sample() {
        let state = SharedReadingState::new();
        let (mut scheduler, bmp_calls, dht_calls) = station(&state);

        for now in [0, 1, 2500, 4999] {
            assert_eq!(scheduler.tick(now).await, TickOutcome::Skipped);
        }
        assert_eq!(bmp_calls.load(Ordering::SeqCst), 0);
        assert_eq!(dht_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.publish_count(), 0);
        assert_eq!(scheduler.due_in(4999), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn due_tick_merges_designated_fields() {
        let state = SharedReadingState::new();
        let (mut scheduler, bmp_calls, dht_calls) = station(&state);
        assert_eq!(state.current(), Reading::no_data());

        let TickOutcome::Published(reading) = scheduler.tick(5001).await else {
            panic!("tick at 5001 should publish");
        };
        // temperature comes from the bmp280 even though the dht11 reports one too
        assert_eq!(reading.complete(), Some((21.5, 48.0, 1013.2)));
        assert_eq!(reading.sampled_at_ms, Some(5001));
        assert_eq!(state.current(), reading);
        assert_eq!(scheduler.phase(), Phase::Idle);
        assert_eq!(bmp_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dht_calls.load(Ordering::SeqCst), 1);

        // next interval is measured from the tick, not from boot
        assert_eq!(scheduler.tick(10_000).await, TickOutcome::Skipped);
        assert!(matches!(scheduler.tick(10_001).await, TickOutcome::Published(_)));
    }

    #[tokio::test]
    async fn undesignated_field_reports_no_data() {
        let state = SharedReadingState::new();
        let (bmp, _) = Fixed::new("bmp280", [Some(21.5), None, Some(1013.2)]);
        let mut scheduler = SampleScheduler::builder(state.clone(), 100)
            .reader(SensorHandle::new(bmp), &[Field::Temperature, Field::Pressure])
            .build()
            .unwrap();

        scheduler.tick(100).await;
        let current = state.current();
        assert_eq!(current.humidity_pct.fault(), Some(FieldFault::NoData));
        assert_eq!(current.temperature_c.value(), Some(21.5));
        assert_eq!(scheduler.failure_streak(Field::Humidity), 0);
    }

    #[tokio::test]
    async fn slow_sensor_publishes_timeout_faults() {
        let state = SharedReadingState::new();
        let (mut slow, _) = Fixed::new("bmp280", [Some(21.5), None, Some(1013.2)]);
        slow.delay = Duration::from_millis(300);
        let (dht, _) = Fixed::new("dht11", [None, Some(48.0), None]);
        let mut scheduler = SampleScheduler::builder(state.clone(), 100)
            .reader(SensorHandle::new(slow), &[Field::Temperature, Field::Pressure])
            .reader(SensorHandle::new(dht), &[Field::Humidity])
            .sensor_timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let TickOutcome::Published(reading) = scheduler.tick(100).await else {
            panic!("tick should publish");
        };
        assert_eq!(reading.temperature_c.fault(), Some(FieldFault::Timeout));
        assert_eq!(reading.pressure_hpa.fault(), Some(FieldFault::Timeout));
        assert_eq!(reading.humidity_pct.value(), Some(48.0));
        assert_eq!(scheduler.failure_streak(Field::Temperature), 1);
        assert_eq!(scheduler.failure_streak(Field::Humidity), 0);
        assert_eq!(state.publish_count(), 1);
    }
}

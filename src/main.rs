//! ==============================================================================
//! main.rs - weather node entry point
//! ==============================================================================
//!
//! purpose:
//!     boots the node the way the station firmware always has: load settings,
//!     restore the led, bring up the sensors, then sample on a fixed interval
//!     while serving the latest reading over HTTP.
//!
//! responsibilities:
//!     - load node.toml and set up logging
//!     - open the durable settings store and apply the stored switch state
//!     - initialize the bmp280 (fatal if missing) and the dht11
//!     - spawn the sample scheduler
//!     - serve the HTTP API until Ctrl-C
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                     weather-node (this file)                 │
//!     │  ┌──────────────────┐            ┌──────────────────────┐   │
//!     │  │ sample scheduler │  publish   │ http server          │   │
//!     │  │ (5s interval)    │ ────────>  │ (port 81)            │   │
//!     │  └────────┬─────────┘   state    └──────────────────────┘   │
//!     │           │ spawn_blocking                                   │
//!     │     ┌─────┴─────┐                                            │
//!     │     ▼           ▼                                            │
//!     │  bmp280       dht11        (rppal, or simulated)             │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weather_node::config::{LoggingConfig, NodeConfig, RuntimeConfig, SamplingConfig};
use weather_node::domain::Field;
use weather_node::hal::{self, SwitchOutput};
use weather_node::http;
use weather_node::scheduler::{SampleScheduler, Uptime};
use weather_node::sensors::SensorHandle;
use weather_node::settings::{FileBackend, SettingsStore};
use weather_node::state::SharedReadingState;

fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Weather Node");
    println!("  BMP280 + DHT11 -> GET /weather");
    println!("===========================================================");

    // step 1: load configuration and start logging
    let (config, source, warnings) = NodeConfig::load_or_default();
    init_logging(&config.logging);
    for warning in warnings {
        warn!("[CONFIG] {warning}");
    }
    config.print_summary(&source);

    let runtime = build_runtime(&config.runtime)?;
    runtime.block_on(run(config))
}

async fn run(config: NodeConfig) -> Result<()> {
    let uptime = Uptime::start();

    // step 2: durable settings
    let backend = FileBackend::new(&config.settings.data_dir)
        .context("failed to open settings directory")?;
    let (settings, outcome) = SettingsStore::open(backend).context("failed to load settings")?;
    if let Some(err) = &outcome.recovered {
        warn!("[SETTINGS] {err}; defaults restored");
    }
    info!("[SETTINGS] SSID: {}", settings.wifi_ssid());

    // step 3: drive the led to the stored switch state
    let mut led = hal::led_output(config.led.gpio_pin)?;
    led.set(settings.switch_state()).context("failed to drive led")?;
    info!("LED is now {}", if led.is_on() { "ON" } else { "OFF" });

    // step 4: sensors
    info!("[STARTUP] Initializing sensors...");
    let bmp280 = match with_retries("bmp280", &config.sampling, || open_bmp280(&config)).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not find a valid BMP280 sensor, check wiring!");
            return Err(e.context("bmp280 initialization failed"));
        }
    };
    let dht11 = with_retries("dht11", &config.sampling, || open_dht11(&config)).await?;
    info!("[STARTUP] ✓ Sensors ready: {}, {}", bmp280.name(), dht11.name());

    // step 5: sample scheduler in the background
    let state = SharedReadingState::new();
    let scheduler = SampleScheduler::builder(state.clone(), config.sampling.interval_ms)
        .reader(bmp280, &[Field::Temperature, Field::Pressure])
        .reader(dht11, &[Field::Humidity])
        .sensor_timeout(config.sensor_timeout())
        .log_readings(config.logging.show_sensor_data)
        .start_at(uptime.now_ms())
        .build()?;
    let sampler = tokio::spawn(scheduler.run(uptime));

    // step 6: serve until ctrl-c
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let served = http::serve(listener, state, config.request_timeout(), shutdown_signal()).await;

    sampler.abort();
    info!("[SHUTDOWN] Weather node stopped");
    served
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_runtime(config: &RuntimeConfig) -> Result<tokio::runtime::Runtime> {
    let mut builder = if config.worker_threads == 0 {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.worker_threads(config.worker_threads);
        builder
    };
    builder
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// Run `init` up to `init_attempts` times with a fixed backoff.
async fn with_retries<T>(
    what: &str,
    sampling: &SamplingConfig,
    mut init: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = sampling.init_attempts.max(1);
    let backoff = std::time::Duration::from_millis(sampling.init_backoff_ms);
    let mut attempt = 1;
    loop {
        match init() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("[STARTUP] {what} init failed (attempt {attempt}/{attempts}): {e:#}");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(feature = "hardware")]
fn open_bmp280(config: &NodeConfig) -> Result<SensorHandle> {
    use weather_node::sensors::bmp280::Bmp280;

    let address = config.sensors.bmp280.address()?;
    let sensor = Bmp280::init(hal::open_i2c()?, address)?;
    Ok(SensorHandle::new(sensor))
}

#[cfg(feature = "hardware")]
fn open_dht11(config: &NodeConfig) -> Result<SensorHandle> {
    use weather_node::sensors::dht11::{Dht11, GpioLine};

    let line = GpioLine::open(config.sensors.dht11.gpio_pin)?;
    Ok(SensorHandle::new(Dht11::new(line)))
}

#[cfg(not(feature = "hardware"))]
fn open_bmp280(_config: &NodeConfig) -> Result<SensorHandle> {
    use weather_node::sensors::sim::SimulatedSensor;

    info!("Using SIMULATED BMP280 (No hardware access)");
    Ok(SensorHandle::new(SimulatedSensor::bmp280()))
}

#[cfg(not(feature = "hardware"))]
fn open_dht11(_config: &NodeConfig) -> Result<SensorHandle> {
    use weather_node::sensors::sim::SimulatedSensor;

    info!("Using SIMULATED DHT11 (No hardware access)");
    Ok(SensorHandle::new(SimulatedSensor::dht11()))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("[SHUTDOWN] Ctrl-C received, draining connections"),
        Err(e) => {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

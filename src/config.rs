//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `node.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - SamplingConfig: sample interval, per-sensor timeout, init retries.
//!     - ServerConfig: listen address and request timeout.
//!     - SensorsConfig: BMP280 i2c address, DHT11 gpio pin.
//!     - LedConfig / SettingsConfig / RuntimeConfig / LoggingConfig.
//!
//!     every section and field has a default, so a partial file is valid.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "WEATHER_NODE_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub sampling: SamplingConfig,
    pub server: ServerConfig,
    pub sensors: SensorsConfig,
    pub led: LedConfig,
    pub settings: SettingsConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u32,
    pub sensor_timeout_ms: u64,
    /// hardware init attempts before giving up
    pub init_attempts: u32,
    pub init_backoff_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            sensor_timeout_ms: 1000,
            init_attempts: 1,
            init_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 81,
            bind: "0.0.0.0".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SensorsConfig {
    pub bmp280: Bmp280Config,
    pub dht11: Dht11Config,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Bmp280Config {
    pub i2c_address: String,
}

impl Default for Bmp280Config {
    fn default() -> Self {
        Self {
            i2c_address: "0x76".to_string(),
        }
    }
}

impl Bmp280Config {
    /// Parse `i2c_address`, accepting `0x76` or plain decimal.
    pub fn address(&self) -> Result<u8> {
        let raw = self.i2c_address.trim();
        let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => raw.parse(),
        };
        parsed.with_context(|| format!("invalid bmp280 i2c_address {raw:?}"))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Dht11Config {
    pub gpio_pin: u8,
}

impl Default for Dht11Config {
    fn default() -> Self {
        Self { gpio_pin: 15 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LedConfig {
    pub gpio_pin: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self { gpio_pin: 2 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SettingsConfig {
    pub data_dir: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".weather-node").join("settings"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 0 runs everything on a single cooperative thread
    pub worker_threads: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$WEATHER_NODE_CONFIG`, `config/node.toml` or
    /// `../config/node.toml`, falling back to defaults.
    ///
    /// Runs before logging is set up, so problems are returned as warnings
    /// for the caller to log.
    pub fn load_or_default() -> (Self, ConfigSource, Vec<String>) {
        let mut warnings = Vec::new();
        let mut paths = Vec::new();
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("node.toml"));
        paths.push(PathBuf::from("..").join("config").join("node.toml"));

        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => return (config, ConfigSource::File(path), warnings),
                Err(e) => warnings.push(format!("Failed to load {}: {e:#}", path.display())),
            }
        }

        warnings.push("No config file found - using defaults".to_string());
        (Self::default(), ConfigSource::Defaults, warnings)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.sampling.interval_ms > 0, "sampling.interval_ms must be > 0");
        anyhow::ensure!(
            self.sampling.sensor_timeout_ms > 0,
            "sampling.sensor_timeout_ms must be > 0"
        );
        anyhow::ensure!(
            self.server.request_timeout_secs > 0,
            "server.request_timeout_secs must be > 0"
        );
        self.sensors.bmp280.address()?;
        Ok(())
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sampling.sensor_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Print configuration summary
    pub fn print_summary(&self, source: &ConfigSource) {
        match source {
            ConfigSource::File(path) => info!("[CONFIG] Loaded from {}", path.display()),
            ConfigSource::Defaults => info!("[CONFIG] Using built-in defaults"),
        }
        info!("[CONFIG] Sample interval: {}ms", self.sampling.interval_ms);
        info!("[CONFIG] Sensor timeout: {}ms", self.sampling.sensor_timeout_ms);
        info!(
            "[CONFIG] BMP280 @ {}, DHT11 @ gpio {}, LED @ gpio {}",
            self.sensors.bmp280.i2c_address, self.sensors.dht11.gpio_pin, self.led.gpio_pin
        );
        info!("[CONFIG] Listen: {}", self.listen_addr());
        info!("[CONFIG] Settings dir: {}", self.settings.data_dir.display());
        info!("[CONFIG] Log level: {}", self.logging.level);
    }
}

//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading. Configuration is
//! merged from, in increasing priority:
//! 1. Built-in defaults (the reference deployment: 9600 baud, pool of 5, window of 20)
//! 2. A TOML file (default `config/milk_daq.toml`)
//! 3. Environment variables prefixed with `MILK_DAQ_`, nested with `__`
//!    (e.g. `MILK_DAQ_SERIAL__PORT=/dev/ttyACM0`)
//!
//! Everything is fixed at startup; there is no hot reload.
//!
//! # Example
//! ```no_run
//! use milk_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Reading from {}", config.serial.port);
//! # Ok::<(), milk_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/milk_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MILK_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link to the sensor
    pub serial: SerialConfig,
    /// Relational store
    pub store: StoreConfig,
    /// Connection pool sizing and retry
    pub pool: PoolSettings,
    /// Live buffer sizing
    pub buffer: BufferConfig,
    /// Flat-file sink
    pub storage: StorageConfig,
    /// HTTP read API
    pub http: HttpConfig,
    /// Quality classifier
    pub classifier: ClassifierConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "milk-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout for one line
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Sleep between checks when no bytes are waiting
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay before the first reconnect attempt after a fault
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Upper bound for the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    /// Growth factor between consecutive reconnect delays (1.0 = fixed)
    pub backoff_multiplier: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(5),
            backoff_multiplier: 1.0,
        }
    }
}

/// Relational store configuration
///
/// The bundled backend is SQLite, which only uses `database` (a file path).
/// `host`, `user` and `password` are accepted for deployments whose connector
/// talks to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database name or SQLite file path
    pub database: PathBuf,
    /// Server host, if any
    pub host: Option<String>,
    /// User name, if any
    pub user: Option<String>,
    /// Password, if any
    pub password: Option<String>,
    /// How long a statement waits on a locked database
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/milk_sensor_data.db"),
            host: None,
            user: None,
            password: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Idle connections kept for reuse
    pub size: usize,
    /// Extra connections allowed beyond `size`
    pub max_overflow: usize,
    /// Creation attempts before giving up
    pub connect_attempts: u32,
    /// Delay between creation attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Open `size` connections at startup
    pub warm_up: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 5,
            max_overflow: 1,
            connect_attempts: 3,
            retry_delay: Duration::from_secs(2),
            warm_up: true,
        }
    }
}

impl PoolSettings {
    /// Convert into the pool crate's configuration.
    pub fn to_pool_config(&self) -> store_pool::PoolConfig {
        store_pool::PoolConfig {
            target_size: self.size,
            max_overflow: self.max_overflow,
            retry: store_pool::RetryPolicy {
                max_attempts: self.connect_attempts,
                backoff_delay: self.retry_delay,
            },
        }
    }
}

/// Live buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Readings kept in the live window
    pub capacity: usize,
    /// Recent errors kept
    pub error_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: crate::buffer::DEFAULT_CAPACITY,
            error_capacity: crate::buffer::DEFAULT_ERROR_CAPACITY,
        }
    }
}

/// Flat-file sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// CSV file receiving every accepted reading
    pub csv_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("milk_data.csv"),
        }
    }
}

/// HTTP read API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
        }
    }
}

/// Which classifier to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// No prediction
    #[default]
    None,
    /// Ordered range rules
    Range,
}

/// Inclusive bounds on each channel; a missing bound always matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeRule {
    /// Label returned when every bound matches
    pub label: String,
    /// Titrable acidity `[min, max]`
    pub ta: Option<[f64; 2]>,
    /// Temperature `[min, max]`
    pub temp: Option<[f64; 2]>,
    /// pH `[min, max]`
    pub ph: Option<[f64; 2]>,
    /// Conductivity `[min, max]`
    pub cond: Option<[f64; 2]>,
}

/// Classifier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Classifier implementation
    pub kind: ClassifierKind,
    /// Label when no rule matches
    pub default_label: String,
    /// Rules checked in order
    pub rules: Vec<RangeRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::None,
            default_label: "bad".to_string(),
            rules: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(DaqError::from)
    }

    /// Parse configuration from a TOML string layered over defaults
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(DaqError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.serial.port.trim().is_empty() {
            return invalid("serial.port must not be empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            return invalid("serial.baud_rate must be greater than 0".to_string());
        }
        if self.serial.poll_interval.is_zero() {
            return invalid("serial.poll_interval must be greater than 0".to_string());
        }
        if !(self.serial.backoff_multiplier >= 1.0) {
            return invalid(format!(
                "serial.backoff_multiplier {} must be >= 1.0",
                self.serial.backoff_multiplier
            ));
        }
        if self.serial.max_reconnect_delay < self.serial.reconnect_delay {
            return invalid(
                "serial.max_reconnect_delay must not be shorter than serial.reconnect_delay"
                    .to_string(),
            );
        }

        if self.store.database.as_os_str().is_empty() {
            return invalid("store.database must not be empty".to_string());
        }

        if self.pool.size == 0 {
            return invalid("pool.size must be at least 1".to_string());
        }
        if self.pool.connect_attempts == 0 {
            return invalid("pool.connect_attempts must be at least 1".to_string());
        }

        if self.buffer.capacity == 0 || self.buffer.error_capacity == 0 {
            return invalid("buffer capacities must be at least 1".to_string());
        }

        if self.storage.csv_path.as_os_str().is_empty() {
            return invalid("storage.csv_path must not be empty".to_string());
        }

        if let Err(e) = self.http.bind.parse::<SocketAddr>() {
            return invalid(format!("Invalid http.bind '{}': {e}", self.http.bind));
        }

        crate::classifier::validate_config(&self.classifier)
    }

    /// Listen address for the HTTP API
    pub fn http_addr(&self) -> AppResult<SocketAddr> {
        self.http
            .bind
            .parse()
            .map_err(|e| DaqError::Configuration(format!("Invalid http.bind: {e}")))
    }
}

//! Tracing setup.
//!
//! Structured logging through `tracing`, rendered by `tracing-subscriber` in
//! one of three formats:
//! - `pretty`: multi-line with colors, for development
//! - `compact`: single line, no colors, for services
//! - `json`: one object per event, for log shipping
//!
//! `RUST_LOG` overrides the configured level when set.
//!
//! # Example
//! ```no_run
//! use milk_daq::{config::AppConfig, logging};
//!
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(port = %config.serial.port, "starting");
//! # Ok::<(), milk_daq::error::DaqError>(())
//! ```

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, human readable
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(DaqError::Configuration(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Event format
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the `[application]` section.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Set the event format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from application configuration
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call (common in tests) returns `Ok(())` and keeps
/// the first subscriber.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_names(config.with_thread_names)
                    .with_ansi(config.with_ansi)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_names(config.with_thread_names)
                    .with_ansi(false)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_names(config.with_thread_names)
                    .with_filter(env_filter),
            )
            .try_init(),
    };

    ignore_already_set(result)
}

fn ignore_already_set(result: Result<(), TryInitError>) -> AppResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a log level name (case-insensitive)
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(&level.to_lowercase()).map_err(|_| {
        DaqError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}

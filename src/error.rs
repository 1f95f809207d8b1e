//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the ingestion
//! pipeline. Using the `thiserror` crate, it provides a centralized way to handle
//! everything that can go wrong between the sensor and the disk.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the failure taxonomy of the pipeline:
//!
//! - **`Decode`**: a device line was malformed or incomplete. Dropped and logged.
//! - **`Device`** / **`SerialUnexpectedEof`**: the serial link is down or failed
//!   mid-read. The reader reconnects after a backoff.
//! - **`Pool`**: no store connection could be obtained within the retry budget.
//!   The reading stays only in the live buffer.
//! - **`Store`** / **`Csv`** / **`Io`**: a relational insert or file append failed.
//!   Both sinks fail independently.
//! - **`Classifier`**: the prediction call failed. Surfaced as an error marker in
//!   the API response.
//! - **`Config`** / **`Configuration`**: startup-only configuration problems.
//! - **`Internal`**: a panic caught at the ingestion boundary.
//!
//! [`DaqError::kind`] maps each variant onto the coarse [`ErrorKind`] recorded in
//! the live error log.

use crate::protocol::DecodeError;
use serde::Serialize;
use store_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised anywhere between the serial port and the HTTP API.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

/// Coarse failure category recorded in the live error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or incomplete device line.
    Decode,
    /// Serial link failure.
    Device,
    /// No store connection available.
    Pool,
    /// Relational insert failed.
    Store,
    /// Flat-file append failed.
    File,
    /// Prediction call failed.
    Classifier,
    /// Anything else caught at the ingestion boundary.
    Internal,
}

impl ErrorKind {
    /// Short lowercase label, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Decode => "decode",
            ErrorKind::Device => "device",
            ErrorKind::Pool => "pool",
            ErrorKind::Store => "store",
            ErrorKind::File => "file",
            ErrorKind::Classifier => "classifier",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DaqError {
    /// Category used when this error is recorded in the error log.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Decode(_) => ErrorKind::Decode,
            DaqError::Device(_)
            | DaqError::SerialUnexpectedEof
            | DaqError::SerialFeatureDisabled => ErrorKind::Device,
            DaqError::Pool(_) => ErrorKind::Pool,
            DaqError::Store(_) => ErrorKind::Store,
            DaqError::Csv(_) | DaqError::Io(_) => ErrorKind::File,
            DaqError::Classifier(_) => ErrorKind::Classifier,
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::Http(_)
            | DaqError::Task(_)
            | DaqError::Internal(_) => ErrorKind::Internal,
        }
    }
}

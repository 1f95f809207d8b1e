//! Line protocol decoder for the milk-quality sensor.
//!
//! The device emits one ASCII line per measurement, made of comma-separated
//! `KEY=VALUE` pairs:
//!
//! ```text
//! TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05,Status=OK
//! ```
//!
//! `TA`, `Temp`, `pH` and `Conductivity` are required; `Status` is optional and
//! defaults to `"Unknown"`. While the firmware boots or runs its self-test it
//! prints lines containing `READY` or `SIMULATION_MODE`; those are rejected as
//! informational, not as errors.
//!
//! Decoding is pure: the capture timestamp is passed in by the caller, so the
//! same input always yields the same output.

use crate::reading::{Reading, UNKNOWN_STATUS};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use thiserror::Error;

/// Substrings marking lines the device prints before producing real data.
pub const SENTINELS: [&str; 2] = ["SIMULATION_MODE", "READY"];

/// Wire keys of the four required channels, in `[ta, temp, ph, cond]` order.
pub const REQUIRED_KEYS: [&str; 4] = ["TA", "Temp", "pH", "Conductivity"];

/// Wire key of the optional status label.
pub const STATUS_KEY: &str = "Status";

/// Why a device line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,

    #[error("device not producing data yet ({sentinel})")]
    NotReady { sentinel: &'static str },

    #[error("line is not valid UTF-8")]
    InvalidEncoding,

    #[error("malformed key=value pair '{0}'")]
    MalformedPair(String),

    #[error("invalid number for '{key}': '{value}'")]
    InvalidNumber { key: String, value: String },

    #[error("non-numeric value for '{key}': '{value}'")]
    NonNumeric { key: &'static str, value: String },

    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

impl DecodeError {
    /// Rejections that describe device state rather than a fault.
    ///
    /// These are logged but never recorded in the error log.
    pub fn is_informational(&self) -> bool {
        matches!(self, DecodeError::NotReady { .. })
    }
}

/// A parsed value: numeric when the wire text carries a decimal point.
struct FieldValue<'a> {
    raw: &'a str,
    number: Option<f64>,
}

/// Decode one line of device output.
///
/// Values containing `.` must parse as numbers; values without one are kept as
/// raw text, and required channels written without a decimal point (`Temp=25`)
/// are accepted when that text is numeric. Empty segments are skipped and a
/// repeated key keeps its last value.
///
/// # Example
/// ```
/// use chrono::Local;
/// use milk_daq::protocol::decode_line;
///
/// let reading = decode_line("TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05", Local::now()).unwrap();
/// assert_eq!(reading.ph, 6.7);
/// assert_eq!(reading.status, "Unknown");
/// ```
pub fn decode_line(line: &str, captured_at: DateTime<Local>) -> Result<Reading, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(sentinel) = SENTINELS.iter().find(|s| line.contains(**s)) {
        return Err(DecodeError::NotReady { sentinel: *sentinel });
    }

    let mut fields: HashMap<&str, FieldValue<'_>> = HashMap::new();
    for segment in line.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let (key, raw) = segment
            .split_once('=')
            .ok_or_else(|| DecodeError::MalformedPair(segment.to_string()))?;
        let key = key.trim();
        let raw = raw.trim();
        if key.is_empty() {
            return Err(DecodeError::MalformedPair(segment.to_string()));
        }

        let number = if raw.contains('.') {
            let value = raw
                .parse::<f64>()
                .map_err(|_| DecodeError::InvalidNumber {
                    key: key.to_string(),
                    value: raw.to_string(),
                })?;
            Some(value)
        } else {
            None
        };
        fields.insert(key, FieldValue { raw, number });
    }

    let [ta, temp, ph, cond] = REQUIRED_KEYS;
    Ok(Reading {
        ta: channel(&fields, ta)?,
        temp: channel(&fields, temp)?,
        ph: channel(&fields, ph)?,
        cond: channel(&fields, cond)?,
        status: fields
            .get(STATUS_KEY)
            .map_or_else(|| UNKNOWN_STATUS.to_string(), |v| v.raw.to_string()),
        captured_at,
    })
}

/// Decode raw bytes read from the serial port (UTF-8, trimmed).
pub fn decode_bytes(bytes: &[u8], captured_at: DateTime<Local>) -> Result<Reading, DecodeError> {
    let line = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidEncoding)?;
    decode_line(line, captured_at)
}

fn channel(fields: &HashMap<&str, FieldValue<'_>>, key: &'static str) -> Result<f64, DecodeError> {
    let field = fields.get(key).ok_or(DecodeError::MissingField(key))?;
    let value = match field.number {
        Some(value) => value,
        None => field.raw.parse::<f64>().map_err(|_| DecodeError::NonNumeric {
            key,
            value: field.raw.to_string(),
        })?,
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(DecodeError::NonNumeric {
            key,
            value: field.raw.to_string(),
        })
    }
}

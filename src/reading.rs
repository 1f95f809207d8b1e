//! The decoded sensor measurement.

use chrono::{DateTime, Local};
use serde::Serialize;

/// Status recorded when the device line carries no `Status` field.
pub const UNKNOWN_STATUS: &str = "Unknown";

/// One decoded measurement from the milk-quality sensor.
///
/// Created by [`decode_line`](crate::protocol::decode_line) and never mutated
/// afterwards; the live buffer and the persistence writer each get their own
/// view of the same reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Titrable acidity.
    pub ta: f64,
    /// Temperature in °C.
    pub temp: f64,
    /// pH.
    pub ph: f64,
    /// Conductivity.
    pub cond: f64,
    /// Free-form device status label.
    pub status: String,
    /// Host time at which the line was decoded.
    pub captured_at: DateTime<Local>,
}

impl Reading {
    /// The four channel values in classifier order: `[ta, temp, ph, cond]`.
    pub fn channels(&self) -> [f64; 4] {
        [self.ta, self.temp, self.ph, self.cond]
    }
}

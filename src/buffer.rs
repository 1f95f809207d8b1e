//! Fixed-capacity live buffer of the most recent readings.
//!
//! The buffer is a sliding window: each push appends one reading (with its
//! optional prediction) and evicts the oldest once capacity is reached. Every
//! per-channel sequence exposed by [`BufferSnapshot`] is derived from the same
//! window, so index *i* always describes the same reading and all sequences
//! have equal length.
//!
//! A second, smaller window holds recent ingestion failures. It is written
//! through the [`ErrorSink`] trait so the ingestion loop does not depend on a
//! particular logging backend.
//!
//! One writer (the ingestion pipeline) and any number of readers (API
//! handlers) share the buffer through a cheap `Clone` handle. Writers hold the
//! lock only for one push; readers only for the length of a copy.

use crate::error::{DaqError, ErrorKind};
use crate::reading::Reading;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default number of readings kept in the window.
pub const DEFAULT_CAPACITY: usize = 20;

/// Default number of recent errors kept.
pub const DEFAULT_ERROR_CAPACITY: usize = 5;

/// Format of the `time` sequence.
const TIME_FORMAT: &str = "%H:%M:%S";

/// One ingestion failure, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    /// When the failure was recorded.
    pub at: DateTime<Local>,
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

/// Destination for failures caught at the ingestion boundary.
pub trait ErrorSink: Send + Sync {
    /// Record one failure.
    fn record(&self, kind: ErrorKind, message: String);

    /// Record an application error under its own kind.
    fn record_error(&self, err: &DaqError) {
        self.record(err.kind(), err.to_string());
    }
}

#[derive(Debug, Clone)]
struct Entry {
    reading: Reading,
    prediction: Option<String>,
}

#[derive(Debug)]
struct BufferInner {
    entries: VecDeque<Entry>,
    errors: VecDeque<ErrorRecord>,
    pushed: u64,
}

/// Immutable copy of the buffer at one instant.
///
/// All reading sequences have the same length (at most the buffer capacity)
/// and are ordered oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferSnapshot {
    /// Titrable acidity, oldest first.
    pub ta: Vec<f64>,
    /// Temperature.
    pub temp: Vec<f64>,
    /// pH.
    pub ph: Vec<f64>,
    /// Conductivity.
    pub cond: Vec<f64>,
    /// Capture times, `%H:%M:%S`.
    pub time: Vec<String>,
    /// Device status tokens.
    pub status: Vec<String>,
    /// Classifier labels, `None` where none was produced.
    pub prediction: Vec<Option<String>>,
    /// Recent ingestion failures, oldest first.
    pub errors: Vec<ErrorRecord>,
    /// Most recent reading, if any.
    #[serde(skip)]
    pub latest: Option<Reading>,
}

impl BufferSnapshot {
    /// Number of readings in the snapshot.
    pub fn len(&self) -> usize {
        self.ta.len()
    }

    /// Whether the snapshot holds no readings.
    pub fn is_empty(&self) -> bool {
        self.ta.is_empty()
    }
}

/// Shared handle to the live buffer.
#[derive(Debug, Clone)]
pub struct LiveBuffer {
    inner: Arc<RwLock<BufferInner>>,
    capacity: usize,
    error_capacity: usize,
}

impl Default for LiveBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_ERROR_CAPACITY)
    }
}

impl LiveBuffer {
    /// Create an empty buffer. Capacities below 1 are raised to 1.
    pub fn new(capacity: usize, error_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let error_capacity = error_capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(BufferInner {
                entries: VecDeque::with_capacity(capacity),
                errors: VecDeque::with_capacity(error_capacity),
                pushed: 0,
            })),
            capacity,
            error_capacity,
        }
    }

    /// Append a reading, evicting the oldest one when full.
    pub fn push(&self, reading: Reading, prediction: Option<String>) {
        let mut inner = self.inner.write();
        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(Entry {
            reading,
            prediction,
        });
        inner.pushed += 1;
    }

    /// Copy the current window and error log.
    pub fn snapshot(&self) -> BufferSnapshot {
        let inner = self.inner.read();
        let n = inner.entries.len();
        let mut snapshot = BufferSnapshot {
            ta: Vec::with_capacity(n),
            temp: Vec::with_capacity(n),
            ph: Vec::with_capacity(n),
            cond: Vec::with_capacity(n),
            time: Vec::with_capacity(n),
            status: Vec::with_capacity(n),
            prediction: Vec::with_capacity(n),
            errors: inner.errors.iter().cloned().collect(),
            latest: inner.entries.back().map(|e| e.reading.clone()),
        };

        for Entry {
            reading,
            prediction,
        } in &inner.entries
        {
            snapshot.ta.push(reading.ta);
            snapshot.temp.push(reading.temp);
            snapshot.ph.push(reading.ph);
            snapshot.cond.push(reading.cond);
            snapshot
                .time
                .push(reading.captured_at.format(TIME_FORMAT).to_string());
            snapshot.status.push(reading.status.clone());
            snapshot.prediction.push(prediction.clone());
        }
        snapshot
    }

    /// The most recent reading.
    pub fn latest(&self) -> Option<Reading> {
        self.inner.read().entries.back().map(|e| e.reading.clone())
    }

    /// Recent errors, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.read().errors.iter().cloned().collect()
    }

    /// Number of readings currently held.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether no reading has been held yet.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Total readings pushed since startup.
    pub fn total_pushed(&self) -> u64 {
        self.inner.read().pushed
    }

    /// Maximum number of readings held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum number of errors held.
    pub fn error_capacity(&self) -> usize {
        self.error_capacity
    }
}

impl ErrorSink for LiveBuffer {
    fn record(&self, kind: ErrorKind, message: String) {
        let mut inner = self.inner.write();
        if inner.errors.len() >= self.error_capacity {
            inner.errors.pop_front();
        }
        inner.errors.push_back(ErrorRecord {
            at: Local::now(),
            kind,
            message,
        });
    }
}

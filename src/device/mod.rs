//! Device reader: the serial link state machine.
//!
//! ```text
//! Disconnected ──open()──> Connected ──bytes waiting──> Reading
//!      ▲                       ▲   │                      │
//!      │                       │   └─nothing waiting──────┤ (sleep poll_interval)
//!      │                       └──────────line read───────┘
//!      └─────────────── any I/O failure (handle dropped) ──┘
//! ```
//!
//! The link is abstracted behind [`LinkOpener`] / [`SerialLink`] so the real
//! port ([`serial::SerialPortOpener`]) and the scripted test link
//! ([`mock::ScriptedOpener`]) drive the same reader. Blocking link calls run on
//! `spawn_blocking`; the link handle moves into the blocking task and back, so
//! no lock is held across I/O.
//!
//! A failure never ends the reader. [`DeviceReader::next_line`] returns the
//! error so the caller can record it, and the following call waits the
//! [`ReconnectPolicy`] delay before opening a fresh handle.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One open connection to the sensor.
///
/// Methods block for at most the port timeout.
pub trait SerialLink: Send {
    /// Bytes waiting to be read.
    fn bytes_available(&mut self) -> io::Result<u32>;

    /// Read up to and including the next `\n`.
    ///
    /// Returns an empty vec when the timeout passes before a line completes;
    /// a partial line is held back until its terminator arrives. End of stream
    /// is reported as [`io::ErrorKind::UnexpectedEof`].
    fn read_line(&mut self) -> io::Result<Vec<u8>>;
}

/// Opens fresh links to the sensor.
pub trait LinkOpener: Send + Sync + 'static {
    type Link: SerialLink + 'static;

    /// Open a new link. Stale input buffered by the driver is discarded.
    fn open(&self) -> io::Result<Self::Link>;

    /// Human-readable target, e.g. `/dev/ttyUSB0 @ 9600 baud`.
    fn describe(&self) -> String;
}

/// Link state as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    /// No open link; the next read attempts to open one.
    Disconnected,
    /// Link open, waiting for data.
    Connected,
    /// A line read is in progress.
    Reading,
}

/// Delay schedule for reopening the link after a fault.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reopen attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth per consecutive failure (1.0 = fixed delay).
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.0,
        }
    }
}

impl ReconnectPolicy {
    /// Policy from the `[serial]` section.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            initial_delay: config.reconnect_delay,
            max_delay: config.max_reconnect_delay.max(config.reconnect_delay),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    /// Delay before reopen attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

#[derive(Debug)]
struct StatusInner {
    state: ReaderState,
    target: String,
    lines_read: u64,
    faults: u64,
    connects: u64,
    last_error: Option<String>,
    connected_since: Option<DateTime<Local>>,
}

/// Point-in-time copy of the reader status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderStatusSnapshot {
    /// Current link state.
    pub state: ReaderState,
    /// Device description, e.g. port and baud rate.
    pub target: String,
    /// Non-blank lines returned.
    pub lines_read: u64,
    /// Open failures and read errors.
    pub faults: u64,
    /// Successful opens.
    pub connects: u64,
    /// Most recent fault message.
    pub last_error: Option<String>,
    /// When the current link was opened.
    pub connected_since: Option<DateTime<Local>>,
}

/// Shared, cloneable view of the reader's state and counters.
#[derive(Debug, Clone)]
pub struct ReaderStatus {
    inner: Arc<Mutex<StatusInner>>,
}

impl ReaderStatus {
    /// Fresh status for `target`, starting disconnected.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                state: ReaderState::Disconnected,
                target: target.into(),
                lines_read: 0,
                faults: 0,
                connects: 0,
                last_error: None,
                connected_since: None,
            })),
        }
    }

    /// Current link state.
    pub fn state(&self) -> ReaderState {
        self.inner.lock().state
    }

    /// Copy of the state and counters.
    pub fn snapshot(&self) -> ReaderStatusSnapshot {
        let inner = self.inner.lock();
        ReaderStatusSnapshot {
            state: inner.state,
            target: inner.target.clone(),
            lines_read: inner.lines_read,
            faults: inner.faults,
            connects: inner.connects,
            last_error: inner.last_error.clone(),
            connected_since: inner.connected_since,
        }
    }

    fn set_state(&self, state: ReaderState) {
        self.inner.lock().state = state;
    }

    fn connected(&self) {
        let mut inner = self.inner.lock();
        inner.state = ReaderState::Connected;
        inner.connects += 1;
        inner.connected_since = Some(Local::now());
    }

    fn line_read(&self) {
        let mut inner = self.inner.lock();
        inner.state = ReaderState::Connected;
        inner.lines_read += 1;
    }

    fn fault(&self, message: String) {
        let mut inner = self.inner.lock();
        inner.state = ReaderState::Disconnected;
        inner.faults += 1;
        inner.last_error = Some(message);
        inner.connected_since = None;
    }
}

/// Reads raw lines from the sensor, reconnecting after faults.
pub struct DeviceReader<O: LinkOpener> {
    opener: Arc<O>,
    link: Option<O::Link>,
    policy: ReconnectPolicy,
    poll_interval: Duration,
    status: ReaderStatus,
    /// Consecutive failures since the last successful open.
    failures: u32,
}

impl<O: LinkOpener> DeviceReader<O> {
    /// Reader that opens links with `opener` and polls every `poll_interval` when idle.
    pub fn new(opener: O, policy: ReconnectPolicy, poll_interval: Duration) -> Self {
        let status = ReaderStatus::new(opener.describe());
        Self {
            opener: Arc::new(opener),
            link: None,
            policy,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            status,
            failures: 0,
        }
    }

    /// Handle for observing the reader from other tasks.
    pub fn status(&self) -> ReaderStatus {
        self.status.clone()
    }

    /// Whether a link is currently open.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Wait for the next complete line from the device.
    ///
    /// Returns an error when the link could not be opened or failed mid-read;
    /// the handle is dropped in that case and the next call reconnects after
    /// the policy delay.
    pub async fn next_line(&mut self) -> AppResult<Vec<u8>> {
        loop {
            let link = match self.link.take() {
                Some(link) => link,
                None => self.connect().await?,
            };

            let (link, available) = run_blocking(link, |l| l.bytes_available()).await?;
            match available {
                Err(e) => return Err(self.fault(e)),
                Ok(0) => {
                    self.link = Some(link);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Ok(_) => {}
            }

            self.status.set_state(ReaderState::Reading);
            let (link, line) = run_blocking(link, |l| l.read_line()).await?;
            match line {
                Err(e) => return Err(self.fault(e)),
                Ok(bytes) => {
                    self.link = Some(link);
                    self.status.set_state(ReaderState::Connected);
                    if bytes.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    self.status.line_read();
                    return Ok(bytes);
                }
            }
        }
    }

    async fn connect(&mut self) -> AppResult<O::Link> {
        if self.failures > 0 {
            let delay = self.policy.delay_for_attempt(self.failures);
            debug!(?delay, attempt = self.failures, "waiting before reopening device");
            tokio::time::sleep(delay).await;
        }

        let opener = Arc::clone(&self.opener);
        let opened = tokio::task::spawn_blocking(move || opener.open())
            .await
            .map_err(|e| DaqError::Task(format!("device open task failed: {e}")))?;

        match opened {
            Ok(link) => {
                self.failures = 0;
                self.status.connected();
                info!(target = %self.opener.describe(), "device connected");
                Ok(link)
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                let message = format!("failed to open {}: {e}", self.opener.describe());
                warn!(error = %e, attempt = self.failures, "device open failed");
                self.status.fault(message.clone());
                Err(DaqError::Device(message))
            }
        }
    }

    fn fault(&mut self, error: io::Error) -> DaqError {
        self.link = None;
        self.failures = self.failures.saturating_add(1);
        warn!(error = %error, "device link failed, dropping handle");

        let err = if error.kind() == io::ErrorKind::UnexpectedEof {
            DaqError::SerialUnexpectedEof
        } else {
            DaqError::Device(format!("read from {} failed: {error}", self.opener.describe()))
        };
        self.status.fault(err.to_string());
        err
    }
}

/// Run a blocking link call on the blocking pool, returning the link with the result.
async fn run_blocking<L, T, F>(mut link: L, f: F) -> AppResult<(L, io::Result<T>)>
where
    L: SerialLink + 'static,
    T: Send + 'static,
    F: FnOnce(&mut L) -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = f(&mut link);
        (link, result)
    })
    .await
    .map_err(|e| DaqError::Task(format!("device I/O task failed: {e}")))
}

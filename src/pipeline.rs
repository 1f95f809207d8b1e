//! Ingestion orchestrator.
//!
//! One task drives the whole ingestion path:
//!
//! ```text
//! DeviceReader ─line─> decode ─Reading─> classify ─> LiveBuffer
//!                                                 └─> PersistenceWriter (store + CSV)
//! ```
//!
//! Every failure on that path is logged, recorded through the [`ErrorSink`],
//! and the loop moves on to the next line. A panic while handling a line is
//! caught and recorded the same way. Only the shutdown token ends the loop.

use crate::buffer::{ErrorSink, LiveBuffer};
use crate::classifier::SharedClassifier;
use crate::device::{DeviceReader, LinkOpener, ReaderStatus};
use crate::error::DaqError;
use crate::protocol::decode_bytes;
use crate::reading::Reading;
use crate::writer::PersistenceWriter;
use chrono::Local;
use futures::FutureExt;
use rusqlite::Connection;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use store_pool::Connector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    not_ready: AtomicU64,
    stored: AtomicU64,
    store_failures: AtomicU64,
    file_failures: AtomicU64,
    device_faults: AtomicU64,
    panics: AtomicU64,
}

/// Ingestion counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    /// Lines decoded into readings.
    pub accepted: u64,
    /// Lines rejected by the decoder.
    pub rejected: u64,
    /// Lines the device printed before producing data.
    pub not_ready: u64,
    /// Readings committed to the relational store.
    pub stored: u64,
    /// Readings whose relational write failed.
    pub store_failures: u64,
    /// Readings whose CSV append failed.
    pub file_failures: u64,
    /// Read errors reported by the device reader.
    pub device_faults: u64,
    /// Lines whose handling panicked.
    pub panics: u64,
}

/// Shared handle to the pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    counters: Arc<Counters>,
}

impl IngestStats {
    /// Current counter values.
    pub fn snapshot(&self) -> IngestSnapshot {
        let c = &self.counters;
        IngestSnapshot {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            not_ready: c.not_ready.load(Ordering::Relaxed),
            stored: c.stored.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
            file_failures: c.file_failures.load(Ordering::Relaxed),
            device_faults: c.device_faults.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The ingestion loop and everything it owns.
pub struct Pipeline<O, C>
where
    O: LinkOpener,
    C: Connector<Connection = Connection>,
{
    reader: DeviceReader<O>,
    buffer: LiveBuffer,
    writer: PersistenceWriter<C>,
    classifier: Option<SharedClassifier>,
    errors: Arc<dyn ErrorSink>,
    stats: IngestStats,
}

impl<O, C> Pipeline<O, C>
where
    O: LinkOpener,
    C: Connector<Connection = Connection>,
{
    /// Build a pipeline recording errors into the buffer's error log.
    pub fn new(reader: DeviceReader<O>, buffer: LiveBuffer, writer: PersistenceWriter<C>) -> Self {
        let errors: Arc<dyn ErrorSink> = Arc::new(buffer.clone());
        Self {
            reader,
            buffer,
            writer,
            classifier: None,
            errors,
            stats: IngestStats::default(),
        }
    }

    /// Label each accepted reading with `classifier`.
    pub fn with_classifier(mut self, classifier: Option<SharedClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Send errors somewhere other than the buffer's error log.
    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    /// Handle to the live window this pipeline fills.
    pub fn buffer(&self) -> LiveBuffer {
        self.buffer.clone()
    }

    /// Handle to the device reader's state and counters.
    pub fn reader_status(&self) -> ReaderStatus {
        self.reader.status()
    }

    /// Handle to the ingestion counters.
    pub fn stats(&self) -> IngestStats {
        self.stats.clone()
    }

    /// Run on a new task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Read, decode, buffer and persist until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            classifier = self.classifier.as_ref().map_or("none", |c| c.name()),
            "ingestion pipeline started"
        );

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = self.reader.next_line() => line,
            };

            match line {
                Ok(bytes) => {
                    let handled = AssertUnwindSafe(self.handle_line(&bytes))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = handled {
                        let err = DaqError::Internal(format!(
                            "line handler panicked: {}",
                            panic_message(&*panic)
                        ));
                        error!(error = %err, "ingestion step panicked, continuing");
                        IngestStats::bump(&self.stats.counters.panics);
                        self.errors.record_error(&err);
                    }
                }
                Err(e) => {
                    error!(error = %e, "device read failed");
                    IngestStats::bump(&self.stats.counters.device_faults);
                    self.errors.record_error(&e);
                }
            }
        }

        info!(
            accepted = self.stats.snapshot().accepted,
            "ingestion pipeline stopped"
        );
    }

    async fn handle_line(&mut self, bytes: &[u8]) {
        let counters = Arc::clone(&self.stats.counters);

        let reading = match decode_bytes(bytes, Local::now()) {
            Ok(reading) => reading,
            Err(e) if e.is_informational() => {
                IngestStats::bump(&counters.not_ready);
                warn!(reason = %e, "device not ready, line skipped");
                return;
            }
            Err(e) => {
                IngestStats::bump(&counters.rejected);
                let line = String::from_utf8_lossy(bytes);
                warn!(error = %e, line = %line.trim(), "rejected device line");
                self.errors.record_error(&DaqError::Decode(e));
                return;
            }
        };
        IngestStats::bump(&counters.accepted);

        let prediction = self.classify(&reading);
        debug!(
            ta = reading.ta,
            temp = reading.temp,
            ph = reading.ph,
            cond = reading.cond,
            status = %reading.status,
            prediction = prediction.as_deref().unwrap_or("-"),
            "reading accepted"
        );
        self.buffer.push(reading.clone(), prediction);

        let outcome = self.writer.persist(&reading).await;
        if outcome.is_success() {
            IngestStats::bump(&counters.stored);
        } else {
            IngestStats::bump(&counters.store_failures);
        }
        if outcome.file.is_err() {
            IngestStats::bump(&counters.file_failures);
        }
        for err in outcome.into_errors() {
            self.errors.record_error(&err);
        }
    }

    fn classify(&self, reading: &Reading) -> Option<String> {
        let classifier = self.classifier.as_ref()?;
        match classifier.classify_reading(reading) {
            Ok(label) => Some(label),
            Err(e) => {
                warn!(error = %e, classifier = classifier.name(), "classification failed");
                self.errors.record_error(&e);
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, RangeClassifier};
    use crate::config::RangeRule;
    use crate::device::mock::{ScriptedOpener, Step};
    use crate::device::ReconnectPolicy;
    use crate::error::ErrorKind;
    use crate::storage::CsvSink;
    use crate::store::{ReadingTable, SqliteConnector};
    use parking_lot::Mutex;
    use std::time::Duration;
    use store_pool::{Pool, PoolConfig};

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<(ErrorKind, String)>>,
    }

    impl ErrorSink for RecordingSink {
        fn record(&self, kind: ErrorKind, message: String) {
            self.records.lock().push((kind, message));
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: Arc<Pool<SqliteConnector>>,
        csv: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::new(dir.path().join("milk.db"), Duration::from_secs(1));
        connector.prepare().unwrap();
        let pool = Pool::new(connector, PoolConfig::default());
        let csv = dir.path().join("milk_data.csv");
        Fixture {
            _dir: dir,
            pool,
            csv,
        }
    }

    fn pipeline(
        fixture: &Fixture,
        opener: ScriptedOpener,
    ) -> Pipeline<ScriptedOpener, SqliteConnector> {
        let reader = DeviceReader::new(opener, ReconnectPolicy::default(), Duration::from_millis(50));
        let writer = PersistenceWriter::new(fixture.pool.clone(), CsvSink::new(&fixture.csv));
        Pipeline::new(reader, LiveBuffer::new(20, 5), writer)
    }

    async fn wait_for(buffer: &LiveBuffer, count: usize) {
        for _ in 0..2000 {
            if buffer.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("buffer never reached {count} readings");
    }

    #[tokio::test]
    async fn accepted_lines_reach_buffer_store_and_csv() {
        let fixture = fixture();
        let opener = ScriptedOpener::new().session([
            "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05,Status=OK\n",
            "TA=0.16,Temp=4.2,pH=6.6,Conductivity=4.80\n",
        ]);
        let pipeline = pipeline(&fixture, opener);
        let buffer = pipeline.buffer();
        let stats = pipeline.stats();

        let shutdown = CancellationToken::new();
        let handle = pipeline.spawn(shutdown.clone());
        wait_for(&buffer, 2).await;
        shutdown.cancel();
        handle.await.unwrap();

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.ta, vec![0.14, 0.16]);
        assert_eq!(snapshot.status, vec!["OK", "Unknown"]);
        assert_eq!(snapshot.prediction, vec![None, None]);

        let conn = fixture.pool.acquire().await.unwrap();
        assert_eq!(conn.count_readings().unwrap(), 2);
        let csv = std::fs::read_to_string(&fixture.csv).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert_eq!(stats.snapshot().stored, 2);
    }

    #[tokio::test]
    async fn continues_after_rejections_and_skips_sentinels() {
        let fixture = fixture();
        let opener = ScriptedOpener::new().session([
            "READY\n",
            "TA=0.14,Temp=25.3,pH=6.7\n",
            "garbage\n",
            "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05,Status=OK\n",
        ]);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = pipeline(&fixture, opener).with_error_sink(sink.clone());
        let buffer = pipeline.buffer();
        let stats = pipeline.stats();

        let shutdown = CancellationToken::new();
        let handle = pipeline.spawn(shutdown.clone());
        wait_for(&buffer, 1).await;
        shutdown.cancel();
        handle.await.unwrap();

        let records = sink.records.lock();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|(kind, _)| *kind == ErrorKind::Decode));
        assert!(records[0].1.contains("Conductivity"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.not_ready, 1);
        assert_eq!(snapshot.rejected, 2);
        assert_eq!(snapshot.accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn device_fault_is_recorded_and_reading_resumes() {
        let fixture = fixture();
        let opener = ScriptedOpener::new()
            .steps(vec![
                Step::line("TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05\n"),
                Step::Fail(std::io::ErrorKind::BrokenPipe),
            ])
            .session(["TA=0.15,Temp=25.3,pH=6.7,Conductivity=1.05\n"]);
        let pipeline = pipeline(&fixture, opener);
        let buffer = pipeline.buffer();
        let status = pipeline.reader_status();

        let shutdown = CancellationToken::new();
        let handle = pipeline.spawn(shutdown.clone());
        wait_for(&buffer, 2).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(buffer.snapshot().ta, vec![0.14, 0.15]);
        let errors = buffer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Device);
        assert_eq!(status.snapshot().connects, 2);
    }

    #[tokio::test]
    async fn classifier_labels_each_reading() {
        let fixture = fixture();
        let opener = ScriptedOpener::new().session([
            "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05\n",
            "TA=0.30,Temp=25.3,pH=5.1,Conductivity=1.05\n",
        ]);
        let classifier = RangeClassifier::new(
            vec![RangeRule {
                label: "acceptable".into(),
                ph: Some([6.4, 6.8]),
                ..Default::default()
            }],
            "bad",
        );
        let pipeline = pipeline(&fixture, opener).with_classifier(Some(Arc::new(classifier)));
        let buffer = pipeline.buffer();

        let shutdown = CancellationToken::new();
        let handle = pipeline.spawn(shutdown.clone());
        wait_for(&buffer, 2).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(
            buffer.snapshot().prediction,
            vec![Some("acceptable".to_string()), Some("bad".to_string())]
        );
    }

    /// Panics on its first call, labels everything "ok" afterwards.
    #[derive(Default)]
    struct PanicsOnFirstLabel {
        calls: AtomicU64,
    }

    impl Classifier for PanicsOnFirstLabel {
        fn classify(&self, _: f64, _: f64, _: f64, _: f64) -> Result<String, DaqError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("model file corrupted");
            }
            Ok("ok".to_string())
        }

        fn name(&self) -> &str {
            "panics-on-first-label"
        }
    }

    #[tokio::test]
    async fn panic_while_handling_line_is_recorded_and_loop_continues() {
        let fixture = fixture();
        let opener = ScriptedOpener::new().session([
            "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05\n",
            "TA=0.15,Temp=25.3,pH=6.7,Conductivity=1.05\n",
        ]);
        let pipeline = pipeline(&fixture, opener)
            .with_classifier(Some(Arc::new(PanicsOnFirstLabel::default())));
        let buffer = pipeline.buffer();
        let stats = pipeline.stats();

        let shutdown = CancellationToken::new();
        let handle = pipeline.spawn(shutdown.clone());
        wait_for(&buffer, 1).await;
        assert!(!handle.is_finished(), "ingestion task must survive a panic");
        shutdown.cancel();
        handle.await.unwrap();

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.ta, vec![0.15]);
        assert_eq!(snapshot.prediction, vec![Some("ok".to_string())]);

        let errors = buffer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Internal);
        assert!(errors[0].message.contains("model file corrupted"));
        assert_eq!(stats.snapshot().panics, 1);
    }

    #[tokio::test]
    async fn stops_promptly_when_idle() {
        let fixture = fixture();
        let pipeline = pipeline(&fixture, ScriptedOpener::new().steps(Vec::new()));
        let shutdown = CancellationToken::new();
        let handle = pipeline.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

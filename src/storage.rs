//! Append-only CSV sink for accepted readings.
//!
//! The file is opened in append mode for every row, so it can be rotated or
//! removed while the pipeline runs; a fresh file gets the header again.

use crate::error::AppResult;
use crate::reading::Reading;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Column header, written once per file.
pub const CSV_HEADER: [&str; 6] = [
    "titrable_acidity",
    "temperature",
    "pH",
    "conductivity",
    "status",
    "timestamp",
];

/// Format of the `timestamp` column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// CSV file receiving one row per accepted reading.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
    /// Serializes appends so rows and the header never interleave.
    lock: Arc<Mutex<()>>,
}

impl CsvSink {
    /// Sink appending to `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// File this sink appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one reading, writing the header first if the file is new or empty.
    ///
    /// Blocking; call from `spawn_blocking` inside async code.
    pub fn append(&self, reading: &Reading) -> AppResult<()> {
        let _guard = self.lock.lock();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(CSV_HEADER)?;
            info!(path = %self.path.display(), "created CSV file");
        }
        writer.write_record(&[
            reading.ta.to_string(),
            reading.temp.to_string(),
            reading.ph.to_string(),
            reading.cond.to_string(),
            reading.status.clone(),
            reading.captured_at.format(TIMESTAMP_FORMAT).to_string(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn reading(status: &str) -> Reading {
        Reading {
            ta: 0.14,
            temp: 25.3,
            ph: 6.7,
            cond: 1.05,
            status: status.into(),
            captured_at: Local.with_ymd_and_hms(2024, 5, 14, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn header_written_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("milk_data.csv"));

        sink.append(&reading("OK")).unwrap();
        sink.append(&reading("Spoiled")).unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "titrable_acidity,temperature,pH,conductivity,status,timestamp",
                "0.14,25.3,6.7,1.05,OK,2024-05-14 09:30:00",
                "0.14,25.3,6.7,1.05,Spoiled,2024-05-14 09:30:00",
            ]
        );
    }

    #[test]
    fn recreates_file_after_removal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("out/milk_data.csv"));

        sink.append(&reading("OK")).unwrap();
        std::fs::remove_file(sink.path()).unwrap();
        sink.append(&reading("OK")).unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.starts_with("titrable_acidity,"));
    }

    #[test]
    fn status_with_comma_is_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("milk_data.csv"));
        sink.append(&reading("warm, check")).unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert!(contents.contains("\"warm, check\""));
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        assert!(sink.append(&reading("OK")).is_err());
    }
}

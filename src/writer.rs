//! Persistence writer: relational insert plus CSV append per reading.
//!
//! The two sinks are independent. A failed insert does not skip the CSV row
//! and a failed append does not undo the insert; both outcomes are returned
//! so the caller can record each failure under its own kind.

use crate::error::{AppResult, DaqError};
use crate::reading::Reading;
use crate::storage::CsvSink;
use crate::store::ReadingTable;
use chrono::Local;
use rusqlite::Connection;
use std::sync::Arc;
use store_pool::{Connector, Pool};
use tracing::{debug, warn};

/// Result of persisting one reading.
#[derive(Debug)]
pub struct PersistOutcome {
    /// Row id of the relational insert.
    pub relational: AppResult<i64>,
    /// CSV append.
    pub file: AppResult<()>,
}

impl PersistOutcome {
    /// Whether the reading reached the relational store.
    pub fn is_success(&self) -> bool {
        self.relational.is_ok()
    }

    /// Consume the outcome, yielding the failures.
    pub fn into_errors(self) -> Vec<DaqError> {
        [self.relational.err(), self.file.err()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Writes readings to the pooled store and the CSV sink.
pub struct PersistenceWriter<C>
where
    C: Connector<Connection = Connection>,
{
    pool: Arc<Pool<C>>,
    csv: CsvSink,
}

impl<C> PersistenceWriter<C>
where
    C: Connector<Connection = Connection>,
{
    /// Writer inserting through `pool` and appending to `csv`.
    pub fn new(pool: Arc<Pool<C>>, csv: CsvSink) -> Self {
        Self { pool, csv }
    }

    /// The store pool.
    pub fn pool(&self) -> &Arc<Pool<C>> {
        &self.pool
    }

    /// Persist one reading to both sinks.
    pub async fn persist(&self, reading: &Reading) -> PersistOutcome {
        let relational = self.insert(reading).await;
        if let Err(e) = &relational {
            warn!(error = %e, "relational write failed");
        }

        let file = self.append(reading).await;
        if let Err(e) = &file {
            warn!(error = %e, path = %self.csv.path().display(), "CSV append failed");
        }

        PersistOutcome { relational, file }
    }

    async fn insert(&self, reading: &Reading) -> AppResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let reading = reading.clone();

        tokio::task::spawn_blocking(move || {
            let result = conn.insert_reading(&reading, Local::now());
            match result {
                Ok(id) => {
                    debug!(id, "reading stored");
                    Ok(id)
                }
                Err(e) => {
                    conn.mark_broken();
                    Err(DaqError::Store(e))
                }
            }
            // `conn` drops here and returns to the pool exactly once.
        })
        .await
        .map_err(|e| DaqError::Task(format!("store task failed: {e}")))?
    }

    async fn append(&self, reading: &Reading) -> AppResult<()> {
        let csv = self.csv.clone();
        let reading = reading.clone();
        tokio::task::spawn_blocking(move || csv.append(&reading))
            .await
            .map_err(|e| DaqError::Task(format!("CSV task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{run_migrations, SqliteConnector};
    use async_trait::async_trait;
    use std::time::Duration;
    use store_pool::{PoolConfig, RetryPolicy};

    fn reading() -> Reading {
        Reading {
            ta: 0.14,
            temp: 25.3,
            ph: 6.7,
            cond: 1.05,
            status: "OK".into(),
            captured_at: Local::now(),
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig {
            target_size: 2,
            max_overflow: 1,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_delay: Duration::from_millis(10),
            },
        }
    }

    /// Opens in-memory databases without the table, so every insert fails.
    struct UnmigratedConnector;

    #[async_trait]
    impl Connector for UnmigratedConnector {
        type Connection = Connection;
        type Error = rusqlite::Error;

        async fn connect(&self) -> Result<Connection, rusqlite::Error> {
            Connection::open_in_memory()
        }
    }

    /// Never yields a connection.
    struct DownConnector;

    #[async_trait]
    impl Connector for DownConnector {
        type Connection = Connection;
        type Error = std::io::Error;

        async fn connect(&self) -> Result<Connection, std::io::Error> {
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        }
    }

    /// In-memory databases with the schema applied.
    struct MemoryConnector;

    #[async_trait]
    impl Connector for MemoryConnector {
        type Connection = Connection;
        type Error = DaqError;

        async fn connect(&self) -> Result<Connection, DaqError> {
            let mut conn = Connection::open_in_memory()?;
            run_migrations(&mut conn)?;
            Ok(conn)
        }
    }

    #[tokio::test]
    async fn writes_both_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::new(dir.path().join("milk.db"), Duration::from_secs(1));
        connector.prepare().unwrap();
        let pool = Pool::new(connector, pool_config());
        let writer = PersistenceWriter::new(pool.clone(), CsvSink::new(dir.path().join("milk.csv")));

        let outcome = writer.persist(&reading()).await;
        assert!(outcome.is_success());
        assert!(outcome.file.is_ok());

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.count_readings().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_insert_still_appends_csv() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("milk.csv");
        let pool = Pool::new(UnmigratedConnector, pool_config());
        let writer = PersistenceWriter::new(pool.clone(), CsvSink::new(&csv_path));

        let outcome = writer.persist(&reading()).await;
        assert!(!outcome.is_success());
        assert!(matches!(outcome.relational, Err(DaqError::Store(_))));
        assert!(outcome.file.is_ok());
        assert_eq!(std::fs::read_to_string(&csv_path).unwrap().lines().count(), 2);

        // Released exactly once, and discarded as unhealthy.
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_exhaustion_still_appends_csv() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("milk.csv");
        let pool = Pool::new(DownConnector, pool_config());
        let writer = PersistenceWriter::new(pool, CsvSink::new(&csv_path));

        let outcome = writer.persist(&reading()).await;
        assert!(matches!(outcome.relational, Err(DaqError::Pool(_))));
        assert!(outcome.file.is_ok());
        assert!(csv_path.exists());
    }

    #[tokio::test]
    async fn failed_append_keeps_relational_result() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(MemoryConnector, pool_config());
        // A directory cannot be opened for append.
        let writer = PersistenceWriter::new(pool.clone(), CsvSink::new(dir.path()));

        let outcome = writer.persist(&reading()).await;
        assert!(outcome.is_success());
        assert!(outcome.file.is_err());

        let errors = outcome.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), crate::error::ErrorKind::File);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn connection_reused_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(MemoryConnector, pool_config());
        let writer = PersistenceWriter::new(pool.clone(), CsvSink::new(dir.path().join("milk.csv")));

        for _ in 0..5 {
            assert!(writer.persist(&reading()).await.is_success());
        }
        assert_eq!(pool.stats().created, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.count_readings().unwrap(), 5);
    }
}

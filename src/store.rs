//! Relational store: SQLite connector and the `milk_test` table.
//!
//! Connections are opened by [`SqliteConnector`], which plugs into the
//! `store-pool` crate. Schema changes are versioned through the
//! `user_version` pragma and applied once at startup by [`SqliteConnector::prepare`].

use crate::config::StoreConfig;
use crate::error::{AppResult, DaqError};
use crate::reading::Reading;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use store_pool::Connector;
use tracing::{debug, info, warn};

/// Latest schema version understood by this build.
pub const SCHEMA_VERSION: i32 = 1;

/// Format of the `created_at` column.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS milk_test (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    titrable_acidity REAL NOT NULL,
    temperature      REAL NOT NULL,
    pH               REAL NOT NULL,
    conductivity     REAL NOT NULL,
    status           TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_milk_test_created_at ON milk_test(created_at);
";

/// Bring the schema up to [`SCHEMA_VERSION`].
pub fn run_migrations(conn: &mut Connection) -> AppResult<()> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(DaqError::Configuration(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < SCHEMA_VERSION {
        let next = version + 1;
        apply_migration(&tx, next)?;
        version = next;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    info!(version = SCHEMA_VERSION, "database schema migrated");
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> AppResult<()> {
    match version {
        1 => Ok(tx.execute_batch(SCHEMA_V1)?),
        other => Err(DaqError::Configuration(format!(
            "no migration defined for schema version {other}"
        ))),
    }
}

/// A row of `milk_test`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    /// Row id.
    pub id: i64,
    /// Titrable acidity.
    pub titrable_acidity: f64,
    /// Temperature.
    pub temperature: f64,
    /// pH.
    pub ph: f64,
    /// Conductivity.
    pub conductivity: f64,
    /// Device status token.
    pub status: String,
    /// Write time, `CREATED_AT_FORMAT`.
    pub created_at: String,
}

/// Access to the `milk_test` table.
pub trait ReadingTable {
    /// Insert one reading in its own transaction, returning the new row id.
    fn insert_reading(&mut self, reading: &Reading, created_at: DateTime<Local>) -> rusqlite::Result<i64>;

    /// Number of stored readings.
    fn count_readings(&self) -> rusqlite::Result<u64>;

    /// Most recent rows, newest first.
    fn recent_readings(&self, limit: usize) -> rusqlite::Result<Vec<StoredReading>>;
}

impl ReadingTable for Connection {
    fn insert_reading(&mut self, reading: &Reading, created_at: DateTime<Local>) -> rusqlite::Result<i64> {
        // Dropping the transaction on error rolls it back.
        let tx = self.transaction()?;
        tx.execute(
            "INSERT INTO milk_test (titrable_acidity, temperature, pH, conductivity, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reading.ta,
                reading.temp,
                reading.ph,
                reading.cond,
                reading.status,
                created_at.format(CREATED_AT_FORMAT).to_string(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn count_readings(&self) -> rusqlite::Result<u64> {
        let count: i64 = self.query_row("SELECT COUNT(*) FROM milk_test", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn recent_readings(&self, limit: usize) -> rusqlite::Result<Vec<StoredReading>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.prepare(
            "SELECT id, titrable_acidity, temperature, pH, conductivity, status, created_at
             FROM milk_test ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(StoredReading {
                id: row.get(0)?,
                titrable_acidity: row.get(1)?,
                temperature: row.get(2)?,
                ph: row.get(3)?,
                conductivity: row.get(4)?,
                status: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}

/// Opens SQLite connections for the pool.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    /// Connector for the database file at `path`.
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    /// Connector for the `[store]` section.
    pub fn from_config(config: &StoreConfig) -> Self {
        if config.host.is_some() || config.user.is_some() {
            warn!(
                "store.host/store.user are ignored by the SQLite backend; using {}",
                config.database.display()
            );
        }
        Self::new(config.database.clone(), config.busy_timeout)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the database directory and run migrations.
    pub fn prepare(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = self.open_blocking()?;
        run_migrations(&mut conn)
    }

    fn open_blocking(&self) -> AppResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(error = %err, "failed to enable WAL mode");
        }
        Ok(conn)
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Connection = Connection;
    type Error = DaqError;

    async fn connect(&self) -> Result<Connection, DaqError> {
        let connector = self.clone();
        let conn = tokio::task::spawn_blocking(move || connector.open_blocking())
            .await
            .map_err(|e| DaqError::Task(format!("database open task failed: {e}")))??;
        debug!(path = %self.path.display(), "opened database connection");
        Ok(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        // A connection left inside a transaction cannot be reused safely.
        !conn.is_autocommit()
    }
}

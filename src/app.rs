//! Startup wiring: builds the pool, buffer, pipeline and API from configuration.

use crate::api::{self, ApiServer, ApiState};
use crate::buffer::LiveBuffer;
use crate::classifier;
use crate::config::AppConfig;
use crate::device::{DeviceReader, LinkOpener, ReconnectPolicy};
use crate::error::{AppResult, DaqError};
use crate::pipeline::{IngestStats, Pipeline};
use crate::storage::CsvSink;
use crate::store::SqliteConnector;
use crate::writer::PersistenceWriter;
use std::net::SocketAddr;
use std::sync::Arc;
use store_pool::Pool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A started application.
pub struct RunningApp {
    api: ApiServer,
    pipeline: JoinHandle<()>,
    pool: Arc<Pool<SqliteConnector>>,
    buffer: LiveBuffer,
    stats: IngestStats,
}

impl RunningApp {
    /// Address the HTTP API is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.api.local_addr()
    }

    /// The live window shared by the pipeline and the API.
    pub fn buffer(&self) -> &LiveBuffer {
        &self.buffer
    }

    /// The store connection pool.
    pub fn pool(&self) -> &Arc<Pool<SqliteConnector>> {
        &self.pool
    }

    /// Ingestion counters.
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Wait for the pipeline and the server to stop, then close the pool.
    ///
    /// Both stop when the shutdown token passed to [`start`] is cancelled.
    pub async fn wait(self) -> AppResult<()> {
        let (pipeline, api) = futures::future::join(self.pipeline, self.api.join()).await;
        let pipeline =
            pipeline.map_err(|e| DaqError::Task(format!("ingestion task failed: {e}")));

        self.pool.close();
        let stats = self.pool.stats();
        info!(
            created = stats.created,
            closed = stats.closed,
            "store pool closed"
        );

        pipeline.and(api)
    }
}

/// Build every component and start the ingestion task and the HTTP server.
pub async fn start<O: LinkOpener>(
    config: &AppConfig,
    opener: O,
    shutdown: CancellationToken,
) -> AppResult<RunningApp> {
    let classifier = classifier::from_config(&config.classifier)?;
    let addr = config.http_addr()?;

    let connector = SqliteConnector::from_config(&config.store);
    let prepare = connector.clone();
    match tokio::task::spawn_blocking(move || prepare.prepare()).await {
        Ok(Ok(())) => {}
        // Readings still reach the live buffer and the CSV without a store.
        Ok(Err(e)) => error!(error = %e, path = %connector.path().display(), "failed to prepare database"),
        Err(e) => return Err(DaqError::Task(format!("database setup task failed: {e}"))),
    }

    let pool = Pool::new(connector, config.pool.to_pool_config());
    if config.pool.warm_up {
        let opened = pool.warm_up().await;
        if opened < config.pool.size {
            warn!(opened, target = config.pool.size, "store pool only partially warmed");
        } else {
            info!(opened, "store pool warmed");
        }
    }

    let buffer = LiveBuffer::new(config.buffer.capacity, config.buffer.error_capacity);
    let reader = DeviceReader::new(
        opener,
        ReconnectPolicy::from_config(&config.serial),
        config.serial.poll_interval,
    );
    let writer = PersistenceWriter::new(pool.clone(), CsvSink::new(&config.storage.csv_path));
    let pipeline =
        Pipeline::new(reader, buffer.clone(), writer).with_classifier(classifier.clone());
    let stats = pipeline.stats();

    let state = ApiState::new(buffer.clone(), &config.storage.csv_path)
        .with_classifier(classifier)
        .with_reader_status(pipeline.reader_status())
        .with_ingest_stats(stats.clone())
        .with_pool(pool.clone());
    let api = api::spawn(addr, state, shutdown.clone())?;

    let pipeline = pipeline.spawn(shutdown);

    Ok(RunningApp {
        api,
        pipeline,
        pool,
        buffer,
        stats,
    })
}

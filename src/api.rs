//! HTTP read API.
//!
//! A small hyper server exposing the live buffer and the CSV file:
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /api/realtime`, `GET /realtime` | [`RealtimeResponse`] as JSON |
//! | `GET /download-csv`, `GET /download` | the CSV file, streamed as an attachment |
//! | `GET /api/system/status` | [`SystemStatus`] as JSON |
//! | `GET /health` | `OK` |
//!
//! Handlers only read shared state (buffer snapshots, status handles), so a
//! request never waits on the ingestion loop.

use crate::buffer::{ErrorRecord, LiveBuffer};
use crate::classifier::SharedClassifier;
use crate::device::{ReaderState, ReaderStatus, ReaderStatusSnapshot};
use crate::error::{AppResult, DaqError};
use crate::pipeline::{IngestSnapshot, IngestStats};
use chrono::{Local, SecondsFormat};
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store_pool::{Connector, Pool};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Prediction for the most recent reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prediction {
    /// Label returned by the classifier.
    Label(String),
    /// The classifier failed; serialized as `{"error": "..."}`.
    Failed {
        /// Error message.
        error: String,
    },
}

/// Body of `GET /api/realtime`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeResponse {
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
    /// Per-reading labels, aligned with the channel arrays.
    pub predictions: Vec<Option<String>>,
    /// Label for the latest reading; `null` without a classifier or data.
    pub prediction: Option<Prediction>,
    /// `[ta, temp, ph, cond]` of the latest reading.
    pub latest: Option<[f64; 4]>,
    /// Recent ingestion failures, oldest first.
    pub errors: Vec<ErrorRecord>,
    /// Response time, ISO-8601.
    pub timestamp: String,
}

/// Pool counters in the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Idle connections.
    pub idle: usize,
    /// Connections held by writers.
    pub in_use: usize,
    /// Connections opened since startup.
    pub created: usize,
    /// Connections closed since startup.
    pub closed: usize,
    /// Idle set target.
    pub target_size: usize,
    /// Extra connections allowed beyond the target.
    pub max_overflow: usize,
}

impl From<store_pool::PoolStats> for PoolStatus {
    fn from(stats: store_pool::PoolStats) -> Self {
        Self {
            idle: stats.idle,
            in_use: stats.in_use,
            created: stats.created,
            closed: stats.closed,
            target_size: stats.target_size,
            max_overflow: stats.max_overflow,
        }
    }
}

/// Live buffer fill in the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferSizes {
    /// Readings currently held.
    pub readings: usize,
    /// Maximum readings held.
    pub capacity: usize,
    /// Entries in the error log.
    pub errors: usize,
    /// Readings pushed since startup.
    pub total_pushed: u64,
}

/// Body of `GET /api/system/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    /// The device link is open.
    pub serial_connected: bool,
    /// The pool holds at least one store connection.
    pub database_connected: bool,
    /// Capture time of the latest reading, `%H:%M:%S`.
    pub last_update: Option<String>,
    /// Live buffer fill.
    pub buffer_sizes: BufferSizes,
    /// Device reader state and counters.
    pub reader: Option<ReaderStatusSnapshot>,
    /// Store pool counters.
    pub pool: Option<PoolStatus>,
    /// Ingestion counters.
    pub ingest: Option<IngestSnapshot>,
    /// Name of the configured classifier.
    pub classifier: Option<String>,
    /// Response time, ISO-8601.
    pub timestamp: String,
}

type PoolStatsFn = Arc<dyn Fn() -> store_pool::PoolStats + Send + Sync>;

/// Everything the handlers read.
#[derive(Clone)]
pub struct ApiState {
    buffer: LiveBuffer,
    csv_path: PathBuf,
    classifier: Option<SharedClassifier>,
    reader: Option<ReaderStatus>,
    ingest: Option<IngestStats>,
    pool_stats: Option<PoolStatsFn>,
}

impl ApiState {
    /// State serving `buffer` and the CSV at `csv_path`, with nothing else attached.
    pub fn new(buffer: LiveBuffer, csv_path: impl Into<PathBuf>) -> Self {
        Self {
            buffer,
            csv_path: csv_path.into(),
            classifier: None,
            reader: None,
            ingest: None,
            pool_stats: None,
        }
    }

    /// Classifier used for the latest-reading prediction.
    pub fn with_classifier(mut self, classifier: Option<SharedClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Report the device reader in the status response.
    pub fn with_reader_status(mut self, reader: ReaderStatus) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Report ingestion counters in the status response.
    pub fn with_ingest_stats(mut self, ingest: IngestStats) -> Self {
        self.ingest = Some(ingest);
        self
    }

    /// Report store pool counters in the status response.
    pub fn with_pool<C: Connector>(mut self, pool: Arc<Pool<C>>) -> Self {
        self.pool_stats = Some(Arc::new(move || pool.stats()));
        self
    }

    /// Build the realtime response from one buffer snapshot.
    pub fn realtime(&self) -> RealtimeResponse {
        let snapshot = self.buffer.snapshot();
        let latest = snapshot.latest.as_ref().map(|r| r.channels());

        let prediction = match (&self.classifier, &snapshot.latest) {
            (Some(classifier), Some(reading)) => Some(match classifier.classify_reading(reading) {
                Ok(label) => Prediction::Label(label),
                Err(e) => {
                    warn!(error = %e, "prediction failed");
                    Prediction::Failed {
                        error: e.to_string(),
                    }
                }
            }),
            _ => None,
        };

        RealtimeResponse {
            ta: snapshot.ta,
            temp: snapshot.temp,
            ph: snapshot.ph,
            cond: snapshot.cond,
            time: snapshot.time,
            status: snapshot.status,
            predictions: snapshot.prediction,
            prediction,
            latest,
            errors: snapshot.errors,
            timestamp: now_iso(),
        }
    }

    /// Build the status response.
    pub fn system_status(&self) -> SystemStatus {
        let reader = self.reader.as_ref().map(ReaderStatus::snapshot);
        let pool = self.pool_stats.as_ref().map(|stats| PoolStatus::from(stats()));
        let latest = self.buffer.latest();

        SystemStatus {
            serial_connected: reader
                .as_ref()
                .is_some_and(|r| r.state != ReaderState::Disconnected),
            database_connected: pool.is_some_and(|p| p.idle + p.in_use > 0),
            last_update: latest.map(|r| r.captured_at.format("%H:%M:%S").to_string()),
            buffer_sizes: BufferSizes {
                readings: self.buffer.len(),
                capacity: self.buffer.capacity(),
                errors: self.buffer.errors().len(),
                total_pushed: self.buffer.total_pushed(),
            },
            reader,
            pool,
            ingest: self.ingest.as_ref().map(IngestStats::snapshot),
            classifier: self.classifier.as_ref().map(|c| c.name().to_string()),
            timestamp: now_iso(),
        }
    }
}

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Route one request.
pub async fn handle(state: ApiState, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    debug!(method = %req.method(), path = req.uri().path(), "api request");

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/realtime" | "/realtime") => json_response(&state.realtime()),
        (&Method::GET, "/api/system/status") => json_response(&state.system_status()),
        (&Method::GET, "/download-csv" | "/download") => download_csv(&state).await,
        (&Method::GET, "/health") => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

async fn download_csv(state: &ApiState) -> Response<Body> {
    match tokio::fs::File::open(&state.csv_path).await {
        Ok(file) => {
            let mut response = Response::new(Body::wrap_stream(ReaderStream::new(file)));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/csv"));
            headers.insert(
                CONTENT_DISPOSITION,
                HeaderValue::from_static("attachment; filename=\"milk_data.csv\""),
            );
            response
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            text_response(StatusCode::NOT_FOUND, "CSV file not found")
        }
        Err(e) => {
            error!(error = %e, path = %state.csv_path.display(), "failed to open CSV file");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to read CSV file: {e}"),
            )
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "failed to encode response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// A running API server.
pub struct ApiServer {
    local_addr: SocketAddr,
    task: JoinHandle<AppResult<()>>,
}

impl ApiServer {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to finish after shutdown.
    pub async fn join(self) -> AppResult<()> {
        self.task
            .await
            .map_err(|e| DaqError::Task(format!("HTTP server task failed: {e}")))?
    }
}

/// Bind `addr` and serve until `shutdown` fires, then drain in-flight requests.
pub fn spawn(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> AppResult<ApiServer> {
    let make_service = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req)))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    let local_addr = server.local_addr();
    let graceful = server.with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });

    info!(addr = %local_addr, "HTTP API listening");
    let task = tokio::spawn(async move {
        graceful.await?;
        info!("HTTP API stopped");
        Ok::<(), DaqError>(())
    });

    Ok(ApiServer { local_addr, task })
}

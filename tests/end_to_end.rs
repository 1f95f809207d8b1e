//! End-to-end tests: scripted device -> pipeline -> SQLite + CSV -> HTTP API.

use hyper::{Client, StatusCode};
use milk_daq::app::{self, RunningApp};
use milk_daq::config::AppConfig;
use milk_daq::device::mock::ScriptedOpener;
use milk_daq::store::{ReadingTable, SqliteConnector};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Test configuration writing into `dir`, with an ephemeral HTTP port.
fn create_test_config(dir: &Path, classifier: &str) -> AppConfig {
    let toml_str = format!(
        r#"
        [application]
        log_level = "debug"

        [serial]
        poll_interval = "5ms"
        reconnect_delay = "20ms"
        max_reconnect_delay = "20ms"

        [store]
        database = '{db}'

        [pool]
        size = 2
        retry_delay = "10ms"

        [storage]
        csv_path = '{csv}'

        [http]
        bind = "127.0.0.1:0"

        {classifier}
        "#,
        db = dir.join("milk.db").display(),
        csv = dir.join("milk_data.csv").display(),
    );
    let config = AppConfig::from_toml_str(&toml_str).expect("Failed to parse test config");
    config.validate().expect("Test config should be valid");
    config
}

const RANGE_CLASSIFIER: &str = r#"
    [classifier]
    kind = "range"
    default_label = "bad"

    [[classifier.rules]]
    label = "acceptable"
    ph = [6.4, 6.8]
    ta = [0.12, 0.18]

    [[classifier.rules]]
    label = "spoiled"
    ph = [0.0, 6.0]
"#;

async fn wait_for_readings(app: &RunningApp, count: usize) {
    for _ in 0..500 {
        if app.stats().snapshot().stored as usize >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline never stored {count} readings");
}

async fn get(app: &RunningApp, path: &str) -> (StatusCode, hyper::body::Bytes) {
    let uri = format!("http://{}{}", app.local_addr(), path)
        .parse()
        .expect("valid uri");
    let response = Client::new().get(uri).await.expect("request failed");
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .expect("body read failed");
    (status, body)
}

#[tokio::test]
async fn test_lines_flow_to_every_sink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = create_test_config(dir.path(), RANGE_CLASSIFIER);
    let opener = ScriptedOpener::new().session([
        "READY\n",
        "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05,Status=OK\n",
        "TA=0.14,Temp=25.3,pH=6.7\n",
        "TA=0.30,Temp=26.0,pH=5.4,Conductivity=1.40,Status=Spoiled\n",
    ]);

    let shutdown = CancellationToken::new();
    let app = app::start(&config, opener, shutdown.clone())
        .await
        .expect("Failed to start app");
    wait_for_readings(&app, 2).await;

    // Live window via the API
    let (status, body) = get(&app, "/api/realtime").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(json["ta"], serde_json::json!([0.14, 0.3]));
    assert_eq!(json["status"], serde_json::json!(["OK", "Spoiled"]));
    assert_eq!(json["predictions"], serde_json::json!(["acceptable", "spoiled"]));
    assert_eq!(json["prediction"], "spoiled");
    assert_eq!(json["latest"], serde_json::json!([0.3, 26.0, 5.4, 1.4]));
    assert_eq!(json["errors"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["errors"][0]["kind"], "decode");

    // CSV download
    let (status, body) = get(&app, "/download-csv").await;
    assert_eq!(status, StatusCode::OK);
    let csv = String::from_utf8(body.to_vec()).expect("utf8");
    let lines: Vec<_> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "titrable_acidity,temperature,pH,conductivity,status,timestamp"
    );
    assert!(lines[1].starts_with("0.14,25.3,6.7,1.05,OK,"));

    // Status endpoint
    let (status, body) = get(&app, "/api/system/status").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(json["serial_connected"], true);
    assert_eq!(json["database_connected"], true);
    assert_eq!(json["ingest"]["not_ready"], 1);
    assert_eq!(json["classifier"], "range");

    shutdown.cancel();
    app.wait().await.expect("clean shutdown");

    // Relational rows survive shutdown
    let connector = SqliteConnector::new(dir.path().join("milk.db"), Duration::from_secs(1));
    let conn = rusqlite::Connection::open(connector.path()).expect("open db");
    let rows = conn.recent_readings(10).expect("query");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, "Spoiled");
    assert_eq!(rows[1].titrable_acidity, 0.14);
}

#[tokio::test]
async fn test_device_absent_keeps_serving() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = create_test_config(dir.path(), "");
    let opener = ScriptedOpener::new().fail_open().fail_open();

    let shutdown = CancellationToken::new();
    let app = app::start(&config, opener, shutdown.clone())
        .await
        .expect("Failed to start app");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = get(&app, "/api/realtime").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(json["ta"], serde_json::json!([]));
    assert!(json["prediction"].is_null());
    assert_eq!(json["errors"][0]["kind"], "device");

    // Nothing written yet
    let (status, _) = get(&app, "/download-csv").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"OK");

    shutdown.cancel();
    app.wait().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_shutdown_completes_quickly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = create_test_config(dir.path(), "");
    let opener = ScriptedOpener::new().steps(Vec::new());

    let shutdown = CancellationToken::new();
    let app = app::start(&config, opener, shutdown.clone())
        .await
        .expect("Failed to start app");
    let pool = app.pool().clone();
    assert_eq!(pool.stats().idle, 2, "pool should be pre-warmed");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), app.wait())
        .await
        .expect("shutdown took too long")
        .expect("clean shutdown");

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.closed, 2);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = create_test_config(dir.path(), "");
    let shutdown = CancellationToken::new();
    let app = app::start(&config, ScriptedOpener::new(), shutdown.clone())
        .await
        .expect("Failed to start app");

    let (status, _) = get(&app, "/api/data").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    shutdown.cancel();
    app.wait().await.expect("clean shutdown");
}

//! # milk_daq
//!
//! Real-time ingestion for a serial milk-quality sensor. Lines from the
//! device are decoded into readings, kept in a bounded live window, written to
//! a relational store through a connection pool and appended to a CSV file.
//! A small HTTP API serves the live window and the CSV.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: pure decoder for the `KEY=VALUE,...` line format.
//! - **`device`**: serial link state machine with reconnect policy.
//! - **`buffer`**: the live window and the recent-error log.
//! - **`store`** / **`storage`**: SQLite table and CSV sink.
//! - **`writer`**: persists one reading to both sinks.
//! - **`classifier`**: optional quality labels.
//! - **`pipeline`**: the ingestion loop tying the above together.
//! - **`api`**: hyper server for the read endpoints.
//! - **`app`**: builds and starts everything from an [`config::AppConfig`].
//! - **`config`**, **`logging`**, **`error`**: ambient plumbing.
//!
//! The connection pool lives in the `store-pool` workspace crate.

pub mod api;
pub mod app;
pub mod buffer;
pub mod classifier;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod protocol;
pub mod reading;
pub mod storage;
pub mod store;
pub mod writer;

pub use error::{AppResult, DaqError};
pub use reading::Reading;

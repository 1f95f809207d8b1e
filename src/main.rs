//! CLI entry point for milk-daq.
//!
//! ```bash
//! milk-daq run --config config/milk_daq.toml   # ingest until Ctrl-C
//! milk-daq decode "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05"
//! milk-daq check-config --config config/milk_daq.toml
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use milk_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use milk_daq::{app, logging, protocol};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "milk-daq")]
#[command(about = "Milk-quality sensor ingestion service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the sensor, persist readings and serve the HTTP API
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Decode one device line and print the reading as JSON
    Decode {
        /// Raw line, e.g. "TA=0.14,Temp=25.3,pH=6.7,Conductivity=1.05"
        line: String,
    },

    /// Load and validate configuration, then print the effective settings
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Decode { line } => decode(&line),
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    logging::init_from_config(&config)?;
    info!(
        config = %config_path.display(),
        port = %config.serial.port,
        database = %config.store.database.display(),
        "starting {}",
        config.application.name
    );

    let shutdown = CancellationToken::new();
    let running = start(&config, shutdown.clone()).await?;
    info!(addr = %running.local_addr(), "ready");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        signal.cancel();
    });

    running.wait().await?;
    info!("stopped");
    Ok(())
}

#[cfg(feature = "instrument_serial")]
async fn start(config: &AppConfig, shutdown: CancellationToken) -> Result<app::RunningApp> {
    let opener = milk_daq::device::serial::SerialPortOpener::from_config(&config.serial);
    Ok(app::start(config, opener, shutdown).await?)
}

#[cfg(not(feature = "instrument_serial"))]
async fn start(_config: &AppConfig, _shutdown: CancellationToken) -> Result<app::RunningApp> {
    Err(milk_daq::DaqError::SerialFeatureDisabled.into())
}

fn decode(line: &str) -> Result<()> {
    let reading = protocol::decode_line(line, Local::now())?;
    println!("{}", serde_json::to_string_pretty(&reading)?);
    Ok(())
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    println!("Configuration OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_accepts_a_borrowed_path() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = load_config(&path).unwrap();
        assert_eq!(config.application.name, "milk-daq");
    }
}

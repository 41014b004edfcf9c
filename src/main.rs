//! Meetpad host binary
//!
//! Runs the macropad-to-conferencing bridge until interrupted, or performs
//! a one-shot firmware upgrade with `--update`.

use anyhow::{Context, Result};
use clap::Parser;
use meetpad::hid::device::DeviceSpec;
use meetpad::meeting::client::Identifier;
use meetpad::Macropad;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default local control API endpoint.
const DEFAULT_CONTROL_URI: &str = "ws://127.0.0.1:8124";

#[derive(Parser)]
#[command(name = "meetpad", about = "Meetpad macropad host driver")]
struct Cli {
    /// Control API endpoint
    #[arg(long, default_value = DEFAULT_CONTROL_URI)]
    uri: String,

    /// Pairing token granted by the conferencing application
    #[arg(long, default_value = "")]
    token: String,

    /// Explicit device vendor id (hex or decimal); 0 matches by serial
    #[arg(long, value_parser = parse_u16, default_value = "0")]
    vendor_id: u16,

    /// Explicit device product id (hex or decimal); 0 matches by serial
    #[arg(long, value_parser = parse_u16, default_value = "0")]
    product_id: u16,

    /// Explicit device serial number
    #[arg(long)]
    serial: Option<String>,

    /// Flash the given firmware files and exit
    #[arg(long = "update", value_name = "FILE", num_args = 1..)]
    update_files: Vec<PathBuf>,
}

fn parse_u16(value: &str) -> std::result::Result<u16, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn device_specs(cli: &Cli) -> Vec<DeviceSpec> {
    if cli.vendor_id == 0 && cli.product_id == 0 && cli.serial.is_none() {
        return Vec::new();
    }
    vec![DeviceSpec {
        vendor_id: cli.vendor_id,
        product_id: cli.product_id,
        serial_number: cli.serial.clone(),
    }]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let identifier = Identifier {
        manufacturer: "Meetpad".to_string(),
        device: "Macropad".to_string(),
        app: env!("CARGO_PKG_NAME").to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        token: cli.token.clone(),
    };

    let macropad = Arc::new(
        Macropad::new(device_specs(&cli), &cli.uri, identifier)
            .context("failed to initialize the macropad driver")?,
    );

    if !cli.update_files.is_empty() {
        info!("flashing {} file(s)", cli.update_files.len());
        macropad
            .manual_update(&cli.update_files)
            .await
            .context("firmware upgrade failed")?;
        macropad.stop().await;
        return Ok(());
    }

    macropad.on_token_refresh(|_token| {
        // Token persistence is the configuration layer's concern; without
        // one the refreshed token is only valid for this session.
        warn!("received a refreshed pairing token; pass it via --token next time");
    });

    let runner = Arc::clone(&macropad);
    let worker = tokio::spawn(async move { runner.process().await });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    macropad.stop().await;
    worker.await.context("driver task panicked")?;

    Ok(())
}

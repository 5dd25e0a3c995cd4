use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use ble_midi_central::config;
use ble_midi_central::device::types::CentralWarning;
use ble_midi_central::transport::btle::BtleTransport;
use ble_midi_central::{init_logging, BleMidiCentral};

/// Scan for BLE MIDI peripherals and print their traffic.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to a JSON config file with UUID overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scan timeout in milliseconds; 0 scans until interrupted.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Connect to matching peripherals as they are found.
    #[arg(long)]
    auto_connect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    info!(concat!("BLE MIDI monitor ", env!("CARGO_PKG_VERSION")));

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::io::read(path).await?,
        None => config::types::CentralConfig::default(),
    };
    let timeout_ms = args.timeout_ms.unwrap_or(config.scan_timeout_ms);
    let auto_connect = args.auto_connect || config.auto_connect;

    let transport = Arc::new(BtleTransport::new().await?);
    let central = BleMidiCentral::with_uuids(transport, config.uuid_registry()?).await?;

    central.on_device_found(Box::new(|identity| {
        info!("Found MIDI peripheral {}", identity);
    }));
    central.on_input_attached(Box::new(|device| {
        info!("Input attached: {} ({})", device.identity, device.name);
    }));
    central.on_output_attached(Box::new(|device| {
        info!("Output attached: {} ({})", device.identity, device.name);
    }));
    central.on_input_detached(Box::new(|device| {
        info!("Input detached: {}", device.identity);
    }));
    central.on_output_detached(Box::new(|device| {
        info!("Output detached: {}", device.identity);
    }));
    central.on_connection_status(Box::new(|identity, status| {
        info!("{} is now {:?}", identity, status);
    }));
    central.on_warning(Box::new(|warning| match warning {
        CentralWarning::SysexInterrupted { identity, discarded } => {
            info!("{}: sysex interrupted, {} bytes lost", identity, discarded);
        }
        CentralWarning::WriteFailed { identity, reason } => {
            info!("{}: write failed: {}", identity, reason);
        }
    }));
    central.on_data(Box::new(|device, message| {
        info!("{}: {:02x?}", device.name, message);
    }));

    central.start_scan(timeout_ms, auto_connect).await?;

    tokio::signal::ctrl_c().await?;
    central.terminate().await;

    Ok(())
}

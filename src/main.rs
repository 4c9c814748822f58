use std::time::Duration;

use clap::{Parser, Subcommand};
use obdphawd::{init_logger, log_info, DecodedValue, MacAddress, ObdDeviceManager, ObdError};

#[derive(Parser)]
#[command(name = "obdphawd-cli")]
#[command(about = "CLI tool for OBD-II diagnostics over wireless adapters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for BLE OBD adapters
    Scan {
        #[arg(short, long, default_value = "5")]
        seconds: u64,
        /// Print results as a JSON array instead of the table
        #[arg(long)]
        json: bool,
    },
    /// Read a Mode 0x01 PID from an adapter
    Read {
        device: String,
        /// PID in hex, e.g. 0C for engine speed
        pid: String,
    },
    /// Read the vehicle identification number
    Vin { device: String },
    /// Read stored diagnostic trouble codes
    Dtc { device: String },
    /// Clear trouble codes and stored freeze frames
    ClearDtc { device: String },
}

/// Opens a session on either a BLE MAC address or a serial device path.
async fn connect(manager: &mut ObdDeviceManager, device: &str) -> Result<String, ObdError> {
    if device.starts_with('/') {
        manager.connect_serial(device).await?;
        Ok(device.to_string())
    } else {
        let address: MacAddress = device.parse()?;
        manager.connect_ble(address).await?;
        Ok(address.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<(), ObdError> {
    init_logger();

    let cli = Cli::parse();
    let mut manager = ObdDeviceManager::new();

    match cli.command {
        Commands::Scan { seconds, json } => {
            let devices = manager.scan_ble(Duration::from_secs(seconds)).await?;
            if json {
                let rendered = serde_json::to_string_pretty(&devices)
                    .map_err(|e| ObdError::InvalidInput(e.to_string()))?;
                println!("{rendered}");
                return Ok(());
            }
            for device in devices {
                log_info(&format!(
                    "{}  rssi {}  {}{}",
                    device.address,
                    device
                        .rssi
                        .map_or_else(|| "  ?".into(), |r| format!("{r:4}")),
                    device.name.as_deref().unwrap_or("(unnamed)"),
                    if device.looks_automotive() {
                        "  [obd]"
                    } else {
                        ""
                    },
                ));
            }
        }
        Commands::Read { device, pid } => {
            let pid = u8::from_str_radix(pid.trim_start_matches("0x"), 16)
                .map_err(|_| ObdError::InvalidInput(format!("bad PID {pid:?}")))?;
            let key = connect(&mut manager, &device).await?;
            match manager.read_pid(&key, pid).await? {
                DecodedValue::Numeric { value, unit } => {
                    log_info(&format!("PID 0x{pid:02X}: {value} {unit}"))
                }
                other => log_info(&format!("PID 0x{pid:02X}: {other:?}")),
            }
            manager.disconnect_all().await;
        }
        Commands::Vin { device } => {
            let key = connect(&mut manager, &device).await?;
            let vin = manager.read_vin(&key).await?;
            log_info(&format!("VIN: {vin}"));
            manager.disconnect_all().await;
        }
        Commands::Dtc { device } => {
            let key = connect(&mut manager, &device).await?;
            let codes = manager.read_dtcs(&key).await?;
            if codes.is_empty() {
                log_info("No stored trouble codes");
            }
            for code in codes {
                log_info(&format!("DTC: {code}"));
            }
            manager.disconnect_all().await;
        }
        Commands::ClearDtc { device } => {
            let key = connect(&mut manager, &device).await?;
            manager.clear_dtcs(&key).await?;
            log_info("Trouble codes cleared");
            manager.disconnect_all().await;
        }
    }

    Ok(())
}

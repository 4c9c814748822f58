//! # obdphawd - A Rust Crate for OBD-II Diagnostics over Wireless Adapters
//!
//! The obdphawd crate provides a Rust-based implementation of on-board
//! diagnostics (SAE J1979) over consumer wireless OBD-II adapters: BLE GATT
//! dongles, Bluetooth Classic SPP dongles bound to rfcomm device nodes, and
//! USB-serial ELM327 adapters.
//!
//! ## Features
//!
//! - Scan for BLE OBD adapters, deduplicated by MAC address with the
//!   strongest observed signal
//! - Connect with retry backoff and resolve the dongle's GATT serial
//!   service by priority
//! - Speak both adapter dialects: ELM327 text mode (auto-detected via ATZ)
//!   and raw binary ISO-TP framing
//! - Full ISO 15765-2 segmentation: multi-frame reassembly, flow control,
//!   block-size and STmin pacing
//! - Encode Service/PID requests and decode responses to typed values via
//!   the SAE J1979 formula table
//! - Read and clear diagnostic trouble codes, read the VIN, poll PIDs on a
//!   fixed period
//! - Support for logging and error handling
//!
//! ## Usage
//!
//! To use the obdphawd crate in your Rust project, add the following to your
//! Cargo.toml file:
//!
//! ```toml
//! [dependencies]
//! obdphawd = "0.1.0"
//! ```
//!
//! Then, in your Rust code, you can import the necessary modules and functions:
//!
//! ```rust
//! use obdphawd::{
//!     ObdDeviceManager, ObdRequest, DecodedValue, ObdError,
//!     Session, SessionConfig, init_logger, log_info,
//! };
//! ```

pub mod ble;
pub mod constants;
pub mod device_manager;
pub mod error;
pub mod isotp;
pub mod logging;
pub mod obd;
pub mod session;
pub mod transport;

pub use crate::error::{IsoTpError, ObdError, ProtocolError, TransportError};
pub use crate::logging::{init_logger, log_info};

// Core OBD types
pub use ble::central::{BleCentral, BleConfig};
pub use ble::device::{BleDevice, MacAddress};
pub use device_manager::ObdDeviceManager;
pub use obd::{decode_response, encode_request, DecodedValue, ObdRequest, Pid, Unit};
pub use session::{Session, SessionConfig};
pub use transport::{SerialTransport, Transport};

/// Crate version, from Cargo at build time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Scan for BLE OBD adapters.
///
/// # Arguments
/// * `duration` - How long to scan
///
/// # Returns
/// * `Ok(Vec<BleDevice>)` - Discovered adapters, strongest signal first
/// * `Err(ObdError)` - Adapter unavailable or scan failed
pub async fn scan(duration: std::time::Duration) -> Result<Vec<BleDevice>, ObdError> {
    let mut central = BleCentral::new(BleConfig::default()).await?;
    central.scan_collect(duration).await
}

/// Connect to a BLE OBD adapter and open a diagnostic session.
///
/// # Arguments
/// * `address` - MAC address of the adapter, from a previous scan
///
/// # Returns
/// * `Ok(Session)` - Ready session, dialect auto-detected
/// * `Err(ObdError)` - Connection or probe failed
pub async fn connect(address: MacAddress) -> Result<Session, ObdError> {
    let mut central = BleCentral::new(BleConfig::default()).await?;
    let transport = central.connect(address).await?;
    Session::connect(Box::new(transport), SessionConfig::default()).await
}

/// Connect to an adapter on a serial or rfcomm device node.
///
/// # Arguments
/// * `path` - Device path (e.g., "/dev/ttyUSB0", "/dev/rfcomm0")
///
/// # Returns
/// * `Ok(Session)` - Ready session, dialect auto-detected
/// * `Err(ObdError)` - Open or probe failed
pub async fn connect_serial(path: &str) -> Result<Session, ObdError> {
    let transport = SerialTransport::open(path).await?;
    Session::connect(Box::new(transport), SessionConfig::default()).await
}

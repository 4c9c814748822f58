//! The ble module implements the BLE central: device model and MAC
//! canonicalization, advertising-payload parsing, and the scanner plus
//! connection manager that yields a [`crate::transport::BleTransport`].

pub mod advertising;
pub mod central;
pub mod device;

pub use advertising::{AdFlags, Advertisement};
pub use central::{BleCentral, BleConfig, ScanAggregator};
pub use device::{BleDevice, MacAddress};

/// Lifecycle of one BLE connection. Owned by exactly one session while
/// `Ready`; ownership returns to the central on termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    Error,
}

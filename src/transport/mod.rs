//! The transport module defines the polymorphic byte channel used by a
//! session and its concrete variants: BLE GATT, serial (which also
//! covers Bluetooth Classic SPP via rfcomm device nodes), and an
//! in-memory mock for tests.

pub mod ble;
pub mod mock;
pub mod serial;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

pub use ble::BleTransport;
pub use mock::{MockHandle, MockTransport};
pub use serial::{SerialConfig, SerialTransport};

/// A byte channel to an OBD adapter. Ordering is preserved in both
/// directions; message boundaries are not guaranteed.
#[async_trait]
pub trait Transport: Send {
    /// Writes `data`, chunking to the MTU where the medium requires it.
    /// Blocks at most until peer flow control permits one MTU.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next inbound chunk. The stream is the "lazy
    /// sequence of bytes" of the transport contract: restartable after
    /// reconnect, ordered, unframed.
    async fn recv(&mut self) -> Result<Bytes, TransportError>;

    /// Closes the channel. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Largest single write the peer advertises (for BLE: ATT_MTU - 3).
    fn mtu(&self) -> usize;
}

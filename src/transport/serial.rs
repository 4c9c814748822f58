//! # Serial Transport
//!
//! Byte channel over a tty. This covers USB-serial ELM327 adapters and
//! Bluetooth Classic SPP dongles bound to an rfcomm device node, which
//! present the same byte-stream contract as BLE GATT.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

use crate::error::TransportError;
use crate::transport::Transport;

/// Configuration for the serial byte channel.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baudrate: u32,
    /// Reported MTU; serial links have no hard framing limit, so this
    /// only bounds write chunking.
    pub mtu: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            // ELM327 clones default to 38400.
            baudrate: 38_400,
            mtu: 256,
        }
    }
}

/// Transport over a tty or rfcomm device node.
pub struct SerialTransport {
    port: tokio_serial::SerialStream,
    config: SerialConfig,
    closed: bool,
}

impl SerialTransport {
    /// Opens `path` (e.g. `/dev/ttyUSB0`, `/dev/rfcomm0`).
    pub async fn open(path: &str) -> Result<Self, TransportError> {
        Self::open_with_config(path, SerialConfig::default()).await
    }

    pub async fn open_with_config(
        path: &str,
        config: SerialConfig,
    ) -> Result<Self, TransportError> {
        let port = tokio_serial::new(path, config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|e| TransportError::SerialPort(e.to_string()))?;
        debug!("serial transport open on {path} at {} baud", config.baudrate);
        Ok(SerialTransport {
            port,
            config,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.port
            .write_all(data)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.port
            .flush()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut buf = [0u8; 256];
        let n = self
            .port
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::SerialPort(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::LinkLost);
        }
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the stream closes the descriptor; the flag keeps the
        // call idempotent.
        self.closed = true;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }
}

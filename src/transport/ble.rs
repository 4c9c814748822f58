//! # BLE GATT Transport
//!
//! Byte channel over a connected GATT peripheral: `write` maps to
//! write-without-response on the RX characteristic, `recv` to
//! notifications on the TX characteristic. Writes larger than the
//! usable MTU are chunked here so the session never has to care.

use std::pin::Pin;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, trace};

use crate::constants::ATT_HEADER_LEN;
use crate::error::TransportError;
use crate::transport::Transport;

/// Transport over one GATT write/notify characteristic pair.
pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_uuid: uuid::Uuid,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    att_mtu: usize,
    closed: bool,
}

impl BleTransport {
    /// Builds the transport from an already-connected and subscribed
    /// peripheral. `att_mtu` is the negotiated ATT MTU; usable payload
    /// is three bytes less.
    pub(crate) fn new(
        peripheral: Peripheral,
        write_char: Characteristic,
        notify_uuid: uuid::Uuid,
        notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
        att_mtu: usize,
    ) -> Self {
        BleTransport {
            peripheral,
            write_char,
            notify_uuid,
            notifications,
            att_mtu,
            closed: false,
        }
    }

    /// MAC address of the connected peripheral.
    pub fn peer_address(&self) -> String {
        self.peripheral.address().to_string().to_uppercase()
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mtu = self.mtu();
        for chunk in data.chunks(mtu) {
            trace!("ble tx {} bytes", chunk.len());
            self.peripheral
                .write(&self.write_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        loop {
            match self.notifications.next().await {
                Some(notification) if notification.uuid == self.notify_uuid => {
                    trace!("ble rx {} bytes", notification.value.len());
                    return Ok(Bytes::from(notification.value));
                }
                // Notification from some other characteristic; not ours.
                Some(_) => continue,
                None => return Err(TransportError::LinkLost),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("ble transport closing");
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Bluetooth(e.to_string()))?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.att_mtu.saturating_sub(ATT_HEADER_LEN)
    }
}

//! # OBD Device Manager
//!
//! This module provides the ObdDeviceManager struct, which serves as the main
//! entry point for interacting with OBD-II adapters over BLE and serial links
//! using the obdphawd crate.
//!
//! The manager maintains one session per connected adapter, keyed by the BLE
//! MAC address or the serial device path, allowing the client to talk to
//! several vehicles or dongles concurrently.

use std::collections::HashMap;
use std::time::Duration;

use log::info;

use crate::ble::central::{BleCentral, BleConfig};
use crate::ble::device::{BleDevice, MacAddress};
use crate::error::{ObdError, TransportError};
use crate::obd::codec::DecodedValue;
use crate::session::{Session, SessionConfig};
use crate::transport::{SerialConfig, SerialTransport};

/// Represents a manager for handling OBD-II sessions over BLE and serial
/// transports.
pub struct ObdDeviceManager {
    /// Active sessions, keyed by MAC address or device path.
    sessions: HashMap<String, Session>,
    /// Lazily-opened BLE central, shared by all BLE connections.
    central: Option<BleCentral>,
    ble_config: BleConfig,
    session_config: SessionConfig,
}

impl ObdDeviceManager {
    /// Creates a new ObdDeviceManager instance with default configuration.
    pub fn new() -> Self {
        Self::with_config(BleConfig::default(), SessionConfig::default())
    }

    pub fn with_config(ble_config: BleConfig, session_config: SessionConfig) -> Self {
        ObdDeviceManager {
            sessions: HashMap::new(),
            central: None,
            ble_config,
            session_config,
        }
    }

    async fn central(&mut self) -> Result<&mut BleCentral, ObdError> {
        if self.central.is_none() {
            self.central = Some(BleCentral::new(self.ble_config.clone()).await?);
        }
        // The slot was just filled; absence here would be a logic error.
        self.central
            .as_mut()
            .ok_or_else(|| ObdError::BleDiscovery("adapter unavailable".into()))
    }

    /// Scans for BLE adapters, strongest signal first.
    pub async fn scan_ble(&mut self, duration: Duration) -> Result<Vec<BleDevice>, ObdError> {
        self.central().await?.scan_collect(duration).await
    }

    /// Connects to a BLE adapter and opens a session on it.
    pub async fn connect_ble(&mut self, address: MacAddress) -> Result<(), ObdError> {
        let session_config = self.session_config.clone();
        let transport = self.central().await?.connect(address).await?;
        let session = Session::connect(Box::new(transport), session_config).await?;
        info!("session open on {address}");
        self.sessions.insert(address.to_string(), session);
        Ok(())
    }

    /// Opens a session on a serial or rfcomm device node, e.g.
    /// `/dev/ttyUSB0` or `/dev/rfcomm0` for Bluetooth Classic SPP.
    pub async fn connect_serial(&mut self, path: &str) -> Result<(), ObdError> {
        let transport = SerialTransport::open_with_config(path, SerialConfig::default()).await?;
        let session = Session::connect(Box::new(transport), self.session_config.clone()).await?;
        info!("session open on {path}");
        self.sessions.insert(path.to_string(), session);
        Ok(())
    }

    fn session(&self, key: &str) -> Result<&Session, ObdError> {
        self.sessions
            .get(key)
            .ok_or(ObdError::Transport(TransportError::NotConnected))
    }

    /// Connection keys with open sessions.
    pub fn list_connections(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reads one Mode 0x01 PID on the named connection.
    pub async fn read_pid(&self, key: &str, pid: u8) -> Result<DecodedValue, ObdError> {
        self.session(key)?.read_pid(pid).await
    }

    /// Reads the vehicle identification number.
    pub async fn read_vin(&self, key: &str) -> Result<String, ObdError> {
        self.session(key)?.read_vin().await
    }

    /// Reads stored diagnostic trouble codes.
    pub async fn read_dtcs(&self, key: &str) -> Result<Vec<String>, ObdError> {
        self.session(key)?.read_dtcs().await
    }

    /// Clears trouble codes and stored freeze frames.
    pub async fn clear_dtcs(&self, key: &str) -> Result<(), ObdError> {
        self.session(key)?.clear_dtcs().await
    }

    /// Closes one session.
    pub async fn disconnect(&mut self, key: &str) -> Result<(), ObdError> {
        match self.sessions.remove(key) {
            Some(session) => {
                session.shutdown().await;
                if let Some(central) = self.central.as_mut() {
                    central.mark_disconnected();
                }
                Ok(())
            }
            None => Err(ObdError::Transport(TransportError::NotConnected)),
        }
    }

    /// Closes every open session.
    pub async fn disconnect_all(&mut self) {
        for (key, session) in self.sessions.drain() {
            info!("closing session on {key}");
            session.shutdown().await;
        }
        if let Some(central) = self.central.as_mut() {
            central.mark_disconnected();
        }
    }
}

impl Default for ObdDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_connection_reports_not_connected() {
        let mut manager = ObdDeviceManager::new();
        assert!(manager.list_connections().is_empty());

        let err = manager.read_pid("AA:BB:CC:DD:EE:FF", 0x0C).await.unwrap_err();
        assert!(matches!(
            err,
            ObdError::Transport(TransportError::NotConnected)
        ));

        let err = manager.disconnect("AA:BB:CC:DD:EE:FF").await.unwrap_err();
        assert!(matches!(
            err,
            ObdError::Transport(TransportError::NotConnected)
        ));
    }
}

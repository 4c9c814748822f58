//! BLE device model: canonical MAC addresses and scan results.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::constants::{AUTOMOTIVE_NAME_KEYWORDS, BLE_SERVICE_FFE0, BLE_SERVICE_FFF0};
use crate::error::ObdError;

/// A Bluetooth device address, canonicalized to uppercase
/// colon-separated hex (`XX:XX:XX:XX:XX:XX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for MacAddress {
    type Err = ObdError;

    /// Accepts colon- or dash-separated and bare 12-digit forms, any
    /// case. Canonicalization is idempotent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ObdError::InvalidInput(format!("bad MAC address {s:?}")));
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| ObdError::InvalidInput(format!("bad MAC address {s:?}")))?;
        }
        Ok(MacAddress(octets))
    }
}

/// One discovered BLE peripheral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: Option<String>,
    /// Strongest RSSI observed across all advertisements.
    pub rssi: Option<i16>,
    /// Non-connectable advertisers are surfaced to scans but rejected
    /// by connect.
    pub connectable: bool,
    pub services: Vec<Uuid>,
}

impl BleDevice {
    pub fn new(address: MacAddress) -> Self {
        BleDevice {
            address,
            name: None,
            rssi: None,
            connectable: true,
            services: Vec::new(),
        }
    }

    /// Heuristic from the known consumer-dongle name fragments and
    /// service UUIDs.
    pub fn looks_automotive(&self) -> bool {
        if let Some(name) = &self.name {
            let lower = name.to_lowercase();
            if AUTOMOTIVE_NAME_KEYWORDS.iter().any(|k| lower.contains(k)) {
                return true;
            }
        }
        self.services
            .iter()
            .any(|u| *u == BLE_SERVICE_FFF0 || *u == BLE_SERVICE_FFE0)
    }
}

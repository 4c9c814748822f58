//! # BLE Central
//!
//! Scanning and connection management on top of btleplug. Discovery
//! deduplicates advertisers by MAC address and keeps the strongest RSSI
//! seen; connecting retries with a fixed backoff schedule, resolves the
//! dongle's GATT serial service by priority, subscribes to its notify
//! characteristic, and hands back a ready [`BleTransport`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time;
use uuid::Uuid;

use crate::ble::device::{BleDevice, MacAddress};
use crate::ble::ConnectionState;
use crate::constants::{
    BLE_CONNECT_BACKOFF, BLE_DEFAULT_MTU, BLE_SERVICE_FFE0, BLE_SERVICE_FFF0, BLE_SERVICE_NUS,
};
use crate::error::{ObdError, TransportError};
use crate::transport::BleTransport;

/// Configuration for scanning and connecting.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// GATT service to try first, ahead of the built-in priority list.
    pub service_uuid: Option<Uuid>,
    /// Assumed ATT MTU. btleplug exposes no MTU exchange, so this is a
    /// configuration knob rather than a negotiated value.
    pub att_mtu: usize,
    /// Connect retries after the initial attempt.
    pub connect_retries: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        BleConfig {
            service_uuid: None,
            att_mtu: BLE_DEFAULT_MTU,
            connect_retries: BLE_CONNECT_BACKOFF.len(),
        }
    }
}

/// Merges advertising observations into one entry per MAC address.
#[derive(Debug, Default)]
pub struct ScanAggregator {
    devices: HashMap<MacAddress, BleDevice>,
}

impl ScanAggregator {
    pub fn new() -> Self {
        ScanAggregator::default()
    }

    /// Folds one observation in. Returns a snapshot of the device if
    /// this address was newly seen, `None` for repeat advertisers.
    pub fn observe(&mut self, observed: BleDevice) -> Option<BleDevice> {
        use std::collections::hash_map::Entry;
        match self.devices.entry(observed.address) {
            Entry::Vacant(slot) => Some(slot.insert(observed).clone()),
            Entry::Occupied(mut slot) => {
                let known = slot.get_mut();
                if observed.name.is_some() {
                    known.name = observed.name;
                }
                known.rssi = match (known.rssi, observed.rssi) {
                    (Some(old), Some(new)) => Some(old.max(new)),
                    (old, new) => new.or(old),
                };
                for service in observed.services {
                    if !known.services.contains(&service) {
                        known.services.push(service);
                    }
                }
                known.connectable = observed.connectable;
                None
            }
        }
    }

    pub fn get(&self, address: &MacAddress) -> Option<&BleDevice> {
        self.devices.get(address)
    }

    /// All devices seen so far, strongest signal first.
    pub fn devices(&self) -> Vec<BleDevice> {
        let mut all: Vec<BleDevice> = self.devices.values().cloned().collect();
        all.sort_by(|a, b| b.rssi.cmp(&a.rssi).then(a.address.cmp(&b.address)));
        all
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Picks the write/notify characteristic pair for the serial service,
/// trying `preferred` first and then the known dongle services in
/// priority order. A single characteristic may serve both roles.
pub fn resolve_gatt(
    characteristics: &[Characteristic],
    preferred: Option<Uuid>,
) -> Option<(Characteristic, Characteristic)> {
    let priority = preferred
        .into_iter()
        .chain([BLE_SERVICE_FFF0, BLE_SERVICE_FFE0, BLE_SERVICE_NUS]);
    for service in priority {
        let in_service: Vec<&Characteristic> = characteristics
            .iter()
            .filter(|c| c.service_uuid == service)
            .collect();
        if in_service.is_empty() {
            continue;
        }
        let write = in_service.iter().find(|c| {
            c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
                || c.properties.contains(CharPropFlags::WRITE)
        });
        let notify = in_service.iter().find(|c| {
            c.properties.contains(CharPropFlags::NOTIFY)
                || c.properties.contains(CharPropFlags::INDICATE)
        });
        if let (Some(write), Some(notify)) = (write, notify) {
            return Some(((*write).clone(), (*notify).clone()));
        }
    }
    None
}

/// The BLE central: wraps the first system adapter.
pub struct BleCentral {
    adapter: Adapter,
    config: BleConfig,
    state: ConnectionState,
    seen: Arc<Mutex<ScanAggregator>>,
}

fn ble_err(e: btleplug::Error) -> ObdError {
    TransportError::Bluetooth(e.to_string()).into()
}

impl BleCentral {
    /// Opens the first Bluetooth adapter on the system.
    pub async fn new(config: BleConfig) -> Result<Self, ObdError> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| ObdError::BleDiscovery("no Bluetooth adapter found".into()))?;
        debug!("ble central using first system adapter");
        Ok(BleCentral {
            adapter,
            config,
            state: ConnectionState::Disconnected,
            seen: Arc::new(Mutex::new(ScanAggregator::new())),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Scans for `duration`, streaming each newly-seen device as it is
    /// first observed. Repeat advertisements update the aggregator but
    /// are not re-sent. The channel closes when the scan window ends.
    pub async fn scan(
        &mut self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<BleDevice>, ObdError> {
        self.state = ConnectionState::Scanning;
        let mut events = self.adapter.events().await.map_err(ble_err)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;
        info!("ble scan started for {duration:?}");

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        let seen = Arc::clone(&self.seen);
        tokio::spawn(async move {
            let deadline = time::Instant::now() + duration;
            loop {
                let event = tokio::select! {
                    _ = time::sleep_until(deadline) => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Ok(address) = props.address.to_string().parse::<MacAddress>() else {
                    continue;
                };
                let mut device = BleDevice::new(address);
                device.name = props.local_name;
                device.rssi = props.rssi;
                device.services = props.services;
                let newly_seen = {
                    let mut agg = seen.lock().unwrap_or_else(|p| p.into_inner());
                    agg.observe(device)
                };
                if let Some(device) = newly_seen {
                    debug!(
                        "ble discovered {} ({}) rssi {:?}",
                        device.address,
                        device.name.as_deref().unwrap_or("unknown"),
                        device.rssi
                    );
                    if tx.send(device).await.is_err() {
                        break;
                    }
                }
            }
            if let Err(e) = adapter.stop_scan().await {
                warn!("ble stop_scan failed: {e}");
            }
        });
        Ok(rx)
    }

    /// Scans for `duration` and returns the full device list, strongest
    /// signal first.
    pub async fn scan_collect(&mut self, duration: Duration) -> Result<Vec<BleDevice>, ObdError> {
        let mut stream = self.scan(duration).await?;
        while stream.recv().await.is_some() {}
        self.state = ConnectionState::Disconnected;
        let devices = {
            let agg = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            agg.devices()
        };
        info!("ble scan finished: {} device(s)", devices.len());
        Ok(devices)
    }

    /// Connects to `address` and resolves its GATT serial service into a
    /// ready transport. Retries failed connection attempts on the
    /// 200/600/1800 ms backoff schedule.
    pub async fn connect(&mut self, address: MacAddress) -> Result<BleTransport, ObdError> {
        if let Some(device) = self
            .seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&address)
        {
            if !device.connectable {
                return Err(ObdError::BleDiscovery(format!(
                    "{address} is not connectable"
                )));
            }
        }

        self.state = ConnectionState::Connecting;
        let peripheral = self.find_peripheral(address).await?;

        let mut attempt = 0usize;
        loop {
            match peripheral.connect().await {
                Ok(()) => break,
                Err(e) => {
                    if attempt >= self.config.connect_retries {
                        self.state = ConnectionState::Error;
                        return Err(TransportError::Bluetooth(format!(
                            "connect to {address} failed after {attempt} retries: {e}"
                        ))
                        .into());
                    }
                    let backoff = BLE_CONNECT_BACKOFF
                        [attempt.min(BLE_CONNECT_BACKOFF.len() - 1)];
                    warn!("connect to {address} failed ({e}), retrying in {backoff:?}");
                    time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
        info!("connected to {address}");

        self.state = ConnectionState::Discovering;
        peripheral.discover_services().await.map_err(ble_err)?;
        let characteristics: Vec<Characteristic> =
            peripheral.characteristics().into_iter().collect();
        let Some((write_char, notify_char)) =
            resolve_gatt(&characteristics, self.config.service_uuid)
        else {
            let _ = peripheral.disconnect().await;
            self.state = ConnectionState::Error;
            return Err(ObdError::BleDiscovery(format!(
                "{address} exposes no known serial service"
            )));
        };
        debug!(
            "resolved gatt pair: write {} notify {}",
            write_char.uuid, notify_char.uuid
        );

        peripheral.subscribe(&notify_char).await.map_err(ble_err)?;
        let notifications = peripheral.notifications().await.map_err(ble_err)?;
        self.state = ConnectionState::Ready;
        info!("ble link to {address} ready");
        Ok(BleTransport::new(
            peripheral,
            write_char,
            notify_char.uuid,
            notifications,
            self.config.att_mtu,
        ))
    }

    /// Records that the session released the link.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    async fn find_peripheral(&self, address: MacAddress) -> Result<Peripheral, ObdError> {
        let peripherals = self.adapter.peripherals().await.map_err(ble_err)?;
        for peripheral in peripherals {
            let matches = peripheral
                .address()
                .to_string()
                .parse::<MacAddress>()
                .map(|mac| mac == address)
                .unwrap_or(false);
            if matches {
                return Ok(peripheral);
            }
        }
        Err(ObdError::BleDiscovery(format!(
            "{address} not found; scan first"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BLE_CHAR_FFE1, BLE_CHAR_FFF1, BLE_CHAR_FFF2, BLE_CHAR_NUS_RX, BLE_CHAR_NUS_TX};
    use std::collections::BTreeSet;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn device(addr: &str, name: Option<&str>, rssi: Option<i16>) -> BleDevice {
        let mut d = BleDevice::new(mac(addr));
        d.name = name.map(String::from);
        d.rssi = rssi;
        d
    }

    fn ch(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: service,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    #[test]
    fn aggregator_reports_only_newly_seen() {
        let mut agg = ScanAggregator::new();
        assert!(agg
            .observe(device("00:11:22:33:44:55", Some("OBDII"), Some(-70)))
            .is_some());
        assert!(agg
            .observe(device("00:11:22:33:44:55", None, Some(-60)))
            .is_none());
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn aggregator_keeps_strongest_rssi_and_best_name() {
        let mut agg = ScanAggregator::new();
        agg.observe(device("00:11:22:33:44:55", None, Some(-80)));
        agg.observe(device("00:11:22:33:44:55", Some("VLink"), Some(-55)));
        agg.observe(device("00:11:22:33:44:55", None, Some(-90)));
        let d = agg.get(&mac("00:11:22:33:44:55")).unwrap();
        assert_eq!(d.rssi, Some(-55));
        assert_eq!(d.name.as_deref(), Some("VLink"));
    }

    #[test]
    fn devices_sorted_strongest_first() {
        let mut agg = ScanAggregator::new();
        agg.observe(device("00:00:00:00:00:01", None, Some(-90)));
        agg.observe(device("00:00:00:00:00:02", None, Some(-40)));
        agg.observe(device("00:00:00:00:00:03", None, None));
        let all = agg.devices();
        assert_eq!(all[0].address, mac("00:00:00:00:00:02"));
        assert_eq!(all[1].address, mac("00:00:00:00:00:01"));
        assert_eq!(all[2].rssi, None);
    }

    #[test]
    fn resolve_prefers_fff0_over_nus() {
        let chars = vec![
            ch(BLE_SERVICE_NUS, BLE_CHAR_NUS_RX, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            ch(BLE_SERVICE_NUS, BLE_CHAR_NUS_TX, CharPropFlags::NOTIFY),
            ch(BLE_SERVICE_FFF0, BLE_CHAR_FFF1, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            ch(BLE_SERVICE_FFF0, BLE_CHAR_FFF2, CharPropFlags::NOTIFY),
        ];
        let (write, notify) = resolve_gatt(&chars, None).unwrap();
        assert_eq!(write.uuid, BLE_CHAR_FFF1);
        assert_eq!(notify.uuid, BLE_CHAR_FFF2);
    }

    #[test]
    fn resolve_honors_configured_service_first() {
        let chars = vec![
            ch(BLE_SERVICE_FFF0, BLE_CHAR_FFF1, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            ch(BLE_SERVICE_FFF0, BLE_CHAR_FFF2, CharPropFlags::NOTIFY),
            ch(BLE_SERVICE_NUS, BLE_CHAR_NUS_RX, CharPropFlags::WRITE),
            ch(BLE_SERVICE_NUS, BLE_CHAR_NUS_TX, CharPropFlags::INDICATE),
        ];
        let (write, notify) = resolve_gatt(&chars, Some(BLE_SERVICE_NUS)).unwrap();
        assert_eq!(write.uuid, BLE_CHAR_NUS_RX);
        assert_eq!(notify.uuid, BLE_CHAR_NUS_TX);
    }

    #[test]
    fn resolve_accepts_combined_write_notify_characteristic() {
        let chars = vec![ch(
            BLE_SERVICE_FFE0,
            BLE_CHAR_FFE1,
            CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY,
        )];
        let (write, notify) = resolve_gatt(&chars, None).unwrap();
        assert_eq!(write.uuid, BLE_CHAR_FFE1);
        assert_eq!(notify.uuid, BLE_CHAR_FFE1);
    }

    #[test]
    fn resolve_fails_without_known_service() {
        let unknown = Uuid::from_u128(0x1234);
        let chars = vec![ch(unknown, Uuid::from_u128(0x5678), CharPropFlags::WRITE)];
        assert!(resolve_gatt(&chars, None).is_none());
    }
}

//! # Advertising Payload Parser
//!
//! Decodes BLE advertising data (AD structures per Bluetooth Core 5.x):
//! a sequence of `[length, type, data...]` records. Only the types the
//! scanner cares about are extracted: Flags (0x01), the service UUID
//! lists (0x02-0x07), local names (0x08/0x09), and TX power (0x0A).

use bitflags::bitflags;
use uuid::Uuid;

bitflags! {
    /// AD type 0x01.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdFlags: u8 {
        const LE_LIMITED_DISCOVERABLE = 0x01;
        const LE_GENERAL_DISCOVERABLE = 0x02;
        const BR_EDR_NOT_SUPPORTED = 0x04;
        const SIMULTANEOUS_LE_BR_EDR_CONTROLLER = 0x08;
        const SIMULTANEOUS_LE_BR_EDR_HOST = 0x10;
    }
}

/// Parsed advertising payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advertisement {
    pub flags: Option<AdFlags>,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub tx_power: Option<i8>,
}

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
const AD_TYPE_UUID32_INCOMPLETE: u8 = 0x04;
const AD_TYPE_UUID32_COMPLETE: u8 = 0x05;
const AD_TYPE_UUID128_INCOMPLETE: u8 = 0x06;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
const AD_TYPE_NAME_SHORTENED: u8 = 0x08;
const AD_TYPE_NAME_COMPLETE: u8 = 0x09;
const AD_TYPE_TX_POWER: u8 = 0x0A;

/// Expands a 16-bit SIG-assigned UUID to its 128-bit form.
fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | (u128::from(short) << 96))
}

fn uuid32(short: u32) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | (u128::from(short) << 96))
}

impl Advertisement {
    /// Parses a raw advertising payload. Truncated or malformed records
    /// end parsing; everything decoded up to that point is kept.
    pub fn parse(data: &[u8]) -> Advertisement {
        let mut ad = Advertisement::default();
        let mut rest = data;
        while let [len, tail @ ..] = rest {
            let len = *len as usize;
            if len == 0 || len > tail.len() {
                break;
            }
            let (record, next) = tail.split_at(len);
            let (ad_type, payload) = (record[0], &record[1..]);
            ad.apply(ad_type, payload);
            rest = next;
        }
        ad
    }

    fn apply(&mut self, ad_type: u8, payload: &[u8]) {
        match ad_type {
            AD_TYPE_FLAGS => {
                if let Some(&bits) = payload.first() {
                    self.flags = Some(AdFlags::from_bits_truncate(bits));
                }
            }
            AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                for pair in payload.chunks_exact(2) {
                    self.service_uuids
                        .push(uuid16(u16::from_le_bytes([pair[0], pair[1]])));
                }
            }
            AD_TYPE_UUID32_INCOMPLETE | AD_TYPE_UUID32_COMPLETE => {
                for quad in payload.chunks_exact(4) {
                    self.service_uuids.push(uuid32(u32::from_le_bytes([
                        quad[0], quad[1], quad[2], quad[3],
                    ])));
                }
            }
            AD_TYPE_UUID128_INCOMPLETE | AD_TYPE_UUID128_COMPLETE => {
                for raw in payload.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(raw);
                    // 128-bit UUIDs are advertised little-endian.
                    bytes.reverse();
                    self.service_uuids.push(Uuid::from_bytes(bytes));
                }
            }
            AD_TYPE_NAME_SHORTENED => {
                if self.local_name.is_none() {
                    self.local_name = Some(String::from_utf8_lossy(payload).into_owned());
                }
            }
            AD_TYPE_NAME_COMPLETE => {
                self.local_name = Some(String::from_utf8_lossy(payload).into_owned());
            }
            AD_TYPE_TX_POWER => {
                if let Some(&power) = payload.first() {
                    self.tx_power = Some(power as i8);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_name_and_uuid16() {
        // Flags: LE general discoverable; complete name "OBDII";
        // complete 16-bit service list with 0xFFF0.
        let payload = [
            0x02, 0x01, 0x06, // flags
            0x06, 0x09, b'O', b'B', b'D', b'I', b'I', // name
            0x03, 0x03, 0xF0, 0xFF, // uuid16 list
        ];
        let ad = Advertisement::parse(&payload);
        assert_eq!(
            ad.flags,
            Some(AdFlags::LE_GENERAL_DISCOVERABLE | AdFlags::BR_EDR_NOT_SUPPORTED)
        );
        assert_eq!(ad.local_name.as_deref(), Some("OBDII"));
        assert_eq!(ad.service_uuids, vec![crate::constants::BLE_SERVICE_FFF0]);
    }

    #[test]
    fn parses_128bit_uuid() {
        let nus = crate::constants::BLE_SERVICE_NUS;
        let mut le = *nus.as_bytes();
        le.reverse();
        let mut payload = vec![0x11, 0x07];
        payload.extend_from_slice(&le);
        let ad = Advertisement::parse(&payload);
        assert_eq!(ad.service_uuids, vec![nus]);
    }

    #[test]
    fn complete_name_wins_over_shortened() {
        let payload = [
            0x03, 0x08, b'O', b'B', // shortened
            0x06, 0x09, b'O', b'B', b'D', b'I', b'I', // complete
        ];
        let ad = Advertisement::parse(&payload);
        assert_eq!(ad.local_name.as_deref(), Some("OBDII"));
    }

    #[test]
    fn truncated_record_stops_cleanly() {
        let payload = [0x02, 0x01, 0x06, 0x09, 0x09, b'X'];
        let ad = Advertisement::parse(&payload);
        assert!(ad.flags.is_some());
        assert_eq!(ad.local_name, None);
    }

    #[test]
    fn tx_power_is_signed() {
        let ad = Advertisement::parse(&[0x02, 0x0A, 0xF4]);
        assert_eq!(ad.tx_power, Some(-12));
    }
}

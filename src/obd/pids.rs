//! # J1979 PID Formula Table
//!
//! Table-driven decoders for Mode 0x01 (and freeze-frame Mode 0x02)
//! parameters. Each entry carries the expected data length and the
//! conversion formula from SAE J1979, e.g. engine RPM `(256*A + B) / 4`.

use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::obd::codec::{DecodedValue, Unit};

/// One row of the formula table.
pub struct PidDescriptor {
    pub pid: u8,
    pub description: &'static str,
    /// Data bytes the formula consumes (after the PID echo).
    pub data_len: usize,
    pub decode: fn(&[u8]) -> DecodedValue,
}

bitflags! {
    /// Continuous-monitor readiness bits from Mode 0x01 PID 0x01 byte B.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct ReadinessFlags: u8 {
        const MISFIRE_AVAILABLE = 0x01;
        const FUEL_SYSTEM_AVAILABLE = 0x02;
        const COMPONENTS_AVAILABLE = 0x04;
        const MISFIRE_INCOMPLETE = 0x10;
        const FUEL_SYSTEM_INCOMPLETE = 0x20;
        const COMPONENTS_INCOMPLETE = 0x40;
    }
}

/// Decoded monitor status (Mode 0x01 PID 0x01).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    /// Malfunction indicator lamp commanded on.
    pub mil: bool,
    /// Number of confirmed emissions-related DTCs.
    pub dtc_count: u8,
    pub readiness: ReadinessFlags,
}

fn numeric(value: f64, unit: Unit) -> DecodedValue {
    DecodedValue::Numeric { value, unit }
}

fn percent_a(d: &[u8]) -> DecodedValue {
    numeric(f64::from(d[0]) * 100.0 / 255.0, Unit::Percent)
}

fn temp_a_minus_40(d: &[u8]) -> DecodedValue {
    numeric(f64::from(d[0]) - 40.0, Unit::Celsius)
}

fn fuel_trim(d: &[u8]) -> DecodedValue {
    numeric((f64::from(d[0]) - 128.0) * 100.0 / 128.0, Unit::Percent)
}

fn monitor_status(d: &[u8]) -> DecodedValue {
    DecodedValue::Monitor(MonitorStatus {
        mil: d[0] & 0x80 != 0,
        dtc_count: d[0] & 0x7F,
        readiness: ReadinessFlags::from_bits_truncate(d[1] & 0x77),
    })
}

fn fuel_system_status(d: &[u8]) -> DecodedValue {
    let code = d[0];
    let name = match code {
        0x01 => "open loop, insufficient engine temperature",
        0x02 => "closed loop, using oxygen sensor",
        0x04 => "open loop, engine load or fuel cut",
        0x08 => "open loop, system failure",
        0x10 => "closed loop, oxygen sensor fault",
        _ => "unknown fuel system status",
    };
    DecodedValue::Enumerated { code, name }
}

static PID_TABLE: Lazy<HashMap<u8, PidDescriptor>> = Lazy::new(|| {
    let rows: Vec<PidDescriptor> = vec![
        PidDescriptor {
            pid: 0x01,
            description: "Monitor status since DTCs cleared",
            data_len: 4,
            decode: monitor_status,
        },
        PidDescriptor {
            pid: 0x03,
            description: "Fuel system status",
            data_len: 2,
            decode: fuel_system_status,
        },
        PidDescriptor {
            pid: 0x04,
            description: "Calculated engine load",
            data_len: 1,
            decode: percent_a,
        },
        PidDescriptor {
            pid: 0x05,
            description: "Engine coolant temperature",
            data_len: 1,
            decode: temp_a_minus_40,
        },
        PidDescriptor {
            pid: 0x06,
            description: "Short term fuel trim, bank 1",
            data_len: 1,
            decode: fuel_trim,
        },
        PidDescriptor {
            pid: 0x07,
            description: "Long term fuel trim, bank 1",
            data_len: 1,
            decode: fuel_trim,
        },
        PidDescriptor {
            pid: 0x08,
            description: "Short term fuel trim, bank 2",
            data_len: 1,
            decode: fuel_trim,
        },
        PidDescriptor {
            pid: 0x09,
            description: "Long term fuel trim, bank 2",
            data_len: 1,
            decode: fuel_trim,
        },
        PidDescriptor {
            pid: 0x0A,
            description: "Fuel pressure",
            data_len: 1,
            decode: |d| numeric(f64::from(d[0]) * 3.0, Unit::KiloPascal),
        },
        PidDescriptor {
            pid: 0x0B,
            description: "Intake manifold absolute pressure",
            data_len: 1,
            decode: |d| numeric(f64::from(d[0]), Unit::KiloPascal),
        },
        PidDescriptor {
            pid: 0x0C,
            description: "Engine RPM",
            data_len: 2,
            decode: |d| {
                numeric(
                    (f64::from(d[0]) * 256.0 + f64::from(d[1])) / 4.0,
                    Unit::Rpm,
                )
            },
        },
        PidDescriptor {
            pid: 0x0D,
            description: "Vehicle speed",
            data_len: 1,
            decode: |d| numeric(f64::from(d[0]), Unit::Kph),
        },
        PidDescriptor {
            pid: 0x0E,
            description: "Timing advance",
            data_len: 1,
            decode: |d| numeric((f64::from(d[0]) - 128.0) / 2.0, Unit::Degrees),
        },
        PidDescriptor {
            pid: 0x0F,
            description: "Intake air temperature",
            data_len: 1,
            decode: temp_a_minus_40,
        },
        PidDescriptor {
            pid: 0x10,
            description: "MAF air flow rate",
            data_len: 2,
            decode: |d| {
                numeric(
                    (f64::from(d[0]) * 256.0 + f64::from(d[1])) / 100.0,
                    Unit::GramsPerSecond,
                )
            },
        },
        PidDescriptor {
            pid: 0x11,
            description: "Throttle position",
            data_len: 1,
            decode: percent_a,
        },
        PidDescriptor {
            pid: 0x1F,
            description: "Run time since engine start",
            data_len: 2,
            decode: |d| {
                numeric(f64::from(d[0]) * 256.0 + f64::from(d[1]), Unit::Seconds)
            },
        },
        PidDescriptor {
            pid: 0x21,
            description: "Distance traveled with MIL on",
            data_len: 2,
            decode: |d| {
                numeric(f64::from(d[0]) * 256.0 + f64::from(d[1]), Unit::Kilometers)
            },
        },
        PidDescriptor {
            pid: 0x2F,
            description: "Fuel tank level input",
            data_len: 1,
            decode: percent_a,
        },
        PidDescriptor {
            pid: 0x33,
            description: "Absolute barometric pressure",
            data_len: 1,
            decode: |d| numeric(f64::from(d[0]), Unit::KiloPascal),
        },
        PidDescriptor {
            pid: 0x42,
            description: "Control module voltage",
            data_len: 2,
            decode: |d| {
                numeric(
                    (f64::from(d[0]) * 256.0 + f64::from(d[1])) / 1000.0,
                    Unit::Volts,
                )
            },
        },
        PidDescriptor {
            pid: 0x46,
            description: "Ambient air temperature",
            data_len: 1,
            decode: temp_a_minus_40,
        },
        PidDescriptor {
            pid: 0x5C,
            description: "Engine oil temperature",
            data_len: 1,
            decode: temp_a_minus_40,
        },
    ];
    rows.into_iter().map(|r| (r.pid, r)).collect()
});

/// Looks up the formula-table row for a Mode 0x01 PID.
pub fn pid_descriptor(pid: u8) -> Option<&'static PidDescriptor> {
    PID_TABLE.get(&pid)
}

/// Expands a PID-support bitmap (PIDs 0x00, 0x20, 0x40, ...) into the list
/// of PIDs it declares supported. Bit 31 of the 32-bit mask corresponds to
/// `base + 1`. Bits that would name a PID past 0xFF (possible for base
/// 0xE0) are dropped rather than wrapped.
pub fn supported_pids_from_bitmap(base: u8, bytes: [u8; 4]) -> Vec<u8> {
    let bitmap = u32::from_be_bytes(bytes);
    (0..32u16)
        .filter(|i| bitmap & (1 << (31 - i)) != 0)
        .filter_map(|i| u8::try_from(u16::from(base) + i + 1).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_formula() {
        let desc = pid_descriptor(0x0C).unwrap();
        let value = (desc.decode)(&[0x1A, 0xF8]);
        assert_eq!(
            value,
            DecodedValue::Numeric {
                value: 1726.0,
                unit: Unit::Rpm
            }
        );
    }

    #[test]
    fn coolant_formula() {
        let desc = pid_descriptor(0x05).unwrap();
        let value = (desc.decode)(&[0x7B]);
        assert_eq!(
            value,
            DecodedValue::Numeric {
                value: 83.0,
                unit: Unit::Celsius
            }
        );
    }

    #[test]
    fn support_bitmap_expands_to_pids() {
        // Bit 31 set -> PID 0x01 supported; bit 20 set -> PID 0x0C.
        let bytes = 0x8010_0000u32.to_be_bytes();
        let pids = supported_pids_from_bitmap(0x00, bytes);
        assert_eq!(pids, vec![0x01, 0x0C]);
    }

    #[test]
    fn monitor_status_mil_and_count() {
        let value = monitor_status(&[0x83, 0x07, 0x00, 0x00]);
        match value {
            DecodedValue::Monitor(status) => {
                assert!(status.mil);
                assert_eq!(status.dtc_count, 3);
                assert!(status.readiness.contains(ReadinessFlags::MISFIRE_AVAILABLE));
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}

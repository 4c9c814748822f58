//! OBD-II Protocol Constants
//!
//! This module defines constants used across the crate: SAE J1979 service
//! identifiers, ISO 15765-2 framing values and timers, CAN identifiers for
//! normal and extended addressing, ELM327 command strings and reply tokens,
//! and the GATT UUIDs targeted by the BLE central.

use std::time::Duration;

// ----------------------------------------------------------------------------
// SAE J1979 services
// ----------------------------------------------------------------------------

/// Service 0x01: show current data
pub const OBD_SERVICE_CURRENT_DATA: u8 = 0x01;
/// Service 0x02: show freeze frame data
pub const OBD_SERVICE_FREEZE_FRAME: u8 = 0x02;
/// Service 0x03: show stored diagnostic trouble codes
pub const OBD_SERVICE_STORED_DTCS: u8 = 0x03;
/// Service 0x04: clear trouble codes and stored values
pub const OBD_SERVICE_CLEAR_DTCS: u8 = 0x04;
/// Service 0x07: show pending diagnostic trouble codes
pub const OBD_SERVICE_PENDING_DTCS: u8 = 0x07;
/// Service 0x09: request vehicle information
pub const OBD_SERVICE_VEHICLE_INFO: u8 = 0x09;
/// Service 0x0A: show permanent diagnostic trouble codes
pub const OBD_SERVICE_PERMANENT_DTCS: u8 = 0x0A;

/// A positive response echoes the request service with this bit set.
pub const OBD_POSITIVE_RESPONSE_FLAG: u8 = 0x40;
/// First byte of every negative response.
pub const OBD_NEGATIVE_RESPONSE: u8 = 0x7F;

/// Mode 0x09 PID for the vehicle identification number.
pub const OBD_PID_VIN: u8 = 0x02;

/// NRC 0x78: the ECU needs more time; the request stays in flight.
pub const NRC_RESPONSE_PENDING: u8 = 0x78;

// ----------------------------------------------------------------------------
// CAN identifiers (ISO 15765-4)
// ----------------------------------------------------------------------------

/// First 11-bit physical response identifier (ECU #1).
pub const CAN_ID_RESPONSE_11BIT_BASE: u32 = 0x7E8;
/// Last 11-bit physical response identifier (ECU #8).
pub const CAN_ID_RESPONSE_11BIT_MAX: u32 = 0x7EF;

/// 29-bit physical response prefix; low byte carries the ECU address.
pub const CAN_ID_RESPONSE_29BIT_PREFIX: u32 = 0x18DA_F100;

// ----------------------------------------------------------------------------
// ISO 15765-2 (ISO-TP)
// ----------------------------------------------------------------------------

/// PCI high-nibble values.
pub const ISOTP_PCI_SINGLE: u8 = 0x0;
pub const ISOTP_PCI_FIRST: u8 = 0x1;
pub const ISOTP_PCI_CONSECUTIVE: u8 = 0x2;
pub const ISOTP_PCI_FLOW_CONTROL: u8 = 0x3;

/// Largest classical ISO-TP message.
pub const ISOTP_MAX_MESSAGE_LEN: usize = 4095;
/// Payload bytes available in a single frame with normal addressing.
pub const ISOTP_SF_MAX_NORMAL: usize = 7;
/// Payload bytes available in a single frame with extended addressing.
pub const ISOTP_SF_MAX_EXTENDED: usize = 6;
/// Payload bytes carried by a first frame (classical CAN).
pub const ISOTP_FF_PAYLOAD: usize = 6;
/// Payload bytes carried by each consecutive frame (classical CAN).
pub const ISOTP_CF_PAYLOAD: usize = 7;
/// Classical CAN frame size.
pub const ISOTP_FRAME_LEN: usize = 8;

/// Consecutive frame sequence numbers wrap after this value.
pub const ISOTP_SEQ_MAX: u8 = 0x0F;

/// N_Bs: sender waiting for a flow control frame.
pub const ISOTP_N_BS: Duration = Duration::from_millis(1000);
/// N_Cr: receiver waiting for the next consecutive frame.
pub const ISOTP_N_CR: Duration = Duration::from_millis(1000);

/// Flow control wait frames tolerated before aborting.
pub const ISOTP_MAX_FC_WAITS: u8 = 2;

// ----------------------------------------------------------------------------
// Session defaults
// ----------------------------------------------------------------------------

/// Default per-request deadline (common OBD-II practice).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);
/// Unmatched inbound messages are discarded after this grace period.
pub const UNMATCHED_MESSAGE_GRACE: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// ELM327 line protocol
// ----------------------------------------------------------------------------

/// Reset command; an ASCII banner in reply means the peer is an ELM dongle.
pub const ELM_CMD_RESET: &str = "ATZ";
/// Setup sequence issued after a successful probe.
pub const ELM_INIT_SEQUENCE: &[&str] = &["ATE0", "ATL0", "ATS0", "ATH1", "ATSP0"];
/// Prompt byte signalling the adapter is ready for the next command.
pub const ELM_PROMPT: u8 = b'>';

/// Reply token: the vehicle did not answer.
pub const ELM_TOKEN_NO_DATA: &str = "NO DATA";
/// Reply token: command not understood.
pub const ELM_TOKEN_SYNTAX: &str = "?";
/// Reply token: request aborted by the adapter.
pub const ELM_TOKEN_STOPPED: &str = "STOPPED";
/// Reply token: CAN-level failure.
pub const ELM_TOKEN_CAN_ERROR: &str = "CAN ERROR";
/// Reply token: adapter/vehicle bus failure.
pub const ELM_TOKEN_BUS_ERROR: &str = "BUS ERROR";
/// Reply token after AT commands.
pub const ELM_TOKEN_OK: &str = "OK";

// ----------------------------------------------------------------------------
// BLE GATT surface
// ----------------------------------------------------------------------------

/// Vendor serial service used by most consumer OBD dongles (16-bit 0xFFF0).
pub const BLE_SERVICE_FFF0: uuid::Uuid = uuid::Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Write characteristic within 0xFFF0 dongles.
pub const BLE_CHAR_FFF1: uuid::Uuid = uuid::Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
/// Notify characteristic within 0xFFF0 dongles.
pub const BLE_CHAR_FFF2: uuid::Uuid = uuid::Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// Second vendor serial service seen in the wild (16-bit 0xFFE0).
pub const BLE_SERVICE_FFE0: uuid::Uuid = uuid::Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Combined write/notify characteristic within 0xFFE0 dongles.
pub const BLE_CHAR_FFE1: uuid::Uuid = uuid::Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Nordic UART Service.
pub const BLE_SERVICE_NUS: uuid::Uuid = uuid::Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS RX characteristic (central writes here).
pub const BLE_CHAR_NUS_RX: uuid::Uuid = uuid::Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS TX characteristic (central subscribes here).
pub const BLE_CHAR_NUS_TX: uuid::Uuid = uuid::Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Target ATT MTU requested on connect.
pub const BLE_DEFAULT_MTU: usize = 247;
/// ATT write overhead: usable payload is MTU minus this.
pub const ATT_HEADER_LEN: usize = 3;

/// Connect retry backoff schedule.
pub const BLE_CONNECT_BACKOFF: &[Duration] = &[
    Duration::from_millis(200),
    Duration::from_millis(600),
    Duration::from_millis(1800),
];

/// Device-name fragments that identify consumer OBD adapters.
pub const AUTOMOTIVE_NAME_KEYWORDS: &[&str] = &[
    "obd", "elm", "vlink", "obdii", "obdlink", "scantool", "veepeak", "bafx",
    "foseal", "panlong", "konnwei",
];

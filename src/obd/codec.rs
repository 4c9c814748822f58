//! # OBD-II Request/Response Codec
//!
//! Pure functions that serialize Service/PID requests and decode response
//! payloads to typed values via the J1979 formula table in [`crate::obd::pids`].
//!
//! The codec never performs I/O. Negative responses (first byte 0x7F) are
//! detected by [`negative_response`] and must not be handed to a PID
//! decoder; the session surfaces them as protocol-level failures.

use serde::Serialize;

use crate::constants::{
    OBD_NEGATIVE_RESPONSE, OBD_PID_VIN, OBD_POSITIVE_RESPONSE_FLAG, OBD_SERVICE_CURRENT_DATA,
    OBD_SERVICE_FREEZE_FRAME, OBD_SERVICE_PENDING_DTCS, OBD_SERVICE_PERMANENT_DTCS,
    OBD_SERVICE_STORED_DTCS, OBD_SERVICE_VEHICLE_INFO,
};
use crate::error::ObdError;
use crate::obd::dtc::decode_dtcs;
use crate::obd::pids::{pid_descriptor, supported_pids_from_bitmap, MonitorStatus};

/// Parameter identifier: one byte for J1979, two for the UDS DID subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pid {
    Single(u8),
    Extended(u16),
}

impl Pid {
    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Pid::Single(_) => 1,
            Pid::Extended(_) => 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Pid::Single(p) => out.push(*p),
            Pid::Extended(p) => out.extend_from_slice(&p.to_be_bytes()),
        }
    }

    fn matches(&self, data: &[u8]) -> bool {
        match self {
            Pid::Single(p) => data.first() == Some(p),
            Pid::Extended(p) => data.len() >= 2 && data[..2] == p.to_be_bytes(),
        }
    }
}

impl From<u8> for Pid {
    fn from(p: u8) -> Self {
        Pid::Single(p)
    }
}

/// A Service/PID request. Unknown {service, PID} combinations are still
/// transmitted; decoding then falls back to [`DecodedValue::Raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObdRequest {
    pub service: u8,
    pub pid: Option<Pid>,
    pub payload: Vec<u8>,
}

impl ObdRequest {
    /// Request a Mode 0x01 PID.
    pub fn current_data(pid: u8) -> Self {
        ObdRequest {
            service: OBD_SERVICE_CURRENT_DATA,
            pid: Some(Pid::Single(pid)),
            payload: Vec::new(),
        }
    }

    /// Request the VIN (Mode 0x09 PID 0x02).
    pub fn vin() -> Self {
        ObdRequest {
            service: OBD_SERVICE_VEHICLE_INFO,
            pid: Some(Pid::Single(OBD_PID_VIN)),
            payload: Vec::new(),
        }
    }

    /// Request stored trouble codes (Mode 0x03; no PID).
    pub fn stored_dtcs() -> Self {
        ObdRequest {
            service: OBD_SERVICE_STORED_DTCS,
            pid: None,
            payload: Vec::new(),
        }
    }

    /// Clear trouble codes (Mode 0x04; no PID).
    pub fn clear_dtcs() -> Self {
        ObdRequest {
            service: crate::constants::OBD_SERVICE_CLEAR_DTCS,
            pid: None,
            payload: Vec::new(),
        }
    }

    /// Service byte expected on a positive response.
    pub fn response_service(&self) -> u8 {
        self.service | OBD_POSITIVE_RESPONSE_FLAG
    }
}

/// Physical unit attached to a numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    Rpm,
    Celsius,
    Percent,
    KiloPascal,
    Kph,
    Degrees,
    GramsPerSecond,
    Volts,
    Seconds,
    Kilometers,
    None,
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Unit::Rpm => "rpm",
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::KiloPascal => "kPa",
            Unit::Kph => "km/h",
            Unit::Degrees => "°",
            Unit::GramsPerSecond => "g/s",
            Unit::Volts => "V",
            Unit::Seconds => "s",
            Unit::Kilometers => "km",
            Unit::None => "",
        };
        f.write_str(s)
    }
}

/// A decoded response value. Every known PID maps to exactly one variant;
/// everything else is surfaced as raw bytes, never a fabricated value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DecodedValue {
    /// Numeric reading with a physical unit (RPM, °C, %, kPa, ...).
    Numeric { value: f64, unit: Unit },
    /// Enumerated state, e.g. fuel system status.
    Enumerated { code: u8, name: &'static str },
    /// Monitor status bitfield (Mode 0x01 PID 0x01).
    Monitor(MonitorStatus),
    /// PID-support bitmap decoded to the list of supported PIDs.
    SupportedPids(Vec<u8>),
    /// Text payload (VIN).
    Text(String),
    /// Diagnostic trouble codes in `P0301` form.
    Dtcs(Vec<String>),
    /// Unknown PID or service: raw payload bytes.
    Raw(Vec<u8>),
}

/// Serializes a request: service, then PID (big-endian where two bytes),
/// then any payload.
pub fn encode_request(req: &ObdRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + req.pid.map_or(0, |p| p.len()) + req.payload.len());
    out.push(req.service);
    if let Some(pid) = &req.pid {
        pid.write(&mut out);
    }
    out.extend_from_slice(&req.payload);
    out
}

/// Returns the {request service, NRC} pair when `msg` is a negative
/// response frame (`7F <service> <nrc>`).
pub fn negative_response(msg: &[u8]) -> Option<(u8, u8)> {
    match msg {
        [OBD_NEGATIVE_RESPONSE, service, nrc, ..] => Some((*service, *nrc)),
        _ => None,
    }
}

/// True when `msg` is a positive response to `req`: service byte equals
/// request service | 0x40 and the PID echo matches.
pub fn match_response(req: &ObdRequest, msg: &[u8]) -> bool {
    match msg.first() {
        Some(&service) if service == req.response_service() => {}
        _ => return false,
    }
    match &req.pid {
        Some(pid) => pid.matches(&msg[1..]),
        None => true,
    }
}

/// Decodes a positive response message (service echo included) for `req`.
///
/// The caller is expected to have screened negative responses already;
/// a 0x7F frame reaching this function is reported as a protocol error.
pub fn decode_response(req: &ObdRequest, msg: &[u8]) -> Result<DecodedValue, ObdError> {
    if let Some((service, nrc)) = negative_response(msg) {
        return Err(crate::error::ProtocolError::NegativeResponse { service, nrc }.into());
    }
    if !match_response(req, msg) {
        return Err(crate::error::ProtocolError::UnexpectedService {
            expected: req.response_service(),
            actual: msg.first().copied().unwrap_or(0),
        }
        .into());
    }

    let pid_len = req.pid.map_or(0, |p| p.len());
    let data = &msg[1 + pid_len..];

    match (req.service, req.pid) {
        (OBD_SERVICE_CURRENT_DATA, Some(Pid::Single(pid))) => decode_pid(req, pid, data),
        // Freeze frame responses echo the frame number after the PID.
        (OBD_SERVICE_FREEZE_FRAME, Some(Pid::Single(pid))) => {
            let data = data.get(1..).unwrap_or(&[]);
            decode_pid(req, pid, data)
        }
        (OBD_SERVICE_STORED_DTCS | OBD_SERVICE_PENDING_DTCS | OBD_SERVICE_PERMANENT_DTCS, None) => {
            Ok(DecodedValue::Dtcs(decode_dtcs(data)))
        }
        (OBD_SERVICE_VEHICLE_INFO, Some(Pid::Single(OBD_PID_VIN))) => Ok(decode_vin(data)),
        _ => Ok(DecodedValue::Raw(data.to_vec())),
    }
}

fn decode_pid(req: &ObdRequest, pid: u8, data: &[u8]) -> Result<DecodedValue, ObdError> {
    // PID-support bitmaps live on every 0x20 boundary.
    if pid % 0x20 == 0 {
        if data.len() < 4 {
            return Err(decode_error(req, 4, data.len()));
        }
        return Ok(DecodedValue::SupportedPids(supported_pids_from_bitmap(
            pid,
            [data[0], data[1], data[2], data[3]],
        )));
    }

    match pid_descriptor(pid) {
        Some(desc) => {
            if data.len() < desc.data_len {
                return Err(decode_error(req, desc.data_len, data.len()));
            }
            Ok((desc.decode)(&data[..desc.data_len]))
        }
        None => Ok(DecodedValue::Raw(data.to_vec())),
    }
}

/// Mode 0x09 PID 0x02: a count byte followed by the 17-character VIN,
/// possibly padded with NUL or space bytes.
fn decode_vin(data: &[u8]) -> DecodedValue {
    // Multi-frame responses carry a message-count byte first.
    let body = match data.first() {
        Some(0x01) => &data[1..],
        _ => data,
    };
    let text: String = body
        .iter()
        .filter(|b| **b != 0x00 && **b != 0x20)
        .map(|b| *b as char)
        .collect();
    DecodedValue::Text(text)
}

fn decode_error(req: &ObdRequest, expected: usize, actual: usize) -> ObdError {
    ObdError::Decode {
        service: req.service,
        pid: match req.pid {
            Some(Pid::Single(p)) => p,
            Some(Pid::Extended(p)) => (p & 0xFF) as u8,
            None => 0,
        },
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_service_and_pid() {
        let req = ObdRequest::current_data(0x0C);
        assert_eq!(encode_request(&req), vec![0x01, 0x0C]);
    }

    #[test]
    fn encodes_extended_pid_big_endian() {
        let req = ObdRequest {
            service: 0x22,
            pid: Some(Pid::Extended(0xF190)),
            payload: Vec::new(),
        };
        assert_eq!(encode_request(&req), vec![0x22, 0xF1, 0x90]);
    }

    #[test]
    fn matches_positive_response_with_pid_echo() {
        let req = ObdRequest::current_data(0x0C);
        assert!(match_response(&req, &[0x41, 0x0C, 0x1A, 0xF8]));
        assert!(!match_response(&req, &[0x41, 0x0D, 0x1A, 0xF8]));
        assert!(!match_response(&req, &[0x42, 0x0C, 0x1A, 0xF8]));
    }

    #[test]
    fn detects_negative_response() {
        assert_eq!(negative_response(&[0x7F, 0x01, 0x12]), Some((0x01, 0x12)));
        assert_eq!(negative_response(&[0x41, 0x0C]), None);
    }

    #[test]
    fn short_data_yields_decode_error() {
        let req = ObdRequest::current_data(0x0C);
        let err = decode_response(&req, &[0x41, 0x0C, 0x1A]).unwrap_err();
        assert!(matches!(err, ObdError::Decode { expected: 2, actual: 1, .. }));
    }
}

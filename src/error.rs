//! # OBDPHAWD Error Handling
//!
//! This module defines the error taxonomy for the obdphawd crate: a
//! top-level [`ObdError`] plus the transport, ISO-TP, and protocol
//! sub-errors it aggregates.
//!
//! The original C library exposed a flat integer code table
//! (`OBDPHAWD_SUCCESS` .. `OBDPHAWD_ERROR_BLUETOOTH`); that surface
//! survives as [`ObdError::code`] for callers that still speak integers.

use thiserror::Error;

/// Top-level error type returned by sessions, transports, and the codec.
#[derive(Debug, Error)]
pub enum ObdError {
    /// Malformed request or a syntactically unknown service/PID.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Request deadline elapsed or an ISO-TP timer expired.
    #[error("Timed out waiting for response")]
    Timeout,

    /// Transport failure; the session moves to the Error state.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// ISO-TP framing failure; only the affected message is reset.
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),

    /// Protocol-level failure (negative response, bad ELM token, ...).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A PID decoder received fewer bytes than its formula needs.
    #[error("Decode error for service 0x{service:02X} PID 0x{pid:02X}: expected {expected} data bytes, got {actual}")]
    Decode {
        service: u8,
        pid: u8,
        expected: usize,
        actual: usize,
    },

    /// No matching GATT service/characteristic pair on the peer.
    #[error("BLE discovery failed: {0}")]
    BleDiscovery(String),

    /// The request was cancelled by the caller.
    #[error("Request cancelled")]
    Cancelled,
}

/// Errors raised by the byte-channel transports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport write failed: {0}")]
    WriteFailed(String),

    #[error("Link lost")]
    LinkLost,

    #[error("Transport closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    /// A single frame with extended addressing would not fit one MTU.
    #[error("MTU {mtu} too small for frame of {needed} bytes")]
    MtuTooSmall { mtu: usize, needed: usize },

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Serial port error: {0}")]
    SerialPort(String),
}

/// Errors raised by the ISO 15765-2 segmentation layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    /// Consecutive frame arrived with the wrong sequence number.
    #[error("ISO-TP sequence error: expected {expected}, got {actual}")]
    SequenceError { expected: u8, actual: u8 },

    /// Peer answered our first frame with flow status 2 (overflow).
    #[error("ISO-TP flow control reported overflow")]
    Overflow,

    /// Declared message length exceeds the 4095-byte classical limit.
    #[error("ISO-TP message length {0} exceeds maximum")]
    BufferOverrun(usize),

    /// Flow control frame arrived with no transmission in progress.
    #[error("Unexpected flow control frame")]
    UnexpectedFlowControl,

    /// Consecutive frame arrived while the receiver was idle.
    #[error("Unexpected consecutive frame")]
    UnexpectedConsecutive,

    /// PCI nibble does not name a known frame type.
    #[error("Invalid PCI byte: 0x{0:02X}")]
    InvalidPci(u8),

    /// Frame shorter than its PCI demands.
    #[error("ISO-TP frame truncated: {0}")]
    Truncated(String),

    /// Peer exceeded the permitted number of FC wait frames.
    #[error("Too many flow control wait frames")]
    TooManyWaits,

    /// N_Bs / N_Cr timer expired.
    #[error("ISO-TP timer expired: {0}")]
    TimerExpired(&'static str),
}

/// Errors raised above ISO-TP: OBD-II semantics and the ELM327 line protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Negative response (0x7F); carries the NRC byte.
    #[error("Negative response to service 0x{service:02X}: {name} (NRC 0x{nrc:02X})", name = nrc_name(*.nrc))]
    NegativeResponse { service: u8, nrc: u8 },

    /// Response service byte did not match request | 0x40.
    #[error("Unexpected response service: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedService { expected: u8, actual: u8 },

    /// ELM327 line that is neither hex data nor a known token.
    #[error("Malformed ELM327 response: {0:?}")]
    MalformedElm(String),

    /// ELM327 `NO DATA` token: the vehicle did not answer.
    #[error("Peer reported NO DATA")]
    PeerNoData,

    /// ELM327 `?` token: the adapter rejected the command.
    #[error("Peer rejected command syntax")]
    PeerSyntax,

    /// ELM327 `STOPPED` token: the adapter aborted the request.
    #[error("Peer stopped the request")]
    PeerStopped,

    /// ELM327 `CAN ERROR` and relatives: bus-level failure.
    #[error("Peer reported a link error")]
    LinkError,
}

impl ObdError {
    /// Map onto the integer code surface of the original C ABI
    /// (`obdphawd_error_t`). Success (0) has no `ObdError` value.
    pub fn code(&self) -> i32 {
        match self {
            ObdError::InvalidInput(_) => -1,
            ObdError::Transport(TransportError::Bluetooth(_)) => -7,
            ObdError::Transport(_) => -3,
            ObdError::Timeout => -4,
            ObdError::IsoTp(_) | ObdError::Protocol(_) | ObdError::Decode { .. } => -5,
            ObdError::BleDiscovery(_) => -7,
            ObdError::Cancelled => -3,
        }
    }

    /// True when the session should move to the Error state and fail fast.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ObdError::Transport(_))
    }
}

/// Human-readable name for an ISO 14229 / J1979 negative response code.
pub fn nrc_name(nrc: u8) -> &'static str {
    match nrc {
        0x10 => "general reject",
        0x11 => "service not supported",
        0x12 => "sub-function not supported",
        0x13 => "incorrect message length or invalid format",
        0x14 => "response too long",
        0x21 => "busy, repeat request",
        0x22 => "conditions not correct",
        0x24 => "request sequence error",
        0x31 => "request out of range",
        0x33 => "security access denied",
        0x35 => "invalid key",
        0x36 => "exceeded number of attempts",
        0x37 => "required time delay not expired",
        0x72 => "general programming failure",
        0x78 => "response pending",
        0x7E => "sub-function not supported in active session",
        0x7F => "service not supported in active session",
        _ => "unknown NRC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_response_names_nrc() {
        let err = ProtocolError::NegativeResponse {
            service: 0x01,
            nrc: 0x12,
        };
        let msg = err.to_string();
        assert!(msg.contains("sub-function not supported"));
        assert!(msg.contains("0x12"));
    }

    #[test]
    fn code_mapping_matches_c_table() {
        assert_eq!(ObdError::Timeout.code(), -4);
        assert_eq!(
            ObdError::Transport(TransportError::LinkLost).code(),
            -3
        );
        assert_eq!(
            ObdError::Transport(TransportError::Bluetooth("off".into())).code(),
            -7
        );
        assert_eq!(
            ObdError::IsoTp(IsoTpError::Overflow).code(),
            -5
        );
    }
}

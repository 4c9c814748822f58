//! # ELM327 Line Protocol
//!
//! Text-mode peer handling: the session probes with `ATZ`, and an ASCII
//! banner in reply marks the adapter as an ELM327 dongle. Requests then
//! travel as uppercase hex terminated by carriage return; replies come
//! back as lines of hex (one CAN frame per line when headers are on)
//! followed by the `>` prompt. The adapter performs ISO-TP flow control
//! on the CAN side itself, so frames seen here are only SF/FF/CF.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::constants::{
    ELM_CMD_RESET, ELM_INIT_SEQUENCE, ELM_PROMPT, ELM_TOKEN_BUS_ERROR, ELM_TOKEN_CAN_ERROR,
    ELM_TOKEN_NO_DATA, ELM_TOKEN_OK, ELM_TOKEN_STOPPED, ELM_TOKEN_SYNTAX,
};
use crate::error::{IsoTpError, ObdError, ProtocolError};
use crate::isotp::address::{is_response_id, responding_ecu};
use crate::isotp::frame::{decode_frame, IsoTpFrame};
use crate::isotp::reassembly::{InboundEvent, Reassembler};
use crate::transport::Transport;

/// Formats a binary request as an ELM327 command line.
pub fn format_request(payload: &[u8]) -> Vec<u8> {
    let mut out = hex::encode_upper(payload).into_bytes();
    out.push(b'\r');
    out
}

/// Formats an AT command line.
pub fn format_command(cmd: &str) -> Vec<u8> {
    let mut out = cmd.as_bytes().to_vec();
    out.push(b'\r');
    out
}

/// One event cut from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmEvent {
    /// A complete, non-empty line (terminators stripped).
    Line(String),
    /// The `>` prompt: the adapter is ready for the next command.
    Prompt,
}

/// Accumulates inbound bytes and yields lines and prompts.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Cuts the next line or prompt out of the buffer.
    pub fn next_event(&mut self) -> Option<ElmEvent> {
        while let Some(pos) = self
            .buf
            .iter()
            .position(|b| matches!(b, b'\r' | b'\n') || *b == ELM_PROMPT)
        {
            let terminator = self.buf[pos];
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            if terminator == ELM_PROMPT {
                if text.is_empty() {
                    return Some(ElmEvent::Prompt);
                }
                // Unterminated text before the prompt is still a line;
                // the prompt is re-queued for the next call.
                self.buf.insert(0, ELM_PROMPT);
                return Some(ElmEvent::Line(text));
            }
            if !text.is_empty() {
                return Some(ElmEvent::Line(text));
            }
        }
        None
    }
}

/// Classification of one reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmLine {
    /// One raw CAN frame (PCI included) from a header-tagged line (ATH1).
    Frame { ecu: u8, frame: Vec<u8> },
    /// A whole response payload from a headerless line (ATH0); the
    /// adapter has already stripped the ISO-TP framing.
    Payload(Vec<u8>),
    /// A reply token mapping onto a protocol failure.
    Failure(ProtocolError),
    /// `OK` after an AT command.
    Ack,
    /// Banner, `SEARCHING...`, or anything else informational.
    Info(String),
}

/// Classifies one trimmed reply line.
pub fn classify_line(line: &str) -> ElmLine {
    let upper = line.to_uppercase();
    if line == ELM_TOKEN_SYNTAX {
        return ElmLine::Failure(ProtocolError::PeerSyntax);
    }
    if upper == ELM_TOKEN_NO_DATA {
        return ElmLine::Failure(ProtocolError::PeerNoData);
    }
    if upper == ELM_TOKEN_STOPPED {
        return ElmLine::Failure(ProtocolError::PeerStopped);
    }
    if upper.contains(ELM_TOKEN_CAN_ERROR)
        || upper.contains(ELM_TOKEN_BUS_ERROR)
        || upper.contains("UNABLE TO CONNECT")
    {
        return ElmLine::Failure(ProtocolError::LinkError);
    }
    if upper == ELM_TOKEN_OK {
        return ElmLine::Ack;
    }
    if upper.starts_with("SEARCHING") {
        return ElmLine::Info(line.to_string());
    }
    parse_hex_frame(line).unwrap_or_else(|| ElmLine::Info(line.to_string()))
}

/// Parses an all-hex line into a CAN frame, recognizing 3-digit 11-bit
/// and 8-digit 29-bit headers (ATH1) as well as headerless data (ATH0).
fn parse_hex_frame(line: &str) -> Option<ElmLine> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let (id, data_hex) = if compact.len() % 2 == 1 && compact.len() >= 5 {
        let id = u32::from_str_radix(&compact[..3], 16).ok()?;
        (Some(id), &compact[3..])
    } else if compact.len() >= 10 {
        // An even-length line long enough for a 29-bit header: treat the
        // first eight digits as one only when they name a response id.
        match u32::from_str_radix(&compact[..8], 16) {
            Ok(id) if is_response_id(id) => (Some(id), &compact[8..]),
            _ => (None, compact.as_str()),
        }
    } else {
        (None, compact.as_str())
    };

    if data_hex.len() % 2 == 1 {
        return Some(ElmLine::Failure(ProtocolError::MalformedElm(
            line.to_string(),
        )));
    }
    let Ok(frame) = hex::decode(data_hex) else {
        return Some(ElmLine::Failure(ProtocolError::MalformedElm(
            line.to_string(),
        )));
    };
    match id {
        Some(id) if !is_response_id(id) => {
            // Traffic from a non-diagnostic identifier; not ours.
            trace!("elm line from non-response id 0x{id:03X}");
            Some(ElmLine::Info(line.to_string()))
        }
        Some(id) => Some(ElmLine::Frame {
            ecu: responding_ecu(id).unwrap_or(0),
            frame,
        }),
        None => Some(ElmLine::Payload(frame)),
    }
}

/// Reassembles header-tagged frames into whole messages, one ISO-TP
/// context per responding ECU so interleaved multi-ECU replies do not
/// corrupt each other.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    channels: HashMap<u8, Reassembler>,
}

impl ResponseCollector {
    pub fn new() -> Self {
        ResponseCollector::default()
    }

    pub fn reset(&mut self) {
        self.channels.clear();
    }

    /// Feeds one CAN frame from `ecu`; returns a message once whole.
    pub fn push(&mut self, ecu: u8, frame: &[u8]) -> Result<Option<Vec<u8>>, IsoTpError> {
        let frame = decode_frame(frame)?;
        if matches!(frame, IsoTpFrame::FlowControl { .. }) {
            // The adapter answers flow control on the CAN side itself.
            return Ok(None);
        }
        let channel = self.channels.entry(ecu).or_default();
        match channel.handle_frame(frame)? {
            Some(InboundEvent::Message(msg)) => Ok(Some(msg)),
            // Our FC never reaches the wire in text mode.
            Some(InboundEvent::SendFlowControl(_)) | None => Ok(None),
        }
    }
}

/// Sends `ATZ` and watches the reply: an ASCII banner or prompt within
/// `window` identifies an ELM327 peer. Silence means a raw binary peer.
pub(crate) async fn probe(
    transport: &mut dyn Transport,
    window: Duration,
) -> Result<bool, ObdError> {
    transport.write(&format_command(ELM_CMD_RESET)).await?;
    let deadline = tokio::time::Instant::now() + window;
    let mut banner = Vec::new();
    loop {
        let chunk = match tokio::time::timeout_at(deadline, transport.recv()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        };
        banner.extend_from_slice(&chunk);
        if banner.contains(&ELM_PROMPT) {
            break;
        }
    }
    let text = String::from_utf8_lossy(&banner);
    let is_elm = text.to_uppercase().contains("ELM") || banner.contains(&ELM_PROMPT);
    debug!("elm probe: {:?} -> {is_elm}", text.trim());
    Ok(is_elm)
}

/// Runs the post-probe setup sequence (echo/linefeeds/spaces off,
/// headers on, protocol auto). A clone rejecting one command with `?`
/// is tolerated.
pub(crate) async fn initialize(transport: &mut dyn Transport) -> Result<(), ObdError> {
    let mut lines = LineBuffer::new();
    for cmd in ELM_INIT_SEQUENCE {
        transport.write(&format_command(cmd)).await?;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1000);
        'await_prompt: loop {
            loop {
                match lines.next_event() {
                    Some(ElmEvent::Prompt) => break 'await_prompt,
                    Some(ElmEvent::Line(text)) => {
                        if classify_line(&text) == ElmLine::Failure(ProtocolError::PeerSyntax) {
                            warn!("elm init: {cmd} rejected by adapter");
                        }
                    }
                    None => break,
                }
            }
            let chunk = match tokio::time::timeout_at(deadline, transport.recv()).await {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!("elm init: no prompt after {cmd}");
                    break;
                }
            };
            lines.push_bytes(&chunk);
        }
    }
    debug!("elm init sequence complete");
    Ok(())
}

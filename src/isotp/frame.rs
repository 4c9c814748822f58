//! # ISO-TP Frame Codec
//!
//! Parsing and packing of the four ISO 15765-2 frame types. The protocol
//! control information (PCI) lives in the high nibble of the first byte:
//!
//! | Nibble | Frame             | Layout                               |
//! |--------|-------------------|--------------------------------------|
//! | 0      | Single (SF)       | `0L dd ..` with L = data length      |
//! | 1      | First (FF)        | `1L LL dd ..` 12-bit total length    |
//! | 2      | Consecutive (CF)  | `2S dd ..` with S = sequence number  |
//! | 3      | Flow Control (FC) | `3F BS ST` status/block size/STmin   |
//!
//! Parsing uses `nom`; packing returns a plain byte vector.

use std::time::Duration;

use nom::bytes::streaming::take;
use nom::number::streaming::be_u8;
use nom::IResult;

use crate::constants::{
    ISOTP_CF_PAYLOAD, ISOTP_FF_PAYLOAD, ISOTP_MAX_MESSAGE_LEN, ISOTP_PCI_CONSECUTIVE,
    ISOTP_PCI_FIRST, ISOTP_PCI_FLOW_CONTROL, ISOTP_PCI_SINGLE, ISOTP_SF_MAX_NORMAL,
};
use crate::error::IsoTpError;

/// Flow status carried by an FC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send.
    Continue,
    /// Hold off and restart the N_Bs timer.
    Wait,
    /// Receiver cannot take a message this large; abort.
    Overflow,
}

/// One ISO-TP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    Single {
        data: Vec<u8>,
    },
    First {
        /// Declared length of the whole message.
        total_len: u16,
        data: Vec<u8>,
    },
    Consecutive {
        /// Sequence number, 0x0-0xF.
        seq: u8,
        data: Vec<u8>,
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        /// Raw STmin byte; see [`st_min_duration`].
        st_min: u8,
    },
}

/// Decodes an STmin byte: 0x00-0x7F are milliseconds, 0xF1-0xF9 are
/// 100-900 microseconds, anything else is reserved and treated as zero.
pub fn st_min_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(raw - 0xF0) * 100),
        _ => Duration::ZERO,
    }
}

/// Parses one ISO-TP frame with `nom` streaming semantics: an
/// `Err(Incomplete)` means more bytes are needed.
pub fn parse_frame(input: &[u8]) -> IResult<&[u8], IsoTpFrame> {
    let (i, pci) = be_u8(input)?;
    match pci >> 4 {
        ISOTP_PCI_SINGLE => {
            let len = (pci & 0x0F) as usize;
            if len == 0 || len > ISOTP_SF_MAX_NORMAL {
                return Err(nom_failure(input));
            }
            let (i, data) = take(len)(i)?;
            Ok((
                i,
                IsoTpFrame::Single {
                    data: data.to_vec(),
                },
            ))
        }
        ISOTP_PCI_FIRST => {
            let (i, low) = be_u8(i)?;
            let total_len = (u16::from(pci & 0x0F) << 8) | u16::from(low);
            let (i, data) = take(ISOTP_FF_PAYLOAD)(i)?;
            Ok((
                i,
                IsoTpFrame::First {
                    total_len,
                    data: data.to_vec(),
                },
            ))
        }
        ISOTP_PCI_CONSECUTIVE => {
            // CF payload length is not self-describing; consume what is there
            // up to the classical maximum. Byte-stream callers pre-slice via
            // `FrameSlicer`.
            let len = i.len().min(ISOTP_CF_PAYLOAD);
            let (i, data) = take(len)(i)?;
            Ok((
                i,
                IsoTpFrame::Consecutive {
                    seq: pci & 0x0F,
                    data: data.to_vec(),
                },
            ))
        }
        ISOTP_PCI_FLOW_CONTROL => {
            let status = match pci & 0x0F {
                0 => FlowStatus::Continue,
                1 => FlowStatus::Wait,
                2 => FlowStatus::Overflow,
                _ => return Err(nom_failure(input)),
            };
            let (i, block_size) = be_u8(i)?;
            let (i, st_min) = be_u8(i)?;
            Ok((
                i,
                IsoTpFrame::FlowControl {
                    status,
                    block_size,
                    st_min,
                },
            ))
        }
        _ => Err(nom_failure(input)),
    }
}

fn nom_failure(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
}

/// Decodes a complete frame buffer, mapping parse failures onto the
/// ISO-TP error taxonomy.
pub fn decode_frame(buf: &[u8]) -> Result<IsoTpFrame, IsoTpError> {
    let pci = *buf
        .first()
        .ok_or_else(|| IsoTpError::Truncated("empty frame".into()))?;
    match parse_frame(buf) {
        Ok((_, frame)) => Ok(frame),
        Err(nom::Err::Incomplete(_)) => Err(IsoTpError::Truncated(format!(
            "{} bytes for PCI 0x{pci:02X}",
            buf.len()
        ))),
        Err(_) => Err(IsoTpError::InvalidPci(pci)),
    }
}

/// Packs a frame into wire bytes.
pub fn pack_frame(frame: &IsoTpFrame) -> Vec<u8> {
    match frame {
        IsoTpFrame::Single { data } => {
            debug_assert!(!data.is_empty() && data.len() <= ISOTP_SF_MAX_NORMAL);
            let mut out = Vec::with_capacity(1 + data.len());
            out.push((ISOTP_PCI_SINGLE << 4) | data.len() as u8);
            out.extend_from_slice(data);
            out
        }
        IsoTpFrame::First { total_len, data } => {
            debug_assert!((*total_len as usize) <= ISOTP_MAX_MESSAGE_LEN);
            let mut out = Vec::with_capacity(2 + data.len());
            out.push((ISOTP_PCI_FIRST << 4) | ((total_len >> 8) as u8 & 0x0F));
            out.push((total_len & 0xFF) as u8);
            out.extend_from_slice(data);
            out
        }
        IsoTpFrame::Consecutive { seq, data } => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push((ISOTP_PCI_CONSECUTIVE << 4) | (seq & 0x0F));
            out.extend_from_slice(data);
            out
        }
        IsoTpFrame::FlowControl {
            status,
            block_size,
            st_min,
        } => {
            let fs = match status {
                FlowStatus::Continue => 0,
                FlowStatus::Wait => 1,
                FlowStatus::Overflow => 2,
            };
            vec![(ISOTP_PCI_FLOW_CONTROL << 4) | fs, *block_size, *st_min]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_frame() {
        let frame = decode_frame(&[0x02, 0x01, 0x0C]).unwrap();
        assert_eq!(
            frame,
            IsoTpFrame::Single {
                data: vec![0x01, 0x0C]
            }
        );
    }

    #[test]
    fn parses_first_frame_length() {
        let frame = decode_frame(&[0x10, 0x14, 0x49, 0x02, 0x01, 0x57, 0x30, 0x4C]).unwrap();
        assert_eq!(
            frame,
            IsoTpFrame::First {
                total_len: 0x014,
                data: vec![0x49, 0x02, 0x01, 0x57, 0x30, 0x4C]
            }
        );
    }

    #[test]
    fn parses_flow_control() {
        let frame = decode_frame(&[0x30, 0x00, 0x00]).unwrap();
        assert_eq!(
            frame,
            IsoTpFrame::FlowControl {
                status: FlowStatus::Continue,
                block_size: 0,
                st_min: 0
            }
        );
    }

    #[test]
    fn rejects_invalid_flow_status() {
        assert_eq!(
            decode_frame(&[0x3F, 0x00, 0x00]),
            Err(IsoTpError::InvalidPci(0x3F))
        );
    }

    #[test]
    fn truncated_frame_reports_length() {
        assert!(matches!(
            decode_frame(&[0x10, 0x14, 0x49]),
            Err(IsoTpError::Truncated(_))
        ));
    }

    #[test]
    fn st_min_table() {
        assert_eq!(st_min_duration(0x00), Duration::ZERO);
        assert_eq!(st_min_duration(0x7F), Duration::from_millis(127));
        assert_eq!(st_min_duration(0xF1), Duration::from_micros(100));
        assert_eq!(st_min_duration(0xF9), Duration::from_micros(900));
        // Reserved values degrade to zero.
        assert_eq!(st_min_duration(0x80), Duration::ZERO);
        assert_eq!(st_min_duration(0xFA), Duration::ZERO);
    }

    #[test]
    fn pack_round_trips() {
        let frames = [
            IsoTpFrame::Single {
                data: vec![0x01, 0x05],
            },
            IsoTpFrame::First {
                total_len: 20,
                data: vec![1, 2, 3, 4, 5, 6],
            },
            IsoTpFrame::FlowControl {
                status: FlowStatus::Wait,
                block_size: 4,
                st_min: 0x0A,
            },
        ];
        for frame in frames {
            assert_eq!(decode_frame(&pack_frame(&frame)).unwrap(), frame);
        }
    }

    #[test]
    fn consecutive_pack_keeps_sequence() {
        let frame = IsoTpFrame::Consecutive {
            seq: 0x5,
            data: vec![0xAA; 7],
        };
        let packed = pack_frame(&frame);
        assert_eq!(packed[0], 0x25);
        assert_eq!(decode_frame(&packed).unwrap(), frame);
    }
}

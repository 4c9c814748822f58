//! # ISO-TP Inbound Reassembly
//!
//! State machine turning a stream of SF/FF/CF frames into whole
//! diagnostic messages. On a first frame it asks the caller to emit a
//! flow control frame with the configured BS/STmin; consecutive frames
//! must arrive in sequence 1,2,...,15,0,1,... with no gaps. A gap raises
//! exactly one [`IsoTpError::SequenceError`] and resets the context; the
//! link itself stays up.

use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::constants::{ISOTP_MAX_MESSAGE_LEN, ISOTP_N_CR, ISOTP_SEQ_MAX, ISOTP_SF_MAX_NORMAL};
use crate::error::IsoTpError;
use crate::isotp::frame::{FlowStatus, IsoTpFrame};

/// What the caller must do after feeding a frame in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A whole message finished reassembly.
    Message(Vec<u8>),
    /// Write this flow control frame to the peer.
    SendFlowControl(IsoTpFrame),
}

#[derive(Debug)]
enum State {
    Idle,
    Receiving {
        buf: Vec<u8>,
        total: usize,
        next_seq: u8,
        last_frame: Instant,
    },
}

/// Per-channel inbound reassembly context.
#[derive(Debug)]
pub struct Reassembler {
    state: State,
    /// BS advertised in our flow control frames (0 = no limit).
    block_size: u8,
    /// STmin advertised in our flow control frames.
    st_min: u8,
    /// N_Cr: longest tolerated gap between consecutive frames.
    cr_timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Reassembler {
    pub fn new(block_size: u8, st_min: u8) -> Self {
        Reassembler {
            state: State::Idle,
            block_size,
            st_min,
            cr_timeout: ISOTP_N_CR,
        }
    }

    /// True while a multi-frame message is in progress.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, State::Receiving { .. })
    }

    /// Bytes still expected for the in-progress message. Used by the
    /// byte-stream slicer to size consecutive frames.
    pub fn remaining(&self) -> Option<usize> {
        match &self.state {
            State::Receiving { buf, total, .. } => Some(total - buf.len()),
            State::Idle => None,
        }
    }

    /// Discards any in-progress reassembly.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Feeds one inbound frame. Flow control frames belong to the
    /// outbound side and are rejected here; the session routes them to
    /// the [`crate::isotp::Transmitter`] first.
    pub fn handle_frame(&mut self, frame: IsoTpFrame) -> Result<Option<InboundEvent>, IsoTpError> {
        match frame {
            IsoTpFrame::Single { data } => {
                // A single frame aborts any half-finished reassembly.
                self.state = State::Idle;
                trace!("isotp rx SF {} bytes", data.len());
                Ok(Some(InboundEvent::Message(data)))
            }
            IsoTpFrame::First { total_len, data } => {
                let total = total_len as usize;
                if total <= ISOTP_SF_MAX_NORMAL || total > ISOTP_MAX_MESSAGE_LEN {
                    return Err(IsoTpError::BufferOverrun(total));
                }
                debug!("isotp rx FF, expecting {total} bytes");
                let mut buf = Vec::with_capacity(total);
                buf.extend_from_slice(&data[..data.len().min(total)]);
                self.state = State::Receiving {
                    buf,
                    total,
                    next_seq: 1,
                    last_frame: Instant::now(),
                };
                Ok(Some(InboundEvent::SendFlowControl(IsoTpFrame::FlowControl {
                    status: FlowStatus::Continue,
                    block_size: self.block_size,
                    st_min: self.st_min,
                })))
            }
            IsoTpFrame::Consecutive { seq, data } => {
                let State::Receiving {
                    buf,
                    total,
                    next_seq,
                    last_frame,
                } = &mut self.state
                else {
                    return Err(IsoTpError::UnexpectedConsecutive);
                };
                if seq != *next_seq {
                    let expected = *next_seq;
                    self.state = State::Idle;
                    return Err(IsoTpError::SequenceError {
                        expected,
                        actual: seq,
                    });
                }
                *next_seq = if *next_seq == ISOTP_SEQ_MAX {
                    0
                } else {
                    *next_seq + 1
                };
                *last_frame = Instant::now();
                let want = *total - buf.len();
                buf.extend_from_slice(&data[..data.len().min(want)]);
                if buf.len() == *total {
                    let msg = std::mem::take(buf);
                    self.state = State::Idle;
                    debug!("isotp rx complete, {} bytes", msg.len());
                    Ok(Some(InboundEvent::Message(msg)))
                } else {
                    trace!("isotp rx CF seq {seq}, {}/{} bytes", buf.len(), total);
                    Ok(None)
                }
            }
            IsoTpFrame::FlowControl { .. } => Err(IsoTpError::UnexpectedFlowControl),
        }
    }

    /// Enforces the N_Cr timer: when the gap since the last consecutive
    /// frame exceeds the limit, the in-progress message is discarded and
    /// the expiry is reported once.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), IsoTpError> {
        if let State::Receiving { last_frame, .. } = &self.state {
            if now.duration_since(*last_frame) > self.cr_timeout {
                self.state = State::Idle;
                return Err(IsoTpError::TimerExpired("N_Cr"));
            }
        }
        Ok(())
    }

    /// Next deadline at which [`check_timeout`](Self::check_timeout)
    /// should run, if a message is in progress.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Receiving { last_frame, .. } => Some(*last_frame + self.cr_timeout),
            State::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cf(seq: u8, data: &[u8]) -> IsoTpFrame {
        IsoTpFrame::Consecutive {
            seq,
            data: data.to_vec(),
        }
    }

    #[test]
    fn single_frame_completes_immediately() {
        let mut rx = Reassembler::default();
        let event = rx
            .handle_frame(IsoTpFrame::Single {
                data: vec![0x41, 0x0C, 0x1A, 0xF8],
            })
            .unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::Message(vec![0x41, 0x0C, 0x1A, 0xF8]))
        );
        assert!(!rx.is_receiving());
    }

    #[test]
    fn first_frame_triggers_flow_control() {
        let mut rx = Reassembler::new(0, 0);
        let event = rx
            .handle_frame(IsoTpFrame::First {
                total_len: 20,
                data: vec![0x49, 0x02, 0x01, 0x57, 0x30, 0x4C],
            })
            .unwrap();
        assert_eq!(
            event,
            Some(InboundEvent::SendFlowControl(IsoTpFrame::FlowControl {
                status: FlowStatus::Continue,
                block_size: 0,
                st_min: 0
            }))
        );
        assert_eq!(rx.remaining(), Some(14));
    }

    #[test]
    fn reassembles_vin_response() {
        let mut rx = Reassembler::default();
        rx.handle_frame(IsoTpFrame::First {
            total_len: 0x14,
            data: vec![0x49, 0x02, 0x01, 0x57, 0x30, 0x4C],
        })
        .unwrap();
        assert!(rx
            .handle_frame(cf(1, &[0x31, 0x5A, 0x5A, 0x5A, 0x35, 0x34, 0x34]))
            .unwrap()
            .is_none());
        let event = rx
            .handle_frame(cf(2, &[0x32, 0x33, 0x35, 0x36, 0x37, 0x38, 0x39]))
            .unwrap();
        let Some(InboundEvent::Message(msg)) = event else {
            panic!("expected completed message");
        };
        assert_eq!(msg.len(), 0x14);
        assert_eq!(&msg[..3], &[0x49, 0x02, 0x01]);
    }

    #[test]
    fn sequence_gap_resets_state() {
        let mut rx = Reassembler::default();
        rx.handle_frame(IsoTpFrame::First {
            total_len: 30,
            data: vec![0; 6],
        })
        .unwrap();
        let err = rx.handle_frame(cf(2, &[0; 7])).unwrap_err();
        assert_eq!(
            err,
            IsoTpError::SequenceError {
                expected: 1,
                actual: 2
            }
        );
        assert!(!rx.is_receiving());
        // The reset is complete: the next CF is unexpected, not mismatched.
        assert_eq!(
            rx.handle_frame(cf(3, &[0; 7])).unwrap_err(),
            IsoTpError::UnexpectedConsecutive
        );
    }

    #[test]
    fn sequence_wraps_after_fifteen() {
        let mut rx = Reassembler::default();
        // 6 + 17*7 = 125 bytes total; sequence runs 1..15,0,1.
        rx.handle_frame(IsoTpFrame::First {
            total_len: 125,
            data: vec![0; 6],
        })
        .unwrap();
        let mut seq = 1u8;
        for i in 0..17 {
            let event = rx.handle_frame(cf(seq, &[0; 7])).unwrap();
            if i == 16 {
                assert!(matches!(event, Some(InboundEvent::Message(_))));
            } else {
                assert!(event.is_none());
            }
            seq = if seq == 0x0F { 0 } else { seq + 1 };
        }
    }

    #[test]
    fn oversized_first_frame_rejected() {
        let mut rx = Reassembler::default();
        // A length that should have been a single frame is also invalid.
        let err = rx
            .handle_frame(IsoTpFrame::First {
                total_len: 5,
                data: vec![0; 5],
            })
            .unwrap_err();
        assert_eq!(err, IsoTpError::BufferOverrun(5));
    }

    #[test]
    fn n_cr_expiry_discards_state() {
        let mut rx = Reassembler::default();
        rx.handle_frame(IsoTpFrame::First {
            total_len: 20,
            data: vec![0; 6],
        })
        .unwrap();
        let later = Instant::now() + Duration::from_millis(1500);
        assert_eq!(
            rx.check_timeout(later).unwrap_err(),
            IsoTpError::TimerExpired("N_Cr")
        );
        assert!(!rx.is_receiving());
        rx.check_timeout(later + Duration::from_secs(1)).unwrap();
    }
}

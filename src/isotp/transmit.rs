//! # ISO-TP Outbound Transmission
//!
//! State machine for sending diagnostic messages: a single frame when the
//! payload fits, otherwise a first frame followed by consecutive frames
//! gated by the receiver's flow control. Flow status 0 continues, 1 holds
//! (at most [`crate::constants::ISOTP_MAX_FC_WAITS`] times by default),
//! 2 aborts with an overflow error. Block size and STmin from the FC
//! frame pace the consecutive frames.

use std::time::Duration;

use log::{debug, trace};

use crate::constants::{
    ISOTP_CF_PAYLOAD, ISOTP_FF_PAYLOAD, ISOTP_MAX_FC_WAITS, ISOTP_MAX_MESSAGE_LEN, ISOTP_SEQ_MAX,
    ISOTP_SF_MAX_EXTENDED, ISOTP_SF_MAX_NORMAL,
};
use crate::error::IsoTpError;
use crate::isotp::address::AddressMode;
use crate::isotp::frame::{pack_frame, st_min_duration, FlowStatus, IsoTpFrame};

/// What the session driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAction {
    /// Write these frames, pacing consecutive writes by `gap`; the
    /// message is then fully transmitted.
    SendAll { frames: Vec<Vec<u8>>, gap: Duration },
    /// Write these frames, then wait for the next flow control frame
    /// (restart N_Bs).
    SendThenWait { frames: Vec<Vec<u8>>, gap: Duration },
    /// Peer asked us to hold; keep waiting for flow control.
    Hold,
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitingFlowControl {
        remaining: Vec<u8>,
        next_seq: u8,
        waits: u8,
    },
}

/// Per-channel outbound transmission context.
#[derive(Debug)]
pub struct Transmitter {
    state: State,
    mode: AddressMode,
    max_fc_waits: u8,
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new(AddressMode::Normal)
    }
}

impl Transmitter {
    pub fn new(mode: AddressMode) -> Self {
        Transmitter {
            state: State::Idle,
            mode,
            max_fc_waits: ISOTP_MAX_FC_WAITS,
        }
    }

    /// True while a segmented message still awaits flow control.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::AwaitingFlowControl { .. })
    }

    /// Abandons the in-flight message.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    fn sf_capacity(&self) -> usize {
        match self.mode {
            AddressMode::Normal => ISOTP_SF_MAX_NORMAL,
            AddressMode::Extended(_) => ISOTP_SF_MAX_EXTENDED,
        }
    }

    fn finish(&self, frame: &IsoTpFrame) -> Vec<u8> {
        let packed = pack_frame(frame);
        match self.mode {
            AddressMode::Normal => packed,
            AddressMode::Extended(addr) => {
                let mut out = Vec::with_capacity(1 + packed.len());
                out.push(addr);
                out.extend_from_slice(&packed);
                out
            }
        }
    }

    /// Begins transmitting `msg`.
    pub fn start(&mut self, msg: &[u8]) -> Result<TxAction, IsoTpError> {
        if self.is_active() {
            // A new message preempts a stalled one.
            self.state = State::Idle;
        }
        if msg.is_empty() {
            return Err(IsoTpError::Truncated("empty message".into()));
        }
        if msg.len() > ISOTP_MAX_MESSAGE_LEN {
            return Err(IsoTpError::BufferOverrun(msg.len()));
        }

        if msg.len() <= self.sf_capacity() {
            trace!("isotp tx SF {} bytes", msg.len());
            let frame = self.finish(&IsoTpFrame::Single { data: msg.to_vec() });
            return Ok(TxAction::SendAll {
                frames: vec![frame],
                gap: Duration::ZERO,
            });
        }

        let ff_payload = ISOTP_FF_PAYLOAD - self.mode.overhead();
        debug!("isotp tx FF, {} bytes total", msg.len());
        let frame = self.finish(&IsoTpFrame::First {
            total_len: msg.len() as u16,
            data: msg[..ff_payload].to_vec(),
        });
        self.state = State::AwaitingFlowControl {
            remaining: msg[ff_payload..].to_vec(),
            next_seq: 1,
            waits: 0,
        };
        Ok(TxAction::SendThenWait {
            frames: vec![frame],
            gap: Duration::ZERO,
        })
    }

    /// Feeds a flow control frame received from the peer.
    pub fn handle_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    ) -> Result<TxAction, IsoTpError> {
        let State::AwaitingFlowControl {
            remaining,
            next_seq,
            waits,
        } = &mut self.state
        else {
            return Err(IsoTpError::UnexpectedFlowControl);
        };

        match status {
            FlowStatus::Wait => {
                *waits += 1;
                if *waits > self.max_fc_waits {
                    self.state = State::Idle;
                    return Err(IsoTpError::TooManyWaits);
                }
                trace!("isotp tx holding on FC wait #{waits}");
                Ok(TxAction::Hold)
            }
            FlowStatus::Overflow => {
                self.state = State::Idle;
                Err(IsoTpError::Overflow)
            }
            FlowStatus::Continue => {
                *waits = 0;
                let cf_payload = ISOTP_CF_PAYLOAD - self.mode.overhead();
                let gap = st_min_duration(st_min);

                let mut frames = Vec::new();
                let mut sent = 0usize;
                while !remaining.is_empty() && (block_size == 0 || sent < block_size as usize) {
                    let take = remaining.len().min(cf_payload);
                    let chunk: Vec<u8> = remaining.drain(..take).collect();
                    let seq = *next_seq;
                    *next_seq = if seq == ISOTP_SEQ_MAX { 0 } else { seq + 1 };
                    sent += 1;
                    frames.push(IsoTpFrame::Consecutive { seq, data: chunk });
                }
                let packed: Vec<Vec<u8>> = frames.iter().map(|f| self.finish(f)).collect();

                let done = match &self.state {
                    State::AwaitingFlowControl { remaining, .. } => remaining.is_empty(),
                    State::Idle => true,
                };
                if done {
                    self.state = State::Idle;
                    debug!("isotp tx complete, {} consecutive frames", packed.len());
                    Ok(TxAction::SendAll {
                        frames: packed,
                        gap,
                    })
                } else {
                    trace!("isotp tx block of {} frames, awaiting next FC", packed.len());
                    Ok(TxAction::SendThenWait {
                        frames: packed,
                        gap,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_goes_as_single_frame() {
        let mut tx = Transmitter::default();
        let action = tx.start(&[0x01, 0x0C]).unwrap();
        assert_eq!(
            action,
            TxAction::SendAll {
                frames: vec![vec![0x02, 0x01, 0x0C]],
                gap: Duration::ZERO
            }
        );
        assert!(!tx.is_active());
    }

    #[test]
    fn long_message_waits_for_flow_control() {
        let mut tx = Transmitter::default();
        let msg: Vec<u8> = (0..20).collect();
        let action = tx.start(&msg).unwrap();
        let TxAction::SendThenWait { frames, .. } = action else {
            panic!("expected first frame");
        };
        assert_eq!(frames[0][0], 0x10);
        assert_eq!(frames[0][1], 20);
        assert!(tx.is_active());

        let action = tx.handle_flow_control(FlowStatus::Continue, 0, 0).unwrap();
        let TxAction::SendAll { frames, .. } = action else {
            panic!("expected consecutive frames");
        };
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 0x21);
        assert_eq!(frames[1][0], 0x22);
        assert!(!tx.is_active());
    }

    #[test]
    fn block_size_paces_consecutive_frames() {
        let mut tx = Transmitter::default();
        let msg = vec![0xAA; 6 + 7 * 5];
        tx.start(&msg).unwrap();

        let TxAction::SendThenWait { frames, .. } =
            tx.handle_flow_control(FlowStatus::Continue, 2, 0).unwrap()
        else {
            panic!("expected a block then wait");
        };
        assert_eq!(frames.len(), 2);
        assert!(tx.is_active());

        let TxAction::SendThenWait { frames, .. } =
            tx.handle_flow_control(FlowStatus::Continue, 2, 0).unwrap()
        else {
            panic!("expected a second block");
        };
        assert_eq!(frames.len(), 2);

        let TxAction::SendAll { frames, .. } =
            tx.handle_flow_control(FlowStatus::Continue, 2, 0).unwrap()
        else {
            panic!("expected final block");
        };
        assert_eq!(frames.len(), 1);
        assert!(!tx.is_active());
    }

    #[test]
    fn st_min_becomes_inter_frame_gap() {
        let mut tx = Transmitter::default();
        tx.start(&vec![0; 20]).unwrap();
        let TxAction::SendAll { gap, .. } =
            tx.handle_flow_control(FlowStatus::Continue, 0, 0x14).unwrap()
        else {
            panic!("expected frames");
        };
        assert_eq!(gap, Duration::from_millis(20));
    }

    #[test]
    fn wait_then_continue() {
        let mut tx = Transmitter::default();
        tx.start(&vec![0; 20]).unwrap();
        assert_eq!(
            tx.handle_flow_control(FlowStatus::Wait, 0, 0).unwrap(),
            TxAction::Hold
        );
        assert_eq!(
            tx.handle_flow_control(FlowStatus::Wait, 0, 0).unwrap(),
            TxAction::Hold
        );
        // Third wait exceeds the default limit of two.
        assert_eq!(
            tx.handle_flow_control(FlowStatus::Wait, 0, 0).unwrap_err(),
            IsoTpError::TooManyWaits
        );
        assert!(!tx.is_active());
    }

    #[test]
    fn overflow_aborts() {
        let mut tx = Transmitter::default();
        tx.start(&vec![0; 20]).unwrap();
        assert_eq!(
            tx.handle_flow_control(FlowStatus::Overflow, 0, 0)
                .unwrap_err(),
            IsoTpError::Overflow
        );
        assert!(!tx.is_active());
    }

    #[test]
    fn unexpected_flow_control_rejected() {
        let mut tx = Transmitter::default();
        assert_eq!(
            tx.handle_flow_control(FlowStatus::Continue, 0, 0)
                .unwrap_err(),
            IsoTpError::UnexpectedFlowControl
        );
    }

    #[test]
    fn sequence_wraps_at_fifteen() {
        let mut tx = Transmitter::default();
        // 6 + 17*7 = 125 bytes: 17 consecutive frames, wrapping 15 -> 0.
        tx.start(&vec![0x55; 125]).unwrap();
        let TxAction::SendAll { frames, .. } =
            tx.handle_flow_control(FlowStatus::Continue, 0, 0).unwrap()
        else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 17);
        assert_eq!(frames[14][0], 0x2F);
        assert_eq!(frames[15][0], 0x20);
        assert_eq!(frames[16][0], 0x21);
    }

    #[test]
    fn extended_addressing_prepends_target() {
        let mut tx = Transmitter::new(AddressMode::Extended(0x33));
        let action = tx.start(&[0x01, 0x05]).unwrap();
        let TxAction::SendAll { frames, .. } = action else {
            panic!("expected single frame");
        };
        assert_eq!(frames[0], vec![0x33, 0x02, 0x01, 0x05]);
    }
}

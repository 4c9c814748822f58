//! Integration tests for the ISO 15765-2 layer: frame codec, inbound
//! reassembly, outbound transmission with flow control, and the
//! byte-stream slicer working together.

use std::time::Duration;

use proptest::prelude::*;

use obdphawd::error::IsoTpError;
use obdphawd::isotp::frame::{decode_frame, pack_frame, st_min_duration};
use obdphawd::isotp::reassembly::{InboundEvent, Reassembler};
use obdphawd::isotp::slicer::FrameSlicer;
use obdphawd::isotp::transmit::{Transmitter, TxAction};
use obdphawd::isotp::{AddressMode, FlowStatus, IsoTpFrame};

/// Tests the canonical single-frame exchange: `01 0C` out, `41 0C ...` in.
#[test]
fn test_single_frame_request_response() {
    let mut tx = Transmitter::default();
    let TxAction::SendAll { frames, .. } = tx.start(&[0x01, 0x0C]).unwrap() else {
        panic!("expected single frame");
    };
    assert_eq!(frames, vec![vec![0x02, 0x01, 0x0C]]);

    let mut rx = Reassembler::default();
    let event = rx
        .handle_frame(decode_frame(&[0x04, 0x41, 0x0C, 0x1A, 0xF8]).unwrap())
        .unwrap();
    assert_eq!(
        event,
        Some(InboundEvent::Message(vec![0x41, 0x0C, 0x1A, 0xF8]))
    );
}

/// Tests a whole VIN reply flowing through slicer and reassembler with
/// the frames split across arbitrary transport chunks.
#[test]
fn test_vin_reassembly_through_slicer() {
    let wire: Vec<u8> = [
        vec![0x10, 0x14, 0x49, 0x02, 0x01, 0x57, 0x30, 0x4C],
        vec![0x21, 0x31, 0x5A, 0x5A, 0x5A, 0x35, 0x34, 0x34],
        vec![0x22, 0x32, 0x33, 0x35, 0x36, 0x37, 0x38, 0x39],
    ]
    .concat();

    let mut slicer = FrameSlicer::new();
    let mut rx = Reassembler::default();
    let mut message = None;

    // Deliver in uneven chunks, as a GATT link would.
    for chunk in wire.chunks(5) {
        slicer.push_bytes(chunk);
        while let Some(buf) = slicer.next_frame(rx.remaining()).unwrap() {
            match rx.handle_frame(decode_frame(&buf).unwrap()).unwrap() {
                Some(InboundEvent::Message(msg)) => message = Some(msg),
                Some(InboundEvent::SendFlowControl(fc)) => {
                    assert!(matches!(
                        fc,
                        IsoTpFrame::FlowControl {
                            status: FlowStatus::Continue,
                            ..
                        }
                    ));
                }
                None => {}
            }
        }
    }

    let message = message.expect("vin message should complete");
    assert_eq!(message.len(), 0x14);
    assert_eq!(&message[..3], &[0x49, 0x02, 0x01]);
    assert_eq!(&message[3..], b"W0L1ZZZ5442356789");
}

/// Tests a full outbound multi-frame transfer against a scripted
/// receiver honoring BS = 2.
#[test]
fn test_outbound_block_pacing_end_to_end() {
    let mut tx = Transmitter::default();
    let msg: Vec<u8> = (0..34).collect();
    let TxAction::SendThenWait { frames, .. } = tx.start(&msg).unwrap() else {
        panic!("expected first frame");
    };
    assert_eq!(frames[0][..2], [0x10, 34]);

    let mut received = frames[0][2..].to_vec();
    let mut blocks = 0;
    loop {
        let action = tx.handle_flow_control(FlowStatus::Continue, 2, 0x05).unwrap();
        blocks += 1;
        let (frames, done) = match action {
            TxAction::SendAll { frames, gap } => {
                assert_eq!(gap, Duration::from_millis(5));
                (frames, true)
            }
            TxAction::SendThenWait { frames, gap } => {
                assert_eq!(gap, Duration::from_millis(5));
                (frames, false)
            }
            TxAction::Hold => panic!("unexpected hold"),
        };
        for frame in &frames {
            received.extend_from_slice(&frame[1..]);
        }
        if done {
            break;
        }
    }
    // 28 bytes after the FF: 4 consecutive frames, in blocks of 2.
    assert_eq!(blocks, 2);
    assert_eq!(received, msg);
}

/// Tests that a wait status pauses without losing the message.
#[test]
fn test_wait_then_continue_preserves_payload() {
    let mut tx = Transmitter::default();
    let msg = vec![0x55; 20];
    tx.start(&msg).unwrap();
    assert_eq!(
        tx.handle_flow_control(FlowStatus::Wait, 0, 0).unwrap(),
        TxAction::Hold
    );
    let TxAction::SendAll { frames, .. } =
        tx.handle_flow_control(FlowStatus::Continue, 0, 0).unwrap()
    else {
        panic!("expected frames after wait");
    };
    let sent: usize = frames.iter().map(|f| f.len() - 1).sum();
    assert_eq!(sent, 20 - 6);
}

/// Tests extended addressing overhead on both directions of the codec.
#[test]
fn test_extended_addressing_capacity() {
    let mut tx = Transmitter::new(AddressMode::Extended(0x33));
    // Seven bytes no longer fit a single frame with the address byte.
    let TxAction::SendThenWait { frames, .. } = tx.start(&[0u8; 7]).unwrap() else {
        panic!("expected segmentation");
    };
    assert_eq!(frames[0][0], 0x33);
    assert_eq!(frames[0][1], 0x10);
}

/// Tests the STmin encoding table edges.
#[test]
fn test_st_min_encoding_edges() {
    assert_eq!(st_min_duration(0x00), Duration::ZERO);
    assert_eq!(st_min_duration(0x7F), Duration::from_millis(127));
    assert_eq!(st_min_duration(0xF1), Duration::from_micros(100));
    assert_eq!(st_min_duration(0x80), Duration::ZERO);
}

/// Tests that an interrupted reassembly reports one error and recovers
/// for the next message.
#[test]
fn test_recovery_after_sequence_gap() {
    let mut rx = Reassembler::default();
    rx.handle_frame(IsoTpFrame::First {
        total_len: 20,
        data: vec![0; 6],
    })
    .unwrap();
    let err = rx
        .handle_frame(IsoTpFrame::Consecutive {
            seq: 3,
            data: vec![0; 7],
        })
        .unwrap_err();
    assert!(matches!(err, IsoTpError::SequenceError { expected: 1, actual: 3 }));

    // A fresh single frame goes through untouched.
    let event = rx
        .handle_frame(IsoTpFrame::Single {
            data: vec![0x41, 0x00],
        })
        .unwrap();
    assert_eq!(event, Some(InboundEvent::Message(vec![0x41, 0x00])));
}

proptest! {
    /// Any transmitted message reassembles to itself when every frame is
    /// relayed in order with permissive flow control.
    #[test]
    fn prop_transmit_reassemble_round_trip(msg in proptest::collection::vec(any::<u8>(), 1..=400)) {
        let mut tx = Transmitter::default();
        let mut rx = Reassembler::default();
        let mut out = None;

        let mut feed = |frames: &[Vec<u8>], rx: &mut Reassembler, out: &mut Option<Vec<u8>>| {
            for frame in frames {
                if let Some(InboundEvent::Message(m)) =
                    rx.handle_frame(decode_frame(frame).unwrap()).unwrap()
                {
                    *out = Some(m);
                }
            }
        };

        match tx.start(&msg).unwrap() {
            TxAction::SendAll { frames, .. } => feed(&frames, &mut rx, &mut out),
            TxAction::SendThenWait { frames, .. } => {
                feed(&frames, &mut rx, &mut out);
                loop {
                    match tx.handle_flow_control(FlowStatus::Continue, 0, 0).unwrap() {
                        TxAction::SendAll { frames, .. } => {
                            feed(&frames, &mut rx, &mut out);
                            break;
                        }
                        TxAction::SendThenWait { frames, .. } => feed(&frames, &mut rx, &mut out),
                        TxAction::Hold => unreachable!("continue never holds"),
                    }
                }
            }
            TxAction::Hold => unreachable!("start never holds"),
        }

        prop_assert_eq!(out.expect("message must complete"), msg);
    }

    /// Packing then decoding any flow control frame is lossless.
    #[test]
    fn prop_flow_control_pack_decode(bs in any::<u8>(), st in any::<u8>()) {
        let frame = IsoTpFrame::FlowControl {
            status: FlowStatus::Continue,
            block_size: bs,
            st_min: st,
        };
        prop_assert_eq!(decode_frame(&pack_frame(&frame)).unwrap(), frame);
    }
}

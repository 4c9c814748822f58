//! # Byte-Stream Frame Slicer
//!
//! The byte-channel transports (GATT notifications, serial) preserve
//! ordering but not frame boundaries. This slicer accumulates inbound
//! bytes and cuts ISO-TP frames out of them using the PCI-derived
//! lengths: a single frame is `1 + L` bytes, a first frame always
//! carries its full six data bytes, a flow control frame is three bytes,
//! and a consecutive frame's length comes from the reassembler's count
//! of bytes still expected (consecutive frames on a byte channel are
//! packed without padding).

use std::collections::VecDeque;

use crate::constants::{ISOTP_CF_PAYLOAD, ISOTP_FRAME_LEN, ISOTP_PCI_CONSECUTIVE,
    ISOTP_PCI_FIRST, ISOTP_PCI_FLOW_CONTROL, ISOTP_PCI_SINGLE, ISOTP_SF_MAX_NORMAL};
use crate::error::IsoTpError;

/// Accumulates raw transport bytes and yields whole frame buffers.
#[derive(Debug, Default)]
pub struct FrameSlicer {
    buf: VecDeque<u8>,
}

impl FrameSlicer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk received from the transport.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk);
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops buffered bytes, e.g. after a reassembly reset.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Cuts the next frame out of the buffer. `cf_remaining` is the
    /// reassembler's count of outstanding message bytes, used to size a
    /// consecutive frame; `None` while no multi-frame receive is active.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self, cf_remaining: Option<usize>) -> Result<Option<Vec<u8>>, IsoTpError> {
        let Some(&pci) = self.buf.front() else {
            return Ok(None);
        };

        let need = match pci >> 4 {
            ISOTP_PCI_SINGLE => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len > ISOTP_SF_MAX_NORMAL {
                    self.buf.pop_front();
                    return Err(IsoTpError::InvalidPci(pci));
                }
                1 + len
            }
            ISOTP_PCI_FIRST => ISOTP_FRAME_LEN,
            ISOTP_PCI_CONSECUTIVE => match cf_remaining {
                Some(remaining) if remaining > 0 => 1 + remaining.min(ISOTP_CF_PAYLOAD),
                _ => {
                    // Stray consecutive frame with nothing in progress:
                    // drop the PCI byte and report it once.
                    self.buf.pop_front();
                    return Err(IsoTpError::UnexpectedConsecutive);
                }
            },
            ISOTP_PCI_FLOW_CONTROL => 3,
            _ => {
                self.buf.pop_front();
                return Err(IsoTpError::InvalidPci(pci));
            }
        };

        if self.buf.len() < need {
            return Ok(None);
        }
        Ok(Some(self.buf.drain(..need).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_single_frame_across_chunks() {
        let mut slicer = FrameSlicer::new();
        slicer.push_bytes(&[0x03, 0x41]);
        assert_eq!(slicer.next_frame(None).unwrap(), None);
        slicer.push_bytes(&[0x0C, 0x1A]);
        assert_eq!(
            slicer.next_frame(None).unwrap(),
            Some(vec![0x03, 0x41, 0x0C, 0x1A])
        );
        assert!(slicer.is_empty());
    }

    #[test]
    fn slices_coalesced_frames() {
        let mut slicer = FrameSlicer::new();
        // FF (8 bytes) followed immediately by an FC echo.
        slicer.push_bytes(&[0x10, 0x14, 0x49, 0x02, 0x01, 0x57, 0x30, 0x4C, 0x30, 0x00, 0x00]);
        assert_eq!(
            slicer.next_frame(None).unwrap(),
            Some(vec![0x10, 0x14, 0x49, 0x02, 0x01, 0x57, 0x30, 0x4C])
        );
        assert_eq!(
            slicer.next_frame(None).unwrap(),
            Some(vec![0x30, 0x00, 0x00])
        );
    }

    #[test]
    fn consecutive_length_follows_hint() {
        let mut slicer = FrameSlicer::new();
        slicer.push_bytes(&[0x21, 0xAA, 0xBB, 0xCC]);
        // Only three message bytes outstanding: the CF is four bytes long.
        assert_eq!(
            slicer.next_frame(Some(3)).unwrap(),
            Some(vec![0x21, 0xAA, 0xBB, 0xCC])
        );
    }

    #[test]
    fn full_consecutive_frame_with_large_remainder() {
        let mut slicer = FrameSlicer::new();
        slicer.push_bytes(&[0x21, 1, 2, 3, 4, 5, 6, 7, 0x22]);
        assert_eq!(
            slicer.next_frame(Some(14)).unwrap(),
            Some(vec![0x21, 1, 2, 3, 4, 5, 6, 7])
        );
        assert_eq!(slicer.len(), 1);
    }

    #[test]
    fn stray_consecutive_frame_reported() {
        let mut slicer = FrameSlicer::new();
        slicer.push_bytes(&[0x21, 0xAA]);
        assert_eq!(
            slicer.next_frame(None).unwrap_err(),
            IsoTpError::UnexpectedConsecutive
        );
    }

    #[test]
    fn invalid_pci_skips_byte() {
        let mut slicer = FrameSlicer::new();
        slicer.push_bytes(&[0x90, 0x02, 0x41, 0x05]);
        assert_eq!(slicer.next_frame(None).unwrap_err(), IsoTpError::InvalidPci(0x90));
        // Recovery: the following single frame still parses.
        assert_eq!(
            slicer.next_frame(None).unwrap(),
            Some(vec![0x02, 0x41, 0x05])
        );
    }
}

//! Addressing modes and CAN response identifier classification for
//! ISO 15765-4 diagnostics.

use crate::constants::{
    CAN_ID_RESPONSE_11BIT_BASE, CAN_ID_RESPONSE_11BIT_MAX, CAN_ID_RESPONSE_29BIT_PREFIX,
};

/// Normal addressing, or extended addressing with a target address byte
/// prepended to every frame (costs one payload byte per frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Normal,
    Extended(u8),
}

impl AddressMode {
    /// Per-frame payload overhead in bytes.
    pub fn overhead(&self) -> usize {
        match self {
            AddressMode::Normal => 0,
            AddressMode::Extended(_) => 1,
        }
    }
}

/// True when `id` is an OBD-II diagnostic response identifier, 11-bit
/// (0x7E8-0x7EF) or 29-bit (0x18DAF1xx).
pub fn is_response_id(id: u32) -> bool {
    (CAN_ID_RESPONSE_11BIT_BASE..=CAN_ID_RESPONSE_11BIT_MAX).contains(&id)
        || (id & 0xFFFF_FF00) == CAN_ID_RESPONSE_29BIT_PREFIX
}

/// ECU index for a response identifier (0-7 for 11-bit, source address
/// for 29-bit).
pub fn responding_ecu(id: u32) -> Option<u8> {
    if (CAN_ID_RESPONSE_11BIT_BASE..=CAN_ID_RESPONSE_11BIT_MAX).contains(&id) {
        Some((id - CAN_ID_RESPONSE_11BIT_BASE) as u8)
    } else if (id & 0xFFFF_FF00) == CAN_ID_RESPONSE_29BIT_PREFIX {
        Some((id & 0xFF) as u8)
    } else {
        None
    }
}

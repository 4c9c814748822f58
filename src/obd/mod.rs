//! The obd module contains the pure OBD-II codec: request encoding,
//! response decoding through the SAE J1979 formula table, diagnostic
//! trouble code handling, and the typed value model.

pub mod codec;
pub mod dtc;
pub mod pids;

pub use codec::{
    decode_response, encode_request, match_response, negative_response, DecodedValue, ObdRequest,
    Pid, Unit,
};
pub use dtc::{decode_dtcs, format_dtc};
pub use pids::{pid_descriptor, supported_pids_from_bitmap, MonitorStatus, PidDescriptor};

//! The isotp module implements ISO 15765-2 segmentation: frame parsing
//! and packing, the inbound reassembly state machine, the outbound
//! transmit state machine with flow control, addressing helpers, and a
//! byte-stream slicer for transports that do not preserve frame
//! boundaries.

pub mod address;
pub mod frame;
pub mod reassembly;
pub mod slicer;
pub mod transmit;

pub use address::{AddressMode, is_response_id, responding_ecu};
pub use frame::{decode_frame, pack_frame, parse_frame, FlowStatus, IsoTpFrame};
pub use reassembly::{InboundEvent, Reassembler};
pub use slicer::FrameSlicer;
pub use transmit::{Transmitter, TxAction};

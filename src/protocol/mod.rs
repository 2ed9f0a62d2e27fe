//! Protocol module - wire format, framing, and option negotiation.
//!
//! This module implements the milter wire protocol:
//! - 4-byte length prefix encoding/decoding and protocol constants
//! - Frame encoding and multi-frame packet parsing
//! - Frame buffer for reassembling partial reads
//! - OPTNEG handling and per-command dispatch plans

mod frame;
mod frame_buffer;
mod optneg;
mod wire_format;

pub use frame::{encode_frame, parse_packet, split_nul, Command, Packet, PartialHeader};
pub use frame_buffer::{reassemble, FrameBuffer, ReassemblyState};
pub use optneg::{Dispatch, Negotiated, OptNeg, Side};
pub use wire_format::{
    actions, command, decode_length, encode_length, protocol, reply, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE, MILTER_CHUNK_SIZE, MILTER_VERSION, OPTNEG_BODY_SIZE,
};

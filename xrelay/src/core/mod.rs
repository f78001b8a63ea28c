//! Core data structures for the relay.
//!
//! This module contains the pure, I/O-free building blocks:
//! - Frame: length-prefixed wire format and its codec
//! - Packet: packet batches, protocol tags and IPv4 header inspection

mod frame;
mod packet;

pub use frame::{decode_header, encode, encode_into, FrameCodec, FRAME_HEADER_SIZE};
pub use packet::{Ipv4Header, PacketBatch, Protocol};

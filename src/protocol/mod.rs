//! Protocol module - the wire unit and stream framing.
//!
//! - [`Packet`] is the atomic wire unit, a symmetric msgpack tuple that
//!   serves both directions of the connection
//! - [`FrameBuffer`] reassembles packets from arbitrarily fragmented
//!   transport reads

mod frame_buffer;
mod packet;

pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_PACKET_SIZE};
pub use packet::{fault_from_value, fault_to_value, write_packet, Packet};

//! Frame buffer for accumulating partial reads.
//!
//! Nothing guarantees a transport delivers exactly one packet per read:
//! a single read may carry half a packet, or three and a half. The frame
//! buffer absorbs that by appending every chunk to one `BytesMut` and
//! draining as many complete msgpack values as the buffer holds.
//!
//! MessagePack values are self-delimiting, so "is a frame complete?" is
//! answered by attempting a decode: a truncated value fails with an
//! `UnexpectedEof`, which is a "need more data" signal and not an error.
//!
//! # Example
//!
//! ```
//! use wirecall::protocol::{FrameBuffer, Packet};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = Packet::request(None, "ping", vec![]).encode().unwrap();
//!
//! // Data arrives in arbitrary chunks from the transport.
//! assert!(buffer.push(&bytes[..1]).unwrap().is_empty());
//! let packets = buffer.push(&bytes[1..]).unwrap();
//! assert_eq!(packets.len(), 1);
//! ```

use bytes::BytesMut;

use super::Packet;
use crate::error::{Error, Result};

/// Default maximum size of a single encoded packet (1 GB).
///
/// Large enough to be "effectively unbounded" for the baseline design;
/// the guard exists so a stream that never completes a frame fails with
/// a protocol error instead of growing the buffer forever.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1_073_741_824;

/// Buffer for accumulating incoming bytes and extracting complete packets.
///
/// Bytes are consumed exactly once and never silently dropped; leftover
/// bytes of a partial frame stay buffered for the next push.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Maximum allowed size of one encoded packet.
    max_packet_size: usize,
}

impl FrameBuffer {
    /// Create a frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Create a frame buffer with a custom packet size limit.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_packet_size,
        }
    }

    /// Push a chunk and extract every complete packet.
    ///
    /// Returns the decoded packets in arrival order; the vector is empty
    /// when the buffer still holds only a partial frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the stream is malformed (undecodable bytes,
    /// an invalid packet tuple, or a single frame exceeding the size
    /// limit). Such a stream cannot be re-synchronized and the
    /// connection should be torn down.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(value) = self.try_decode_one()? {
            packets.push(Packet::from_value(value)?);
        }

        Ok(packets)
    }

    /// Try to decode a single msgpack value from the front of the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(value))` if a complete value was consumed
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the stream is malformed or the frame is oversized
    fn try_decode_one(&mut self) -> Result<Option<rmpv::Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(&self.buffer[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                let _ = self.buffer.split_to(consumed);
                Ok(Some(value))
            }
            Err(err) if is_incomplete(&err) => {
                if self.buffer.len() > self.max_packet_size {
                    return Err(Error::Protocol(format!(
                        "packet exceeds maximum size {} ({} bytes buffered)",
                        self.max_packet_size,
                        self.buffer.len()
                    )));
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Number of buffered bytes awaiting a complete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A decode failure caused by running out of bytes mid-value.
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io)
        | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

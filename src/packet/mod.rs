//! The unit of transport: a header plus optional content.
//!
//! Packets flow through a process-wide pool ([`get`] / [`put`]) so the
//! content buffers of high-throughput connections are recycled instead of
//! reallocated per frame. The transport hands every successfully decoded
//! inbound packet to user code exactly once; returning it to the pool is the
//! receiver's job (dropping it instead is always safe, just unpooled).

mod pool;

pub use pool::{get, put};

use bytes::BytesMut;

use crate::protocol::Metadata;

/// A single transport packet: decoded header plus content bytes.
///
/// The invariant `metadata.content_length == content.len() as u32` is
/// enforced at the API boundary: [`AsyncConn::write_packet`] rejects packets
/// that violate it, and the read loop only ever constructs packets that
/// satisfy it.
///
/// [`AsyncConn::write_packet`]: crate::AsyncConn::write_packet
#[derive(Debug, Default)]
pub struct Packet {
    /// Packet header.
    pub metadata: Metadata,
    /// Content bytes; observed length must equal `metadata.content_length`.
    pub content: BytesMut,
}

impl Packet {
    /// Create an empty packet with no content capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero the header and clear the content, keeping the content buffer's
    /// capacity for reuse.
    pub fn reset(&mut self) {
        self.metadata = Metadata::default();
        self.content.clear();
    }

    /// Replace the content with `data` and set the declared content length
    /// to match.
    pub fn set_content(&mut self, data: &[u8]) {
        self.content.clear();
        self.content.extend_from_slice(data);
        self.metadata.content_length = data.len() as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_capacity() {
        let mut packet = Packet::new();
        packet.set_content(&[0xAB; 256]);
        packet.metadata.id = 42;

        let capacity = packet.content.capacity();
        packet.reset();

        assert_eq!(packet.metadata, Metadata::default());
        assert!(packet.content.is_empty());
        assert_eq!(packet.content.capacity(), capacity);
    }

    #[test]
    fn test_set_content_updates_length() {
        let mut packet = Packet::new();
        packet.set_content(b"hello");
        assert_eq!(packet.metadata.content_length, 5);
        assert_eq!(&packet.content[..], b"hello");

        packet.set_content(b"hi");
        assert_eq!(packet.metadata.content_length, 2);
        assert_eq!(&packet.content[..], b"hi");
    }
}

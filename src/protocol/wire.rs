//! Wire format encoding and decoding.
//!
//! Implements the 16-byte header format:
//! ```text
//! ┌──────────┬───────────┬────────────────┬──────────┐
//! │ Id       │ Operation │ Content Length │ Reserved │
//! │ 2 bytes  │ 2 bytes   │ 4 bytes        │ 8 bytes  │
//! │ uint16 BE│ uint16 BE │ uint32 BE      │ zeroed   │
//! └──────────┴───────────┴────────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The reserved bytes are written as
//! zero and ignored on read; the full 16 bytes are always consumed so frames
//! stay byte-exact on the wire.

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Maximum allowed content length (1 GiB). A header declaring more is
/// treated as corrupt framing and is fatal for the connection.
pub const MAX_CONTENT_LENGTH: u32 = 1 << 30;

/// Operations at or above this value are reserved for framework use.
pub const RESERVED: u16 = 0xFFF0;

/// Reserved operation: liveness probe request.
pub const PING: u16 = 0xFFF1;

/// Reserved operation: liveness probe response.
pub const PONG: u16 = 0xFFF2;

/// Reserved operation: negotiation probe preceding a raw-stream handoff.
pub const PROBE: u16 = 0xFFF3;

const ID_OFFSET: usize = 0;
const OPERATION_OFFSET: usize = 2;
const CONTENT_LENGTH_OFFSET: usize = 4;

/// Decoded packet header.
///
/// `id` is opaque to the transport and echoed through as-is. `operation` is
/// the routing key a dispatch loop uses to pick a handler. `content_length`
/// must equal the byte count of the content that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Caller-defined identifier, passed through untouched.
    pub id: u16,
    /// Routing key within a connection.
    pub operation: u16,
    /// Exact byte count of the content following the header.
    pub content_length: u32,
}

impl Metadata {
    /// Create a new header.
    pub fn new(id: u16, operation: u16, content_length: u32) -> Self {
        Self {
            id,
            operation,
            content_length,
        }
    }

    /// Encode the header to bytes (Big Endian, reserved bytes zeroed).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[ID_OFFSET..OPERATION_OFFSET].copy_from_slice(&self.id.to_be_bytes());
        buf[OPERATION_OFFSET..CONTENT_LENGTH_OFFSET].copy_from_slice(&self.operation.to_be_bytes());
        buf[CONTENT_LENGTH_OFFSET..CONTENT_LENGTH_OFFSET + 4]
            .copy_from_slice(&self.content_length.to_be_bytes());
        buf[CONTENT_LENGTH_OFFSET + 4..HEADER_SIZE].fill(0);
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBufferLength`] if fewer than [`HEADER_SIZE`]
    /// bytes are supplied, and [`Error::InvalidBufferContents`] if the
    /// declared content length exceeds [`MAX_CONTENT_LENGTH`]. Both are
    /// fatal framing errors for a live connection.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidBufferLength);
        }

        let id = u16::from_be_bytes([buf[ID_OFFSET], buf[ID_OFFSET + 1]]);
        let operation = u16::from_be_bytes([buf[OPERATION_OFFSET], buf[OPERATION_OFFSET + 1]]);
        let content_length = u32::from_be_bytes([
            buf[CONTENT_LENGTH_OFFSET],
            buf[CONTENT_LENGTH_OFFSET + 1],
            buf[CONTENT_LENGTH_OFFSET + 2],
            buf[CONTENT_LENGTH_OFFSET + 3],
        ]);

        if content_length > MAX_CONTENT_LENGTH {
            return Err(Error::InvalidBufferContents);
        }

        Ok(Self {
            id,
            operation,
            content_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let metadata = Metadata::new(0x1234, 0xABCD, 0x00010002);
        let encoded = metadata.encode();

        assert_eq!(&encoded[0..2], &[0x12, 0x34]); // id (BE)
        assert_eq!(&encoded[2..4], &[0xAB, 0xCD]); // operation (BE)
        assert_eq!(&encoded[4..8], &[0x00, 0x01, 0x00, 0x02]); // content_length (BE)
        assert_eq!(&encoded[8..16], &[0u8; 8]); // reserved, zeroed
    }

    #[test]
    fn test_roundtrip() {
        let metadata = Metadata::new(99, PING, 512);
        let decoded = Metadata::decode(&metadata.encode()).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_decode_zero_header() {
        let decoded = Metadata::decode(&[0u8; HEADER_SIZE]).unwrap();
        assert_eq!(decoded, Metadata::default());
    }

    #[test]
    fn test_decode_ignores_reserved_bytes() {
        let mut encoded = Metadata::new(7, 8, 9).encode();
        encoded[8..16].fill(0xFF);
        let decoded = Metadata::decode(&encoded).unwrap();
        assert_eq!(decoded, Metadata::new(7, 8, 9));
    }

    #[test]
    fn test_decode_short_buffer() {
        let result = Metadata::decode(&[0u8; HEADER_SIZE - 1]);
        assert!(matches!(result, Err(Error::InvalidBufferLength)));
    }

    #[test]
    fn test_decode_oversized_content_length() {
        let metadata = Metadata::new(1, 2, MAX_CONTENT_LENGTH + 1);
        let result = Metadata::decode(&metadata.encode());
        assert!(matches!(result, Err(Error::InvalidBufferContents)));
    }

    #[test]
    fn test_reserved_operations_at_top_of_range() {
        assert!(PING >= RESERVED);
        assert!(PONG >= RESERVED);
        assert!(PROBE >= RESERVED);
    }

    #[test]
    fn test_encode_into_overwrites_stale_reserved_bytes() {
        let mut buf = [0xEEu8; HEADER_SIZE];
        Metadata::new(1, 2, 3).encode_into(&mut buf);
        assert_eq!(&buf[8..16], &[0u8; 8]);
    }
}

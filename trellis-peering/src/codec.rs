//! Wire frame codec.
//!
//! Every peering message travels as one frame:
//!
//! ```text
//! [flags u8][length u32 BE][payload]
//! ```
//!
//! The only defined flag is COMMAND; reserved bits must be zero. Payloads
//! carry a verb + property encoding (see `command`).

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use thiserror::Error;

/// Frame carries a protocol command (the only frame kind in use).
pub const FLAG_COMMAND: u8 = 0x04;

/// Upper bound on a frame payload. A full-sync update for a large mesh
/// stays far below this; anything bigger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header: flags byte plus 32-bit big-endian payload length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Protocol violation: reserved bits set")]
    ReservedBits,

    #[error("Protocol violation: frame size too large")]
    SizeTooLarge,

    #[error("Protocol violation")]
    Protocol,

    #[error("Unknown verb: {0}")]
    UnknownVerb(String),
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    #[inline]
    pub const fn is_command(&self) -> bool {
        (self.flags & FLAG_COMMAND) != 0
    }
}

/// Stateful frame decoder.
///
/// Callers append received bytes to one `BytesMut` and call `decode`
/// until it returns `None`; partial frames stay buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    _private: (),
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single frame from `src`.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` → frame decoded, bytes consumed
    /// - `Ok(None)` → need more data
    /// - `Err` → protocol violation
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let flags = src[0];
        if (flags & !FLAG_COMMAND) != 0 {
            return Err(WireError::ReservedBits);
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::SizeTooLarge);
        }

        if src.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { flags, payload }))
    }
}

/// Encode a command payload into a full frame.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    b.extend_from_slice(&[FLAG_COMMAND]);
    b.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    b.extend_from_slice(payload);
    b.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_roundtrip() {
        let frame = encode_frame(b"hello");
        let mut src = BytesMut::from(&frame[..]);
        let decoded = FrameDecoder::new().decode(&mut src).unwrap().unwrap();
        assert!(decoded.is_command());
        assert_eq!(&decoded.payload[..], b"hello");
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let frame = encode_frame(b"hello");
        let mut decoder = FrameDecoder::new();
        let mut src = BytesMut::from(&frame[..3]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&frame[3..]);
        assert!(decoder.decode(&mut src).unwrap().is_some());
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&encode_frame(b"one"));
        src.extend_from_slice(&encode_frame(b"two"));
        let mut decoder = FrameDecoder::new();
        assert_eq!(&decoder.decode(&mut src).unwrap().unwrap().payload[..], b"one");
        assert_eq!(&decoder.decode(&mut src).unwrap().unwrap().payload[..], b"two");
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut src = BytesMut::from(&[0x80u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut src),
            Err(WireError::ReservedBits)
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = vec![FLAG_COMMAND];
        header.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut src = BytesMut::from(&header[..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut src),
            Err(WireError::SizeTooLarge)
        ));
    }
}

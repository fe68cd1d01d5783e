//! # Frame Codec
//!
//! Deterministic, bit-exact conversion between a [`Frame`] and its byte layout.
//! The codec only understands the common header; payload layouts are handled by
//! [`crate::protocol::message`].
//!
//! ## Decode Failures (`FrameError`):
//! - Fewer than 5 bytes (tag + session id length)
//! - Declared session id length larger than the remaining bytes
//! - A length field with the sign bit set (negative when read as i32)

use crate::protocol::MessageType;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Tag byte plus the u32 session id length.
pub const HEADER_LEN: usize = 1 + 4;

/// Reasons a byte sequence could not be turned into a frame or payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("message too short: {len} bytes, need at least 5")]
    TooShort { len: usize },

    #[error("session id length {declared} exceeds remaining {remaining} bytes")]
    SessionIdOverflow { declared: usize, remaining: usize },

    #[error("{field} length is negative ({value})")]
    NegativeLength { field: &'static str, value: i32 },

    #[error("{message_type} payload too short: {len} bytes, need at least {needed}")]
    PayloadTooShort {
        message_type: MessageType,
        len: usize,
        needed: usize,
    },

    #[error("unknown message type 0x{0:02X}")]
    UnknownType(u8),
}

/// One protocol message: type tag, session id and raw payload.
///
/// The tag is kept as the raw byte so frames with unknown tags still decode;
/// the dispatcher logs and drops those instead of treating them as malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: u8,
    session_id: String,
    payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, session_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::from_raw(message_type.as_byte(), session_id, payload)
    }

    /// Build a frame from a raw tag byte (used for unknown or future tags).
    pub fn from_raw(tag: u8, session_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            session_id: session_id.into(),
            payload: payload.into(),
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// The typed tag, or `None` when the byte is not a known message type.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_byte(self.tag)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serialize to the wire layout.
    ///
    /// Lengths are written as u32; session ids and payload sections are
    /// expected to stay well below 4 GiB.
    pub fn encode(&self) -> Bytes {
        let session_bytes = self.session_id.as_bytes();
        let mut out = BytesMut::with_capacity(HEADER_LEN + session_bytes.len() + self.payload.len());
        out.put_u8(self.tag);
        out.put_u32_le(session_bytes.len() as u32);
        out.put_slice(session_bytes);
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Parse the common header and keep everything after the session id as payload.
    ///
    /// ## Rust Concepts:
    /// - **Cursor**: Reads the slice like a file, tracking the current offset
    /// - **ReadBytesExt**: byteorder's little-endian readers on top of `Read`
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort { len: bytes.len() });
        }

        let mut cursor = Cursor::new(bytes);
        let tag = cursor
            .read_u8()
            .map_err(|_| FrameError::TooShort { len: bytes.len() })?;
        let session_len = read_length(&mut cursor, "session id")?;

        let offset = cursor.position() as usize;
        let remaining = bytes.len() - offset;
        if session_len > remaining {
            return Err(FrameError::SessionIdOverflow {
                declared: session_len,
                remaining,
            });
        }

        // Client-supplied ids are informational, so invalid UTF-8 is tolerated
        let session_id = String::from_utf8_lossy(&bytes[offset..offset + session_len]).into_owned();
        let payload = Bytes::copy_from_slice(&bytes[offset + session_len..]);

        Ok(Self {
            tag,
            session_id,
            payload,
        })
    }
}

/// Read a u32 length field, rejecting values that would be negative as i32.
pub(crate) fn read_length(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<usize, FrameError> {
    let raw = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| FrameError::TooShort {
            len: cursor.get_ref().len(),
        })?;

    if raw > i32::MAX as u32 {
        return Err(FrameError::NegativeLength {
            field,
            value: raw as i32,
        });
    }

    Ok(raw as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_type() {
        let payloads: [&[u8]; 3] = [b"", &[1, 2, 3], &[0xFF; 300]];

        for message_type in MessageType::ALL {
            for payload in payloads {
                let bytes = Frame::new(message_type, "session-abc", payload.to_vec()).encode();
                let frame = Frame::decode(&bytes).unwrap();
                assert_eq!(frame.message_type(), Some(message_type));
                assert_eq!(frame.session_id(), "session-abc");
                assert_eq!(frame.payload().as_ref(), payload);
            }
        }
    }

    #[test]
    fn test_exact_layout() {
        let bytes = Frame::new(MessageType::AudioEnd, "s1", Bytes::new()).encode();
        assert_eq!(bytes.as_ref(), &[0x02, 2, 0, 0, 0, b's', b'1']);

        let frame = Frame::new(MessageType::ProcessingStarted, "", Bytes::new());
        assert_eq!(frame.encode().as_ref(), &[0x10, 0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_input_is_malformed() {
        assert_eq!(Frame::decode(&[]), Err(FrameError::TooShort { len: 0 }));
    }

    #[test]
    fn test_header_shorter_than_five_bytes() {
        assert_eq!(
            Frame::decode(&[0x01, 0, 0, 0]),
            Err(FrameError::TooShort { len: 4 })
        );
    }

    #[test]
    fn test_session_id_overflow() {
        // Declares a 10 byte session id but only carries 3
        let bytes = [0x01, 10, 0, 0, 0, b'a', b'b', b'c'];
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::SessionIdOverflow {
                declared: 10,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_negative_session_length() {
        let bytes = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0];
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::NegativeLength {
                field: "session id",
                value: -1
            })
        );
    }

    #[test]
    fn test_unknown_tag_still_decodes() {
        let bytes = Frame::from_raw(0x42, "s1", vec![9u8]).encode();
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.tag(), 0x42);
        assert_eq!(frame.message_type(), None);
        assert_eq!(frame.payload().as_ref(), &[9]);
    }

    #[test]
    fn test_invalid_utf8_session_id_is_tolerated() {
        let bytes = [0x02, 2, 0, 0, 0, 0xC3, 0x28];
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::AudioEnd));
        assert!(!frame.session_id().is_empty());
    }
}

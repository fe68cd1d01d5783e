//! # Typed Payloads
//!
//! Maps each [`MessageType`] to its payload layout. A [`Message`] plus a session
//! id is everything needed to produce a frame.
//!
//! ## Lenient Audio Lengths:
//! Chunk-shaped payloads (`AudioChunk`, `AudioResponseChunk`) whose declared
//! audio length is larger than what actually arrived are accepted and cut down
//! to `min(declared, available)`. Partial writes from a client therefore shorten
//! a chunk instead of failing the whole frame.

use crate::protocol::frame::{read_length, Frame, FrameError};
use crate::protocol::MessageType;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// A decoded protocol message with its payload fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AudioChunk { audio: Bytes },
    AudioEnd,
    ProcessingStarted,
    TextResponse { text: String },
    AudioResponseStart,
    AudioResponseChunk {
        chunk_index: u32,
        is_last: bool,
        audio: Bytes,
    },
    AudioResponseEnd,
    ProcessingComplete,
    Error { message: String },
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AudioChunk { .. } => MessageType::AudioChunk,
            Message::AudioEnd => MessageType::AudioEnd,
            Message::ProcessingStarted => MessageType::ProcessingStarted,
            Message::TextResponse { .. } => MessageType::TextResponse,
            Message::AudioResponseStart => MessageType::AudioResponseStart,
            Message::AudioResponseChunk { .. } => MessageType::AudioResponseChunk,
            Message::AudioResponseEnd => MessageType::AudioResponseEnd,
            Message::ProcessingComplete => MessageType::ProcessingComplete,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Serialize only the payload section.
    pub fn payload(&self) -> Bytes {
        match self {
            Message::AudioChunk { audio } => length_prefixed(audio),
            Message::TextResponse { text } => length_prefixed(text.as_bytes()),
            Message::Error { message } => length_prefixed(message.as_bytes()),
            Message::AudioResponseChunk {
                chunk_index,
                is_last,
                audio,
            } => {
                let mut out = BytesMut::with_capacity(4 + 1 + 4 + audio.len());
                out.put_u32_le(*chunk_index);
                out.put_u8(u8::from(*is_last));
                out.put_u32_le(audio.len() as u32);
                out.put_slice(audio);
                out.freeze()
            }
            Message::AudioEnd
            | Message::ProcessingStarted
            | Message::AudioResponseStart
            | Message::AudioResponseEnd
            | Message::ProcessingComplete => Bytes::new(),
        }
    }

    /// Full wire bytes for this message addressed to `session_id`.
    pub fn encode(&self, session_id: &str) -> Bytes {
        self.to_frame(session_id).encode()
    }

    pub fn to_frame(&self, session_id: &str) -> Frame {
        Frame::new(self.message_type(), session_id, self.payload())
    }

    /// Interpret a frame's payload according to its tag.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        let message_type = frame
            .message_type()
            .ok_or(FrameError::UnknownType(frame.tag()))?;
        let payload = frame.payload();

        let message = match message_type {
            MessageType::AudioChunk => Message::AudioChunk {
                audio: parse_audio_chunk(payload)?,
            },
            MessageType::AudioEnd => Message::AudioEnd,
            MessageType::ProcessingStarted => Message::ProcessingStarted,
            MessageType::TextResponse => Message::TextResponse {
                text: parse_text(payload, message_type)?,
            },
            MessageType::AudioResponseStart => Message::AudioResponseStart,
            MessageType::AudioResponseChunk => parse_response_chunk(payload)?,
            MessageType::AudioResponseEnd => Message::AudioResponseEnd,
            MessageType::ProcessingComplete => Message::ProcessingComplete,
            MessageType::Error => Message::Error {
                message: parse_text(payload, message_type)?,
            },
        };

        Ok(message)
    }

    /// Decode wire bytes straight into a message, returning the carried session id too.
    pub fn decode(bytes: &[u8]) -> Result<(String, Self), FrameError> {
        let frame = Frame::decode(bytes)?;
        let message = Self::from_frame(&frame)?;
        Ok((frame.session_id().to_string(), message))
    }
}

fn length_prefixed(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + data.len());
    out.put_u32_le(data.len() as u32);
    out.put_slice(data);
    out.freeze()
}

/// `audioLen:u32, audioBytes[audioLen]` with lenient truncation.
pub fn parse_audio_chunk(payload: &Bytes) -> Result<Bytes, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::PayloadTooShort {
            message_type: MessageType::AudioChunk,
            len: payload.len(),
            needed: 4,
        });
    }

    let mut cursor = Cursor::new(payload.as_ref());
    let declared = read_length(&mut cursor, "audio")?;
    let start = cursor.position() as usize;
    Ok(take_lenient(payload, start, declared))
}

fn parse_response_chunk(payload: &Bytes) -> Result<Message, FrameError> {
    const FIXED: usize = 4 + 1 + 4;
    if payload.len() < FIXED {
        return Err(FrameError::PayloadTooShort {
            message_type: MessageType::AudioResponseChunk,
            len: payload.len(),
            needed: FIXED,
        });
    }

    let mut cursor = Cursor::new(payload.as_ref());
    let too_short = |_: std::io::Error| FrameError::PayloadTooShort {
        message_type: MessageType::AudioResponseChunk,
        len: payload.len(),
        needed: FIXED,
    };
    // The index is a plain counter, so the full u32 range is valid
    let chunk_index = cursor.read_u32::<LittleEndian>().map_err(too_short)?;
    let is_last = cursor.read_u8().map_err(too_short)? != 0;
    let declared = read_length(&mut cursor, "audio")?;
    let start = cursor.position() as usize;

    Ok(Message::AudioResponseChunk {
        chunk_index,
        is_last,
        audio: take_lenient(payload, start, declared),
    })
}

fn parse_text(payload: &Bytes, message_type: MessageType) -> Result<String, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::PayloadTooShort {
            message_type,
            len: payload.len(),
            needed: 4,
        });
    }

    let mut cursor = Cursor::new(payload.as_ref());
    let declared = read_length(&mut cursor, "text")?;
    let start = cursor.position() as usize;
    if start + declared > payload.len() {
        return Err(FrameError::PayloadTooShort {
            message_type,
            len: payload.len(),
            needed: start + declared,
        });
    }

    Ok(String::from_utf8_lossy(&payload[start..start + declared]).into_owned())
}

fn take_lenient(payload: &Bytes, start: usize, declared: usize) -> Bytes {
    let available = payload.len() - start;
    let len = declared.min(available);
    payload.slice(start..start + len)
}

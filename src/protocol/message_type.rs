//! # Message Type Tags
//!
//! The first byte of every frame. Client → server tags live below `0x10`,
//! server → client tags from `0x10` upwards, and `0xFF` is reserved for errors.

use std::fmt;

/// Single-byte frame tag.
///
/// ## Rust Concepts:
/// - **#[repr(u8)]**: Guarantees each variant is stored as exactly the listed byte
/// - **Copy**: Tags are tiny, so they are passed around by value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Client to server
    AudioChunk = 0x01,
    AudioEnd = 0x02,

    // Server to client
    ProcessingStarted = 0x10,
    TextResponse = 0x11,
    AudioResponseStart = 0x12,
    AudioResponseChunk = 0x13,
    AudioResponseEnd = 0x14,
    ProcessingComplete = 0x15,
    Error = 0xFF,
}

impl MessageType {
    /// Every known tag, in wire order.
    pub const ALL: [MessageType; 9] = [
        MessageType::AudioChunk,
        MessageType::AudioEnd,
        MessageType::ProcessingStarted,
        MessageType::TextResponse,
        MessageType::AudioResponseStart,
        MessageType::AudioResponseChunk,
        MessageType::AudioResponseEnd,
        MessageType::ProcessingComplete,
        MessageType::Error,
    ];

    /// The byte written on the wire for this tag.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Look up a tag from its wire byte. Unknown bytes return `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_byte() == byte)
    }

    /// Name used in logs and API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AudioChunk => "audio_chunk",
            MessageType::AudioEnd => "audio_end",
            MessageType::ProcessingStarted => "processing_started",
            MessageType::TextResponse => "text_response",
            MessageType::AudioResponseStart => "audio_response_start",
            MessageType::AudioResponseChunk => "audio_response_chunk",
            MessageType::AudioResponseEnd => "audio_response_end",
            MessageType::ProcessingComplete => "processing_complete",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

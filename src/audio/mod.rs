//! # Audio Session Module
//!
//! Everything that lives for the duration of one voice connection.
//!
//! ## Key Components:
//! - **Inbound Buffer**: Per-utterance byte accumulator owned by the dispatcher
//! - **Session Registry**: Live connections, their outbound sinks and state
//! - **Response Streamer**: Paced frame sequence for a finished answer
//!
//! ## Audio Format:
//! Inbound audio is opaque to the server (browsers send WebM/Opus); it is
//! concatenated and handed to the pipeline untouched. Outbound audio is
//! whatever the speech service produced, split into fixed-size chunks.

pub mod buffer;       // Per-utterance inbound audio
pub mod session;      // Session state and registry
pub mod streamer;     // Chunked, paced response frames

pub use buffer::InboundAudioBuffer;
pub use session::{FrameSink, SessionRegistry, SessionState};
pub use streamer::ResponseStreamer;

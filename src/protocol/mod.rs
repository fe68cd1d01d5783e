//! # Binary Wire Protocol
//!
//! Everything that crosses the WebSocket is a single binary message laid out as:
//!
//! ```text
//! Frame := type:u8 | sessionIdLen:u32 | sessionId:utf8[sessionIdLen] | payload
//! ```
//!
//! All integers are little-endian. The payload layout depends on the type tag.
//!
//! ## Key Components:
//! - **MessageType**: The closed set of single-byte tags (values are wire-stable)
//! - **Frame**: Tag + session id + raw payload, with `encode`/`decode`
//! - **Message**: Typed view of a frame's payload (audio chunk, text, response chunk, ...)
//!
//! ## Design:
//! Decoding never panics and never throws control flow around; every failure
//! comes back as a `FrameError` the dispatcher can match on.

pub mod frame;          // Frame codec (tag + session id + payload)
pub mod message;        // Per-type payload layouts
pub mod message_type;   // Wire tags

pub use frame::{Frame, FrameError};
pub use message::Message;
pub use message_type::MessageType;

//! # Inbound Audio Buffer
//!
//! Accumulates the audio bytes of one utterance in arrival order. The buffer
//! is owned by a single dispatcher loop, so it needs no locking; the session
//! registry only sees its size through the session's counters.
//!
//! ## Memory Management:
//! Chunks are appended into one contiguous `BytesMut`, so handing the whole
//! utterance to the pipeline is a single `freeze` of a copy rather than a
//! gather of many small allocations.
//!
//! The buffer never grows past `max_bytes`. A chunk that would cross the
//! limit is rejected whole and the buffer is marked truncated until the next
//! clear; the audio kept so far is still a usable utterance.

use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};

/// Ordered byte accumulator for one utterance.
#[derive(Debug)]
pub struct InboundAudioBuffer {
    data: BytesMut,
    chunk_count: usize,
    max_bytes: usize,
    truncated: bool,
}

impl InboundAudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: BytesMut::new(),
            chunk_count: 0,
            max_bytes,
            truncated: false,
        }
    }

    /// Append one chunk's audio. Empty chunks still count as received.
    ///
    /// ## Errors:
    /// `UtteranceTooLarge` when the chunk would push the buffer past its limit;
    /// the chunk is dropped and the buffer keeps what it already had.
    pub fn append(&mut self, audio: &[u8]) -> Result<(), ProtocolError> {
        if self.data.len() + audio.len() > self.max_bytes {
            self.truncated = true;
            return Err(ProtocolError::UtteranceTooLarge {
                limit: self.max_bytes,
            });
        }

        self.data.extend_from_slice(audio);
        self.chunk_count += 1;
        Ok(())
    }

    /// Whether a chunk has been rejected since the last clear.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Copy of everything received since the last clear.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Drop all buffered audio and reset the chunk counter.
    pub fn clear(&mut self) {
        self.data.clear();
        self.chunk_count = 0;
        self.truncated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_are_concatenated_in_order() {
        let mut buffer = InboundAudioBuffer::new(1024);
        buffer.append(&[1, 2, 3]).unwrap();
        buffer.append(&[4, 5]).unwrap();
        buffer.append(&[6, 7, 8, 9]).unwrap();

        assert_eq!(buffer.len(), 9);
        assert_eq!(buffer.chunk_count(), 3);
        assert_eq!(buffer.snapshot().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_empty_chunks_leave_buffer_empty() {
        let mut buffer = InboundAudioBuffer::new(1024);
        buffer.append(&[]).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.chunk_count(), 1);
    }

    #[test]
    fn test_clear() {
        let mut buffer = InboundAudioBuffer::new(1024);
        buffer.append(&[1, 2]).unwrap();
        let snapshot = buffer.snapshot();
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.chunk_count(), 0);
        // Snapshots taken before a clear are unaffected
        assert_eq!(snapshot.as_ref(), &[1, 2]);
    }

    #[test]
    fn test_chunk_past_limit_is_rejected() {
        let mut buffer = InboundAudioBuffer::new(4);
        buffer.append(&[1, 2, 3]).unwrap();

        let err = buffer.append(&[4, 5]).unwrap_err();
        assert!(matches!(err, ProtocolError::UtteranceTooLarge { limit: 4 }));
        assert!(buffer.is_truncated());
        assert_eq!(buffer.snapshot().as_ref(), &[1, 2, 3]);

        // Still room for a chunk that fits exactly
        buffer.append(&[4]).unwrap();
        assert_eq!(buffer.len(), 4);

        buffer.clear();
        assert!(!buffer.is_truncated());
        buffer.append(&[9, 9]).unwrap();
    }
}

//! # Response Streamer
//!
//! Turns a finished [`PipelineResult`] into the fixed frame sequence:
//!
//! ```text
//! [TextResponse]            only when the text is non-empty
//! AudioResponseStart
//! AudioResponseChunk * n    n = ceil(len / chunk_size), paced
//! AudioResponseEnd
//! ProcessingComplete
//! ```
//!
//! The plan is deterministic for a given result and chunk size; only the
//! pauses between chunks depend on the clock.

use crate::audio::FrameSink;
use crate::error::ProtocolError;
use crate::pipeline::PipelineResult;
use crate::protocol::Message;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ResponseStreamer {
    chunk_size: usize,
    pacing: Duration,
}

impl ResponseStreamer {
    /// `chunk_size` of zero is treated as one byte per chunk.
    pub fn new(chunk_size: usize, pacing: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pacing,
        }
    }

    #[cfg(test)]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The exact messages that will be sent for `result`, in order.
    pub fn plan(&self, result: &PipelineResult) -> Vec<Message> {
        let audio = &result.audio_data;
        let chunk_count = audio.len().div_ceil(self.chunk_size);
        let mut messages = Vec::with_capacity(chunk_count + 4);

        if !result.response_text.is_empty() {
            messages.push(Message::TextResponse {
                text: result.response_text.clone(),
            });
        }

        messages.push(Message::AudioResponseStart);

        for index in 0..chunk_count {
            let start = index * self.chunk_size;
            let end = (start + self.chunk_size).min(audio.len());
            messages.push(Message::AudioResponseChunk {
                chunk_index: index as u32,
                is_last: index + 1 == chunk_count,
                audio: audio.slice(start..end),
            });
        }

        messages.push(Message::AudioResponseEnd);
        messages.push(Message::ProcessingComplete);
        messages
    }

    /// Send the planned frames to `sink`, pausing after every chunk but the
    /// last. Returns the number of audio chunks sent.
    pub async fn stream(
        &self,
        session_id: &str,
        result: &PipelineResult,
        sink: &dyn FrameSink,
    ) -> Result<usize, ProtocolError> {
        let mut chunks_sent = 0;

        for message in self.plan(result) {
            sink.deliver(message.encode(session_id))?;

            if let Message::AudioResponseChunk { is_last, .. } = message {
                chunks_sent += 1;
                if !is_last && !self.pacing.is_zero() {
                    tokio::time::sleep(self.pacing).await;
                }
            }
        }

        debug!(
            session_id,
            chunks = chunks_sent,
            audio_bytes = result.audio_data.len(),
            "Response streamed"
        );
        Ok(chunks_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::testing::{ClosedSink, RecordingSink};
    use crate::protocol::MessageType;
    use bytes::Bytes;
    use tokio::time::Instant;

    fn result(text: &str, audio_len: usize) -> PipelineResult {
        let audio: Vec<u8> = (0..audio_len).map(|i| (i % 251) as u8).collect();
        PipelineResult::new(text, audio)
    }

    fn chunk_sizes(messages: &[Message]) -> Vec<(u32, bool, usize)> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::AudioResponseChunk {
                    chunk_index,
                    is_last,
                    audio,
                } => Some((*chunk_index, *is_last, audio.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chunking_arithmetic() {
        let streamer = ResponseStreamer::new(4096, Duration::ZERO);
        let plan = streamer.plan(&result("hi", 10_000));

        assert_eq!(
            chunk_sizes(&plan),
            vec![(0, false, 4096), (1, false, 4096), (2, true, 1808)]
        );

        let types: Vec<_> = plan.iter().map(Message::message_type).collect();
        assert_eq!(
            types,
            vec![
                MessageType::TextResponse,
                MessageType::AudioResponseStart,
                MessageType::AudioResponseChunk,
                MessageType::AudioResponseChunk,
                MessageType::AudioResponseChunk,
                MessageType::AudioResponseEnd,
                MessageType::ProcessingComplete,
            ]
        );
    }

    #[test]
    fn test_chunks_reassemble_to_original_audio() {
        let streamer = ResponseStreamer::new(4096, Duration::ZERO);
        let input = result("", 8192);
        let mut joined = Vec::new();
        for message in streamer.plan(&input) {
            if let Message::AudioResponseChunk { audio, .. } = message {
                joined.extend_from_slice(&audio);
            }
        }
        assert_eq!(joined, input.audio_data.as_ref());
        assert_eq!(chunk_sizes(&streamer.plan(&input)).len(), 2);
    }

    #[test]
    fn test_empty_audio_keeps_start_end_pair() {
        let streamer = ResponseStreamer::new(4096, Duration::ZERO);
        let plan = streamer.plan(&PipelineResult::new("Sorry", Bytes::new()));
        assert_eq!(
            plan,
            vec![
                Message::TextResponse {
                    text: "Sorry".to_string()
                },
                Message::AudioResponseStart,
                Message::AudioResponseEnd,
                Message::ProcessingComplete,
            ]
        );
    }

    #[test]
    fn test_empty_text_skips_text_response() {
        let streamer = ResponseStreamer::new(4096, Duration::ZERO);
        let plan = streamer.plan(&result("", 10));
        assert_eq!(plan[0], Message::AudioResponseStart);
        assert_eq!(chunk_sizes(&plan), vec![(0, true, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_between_chunks_only() {
        let streamer = ResponseStreamer::new(4096, Duration::from_millis(50));
        let sink = RecordingSink::default();

        let started = Instant::now();
        let sent = streamer.stream("s1", &result("hi", 10_000), &sink).await.unwrap();

        assert_eq!(sent, 3);
        // Two pauses: after chunk 0 and chunk 1, none after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "elapsed {:?}", elapsed);

        let frames = sink.frames();
        assert_eq!(frames.len(), 7);
        let (session_id, first) = Message::decode(&frames[0]).unwrap();
        assert_eq!(session_id, "s1");
        assert_eq!(first, Message::TextResponse { text: "hi".to_string() });
    }

    #[tokio::test]
    async fn test_stream_stops_on_transport_failure() {
        let streamer = ResponseStreamer::new(4096, Duration::ZERO);
        let err = streamer
            .stream("s1", &result("hi", 10), &ClosedSink)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TransportFailure(_)));
    }
}

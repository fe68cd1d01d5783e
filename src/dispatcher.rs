//! # Per-Connection Dispatcher
//!
//! One dispatcher loop runs for every WebSocket connection. It receives raw
//! binary messages from the connection's actor over a bounded channel and
//! handles them strictly in arrival order:
//!
//! ```text
//! Idle ──AudioChunk──▶ Receiving ──AudioEnd──▶ Ending ──▶ Processing ──▶ Responding ──▶ Idle
//!                                                 │ (empty buffer)
//!                                                 └──── Error "No audio data received" ──▶ Idle
//! ```
//!
//! ## Ownership:
//! The inbound audio buffer belongs to the loop, not to the registry. The
//! registry only holds the session's outbound sink and observable state, so
//! no other task can ever touch the bytes of an utterance in progress.
//!
//! ## Chunks during Processing:
//! The actor tags every message with whether the session was busy when it
//! arrived. Audio chunks tagged busy are read and dropped, because the buffer
//! they would join is cleared when the current answer finishes.
//!
//! ## Teardown:
//! Once the session is gone from the registry, nothing queued behind it is
//! handled. A pipeline call already in flight runs to completion and its
//! frames are dropped.

use crate::audio::{InboundAudioBuffer, SessionState};
use crate::error::ProtocolError;
use crate::protocol::{FrameError, Message};
use crate::state::AppState;
use bytes::Bytes;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, info_span, warn, Instrument};

/// One binary WebSocket message as handed over by the connection actor.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub bytes: Bytes,
    /// Session was Processing or Responding when this message arrived
    pub arrived_while_busy: bool,
}

impl InboundFrame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            arrived_while_busy: false,
        }
    }

    pub fn busy(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            arrived_while_busy: true,
        }
    }
}

pub struct Dispatcher {
    session_id: String,
    state: AppState,
    buffer: InboundAudioBuffer,
}

impl Dispatcher {
    pub fn new(session_id: impl Into<String>, state: AppState) -> Self {
        let max_utterance_bytes = state.get_config().streaming.max_utterance_bytes;
        Self {
            session_id: session_id.into(),
            state,
            buffer: InboundAudioBuffer::new(max_utterance_bytes),
        }
    }

    /// Consume frames until the actor drops its sender or the session is
    /// unregistered, then tear the session down.
    pub async fn run(mut self, mut rx: Receiver<InboundFrame>) {
        let span = info_span!("session", session_id = %self.session_id);

        async move {
            info!("Dispatcher started");

            while let Some(frame) = rx.recv().await {
                if !self.is_registered() {
                    debug!("Session no longer registered, dropping queued frames");
                    break;
                }
                self.handle_frame(frame).await;
            }

            if self.state.registry.remove(&self.session_id) {
                info!("Session removed from registry");
            }
            if !self.buffer.is_empty() {
                debug!(discarded_bytes = self.buffer.len(), "Discarding unfinished utterance");
            }
            info!("Dispatcher stopped");
        }
        .instrument(span)
        .await
    }

    /// Handle one inbound message. Never fails: every problem is either
    /// reported to the client or logged.
    pub async fn handle_frame(&mut self, inbound: InboundFrame) {
        self.state.protocol.frame_received();
        if let Some(session) = self.state.registry.get(&self.session_id) {
            session.record_frame_received();
        }

        // The client's session id is informational; replies use ours
        let message = match Message::decode(&inbound.bytes) {
            Ok((_, message)) => message,
            Err(FrameError::UnknownType(tag)) => {
                warn!(tag, "Unknown message type");
                return;
            }
            Err(e) => {
                self.state.protocol.malformed_frame();
                self.report(ProtocolError::MalformedFrame(e));
                return;
            }
        };

        match message {
            Message::AudioChunk { audio } => {
                self.handle_audio_chunk(audio, inbound.arrived_while_busy)
            }
            Message::AudioEnd => self.handle_audio_end().await,
            other => {
                warn!(message_type = %other.message_type(), "Ignoring server-to-client message from client");
            }
        }
    }

    fn handle_audio_chunk(&mut self, audio: Bytes, arrived_while_busy: bool) {
        if arrived_while_busy {
            self.state.protocol.chunk_discarded();
            debug!(bytes = audio.len(), "Discarding chunk received while busy");
            return;
        }

        let already_truncated = self.buffer.is_truncated();
        if let Err(e) = self.buffer.append(&audio) {
            self.state.protocol.chunk_discarded();
            if already_truncated {
                debug!(bytes = audio.len(), "Dropping chunk past the utterance limit");
            } else {
                self.report(e);
            }
            return;
        }

        if let Some(session) = self.state.registry.get(&self.session_id) {
            session.set_state(SessionState::Receiving);
            session.set_buffered_bytes(self.buffer.len());
        }

        debug!(
            chunk_bytes = audio.len(),
            total_bytes = self.buffer.len(),
            chunks = self.buffer.chunk_count(),
            "Audio chunk buffered"
        );
    }

    async fn handle_audio_end(&mut self) {
        if !self.is_registered() {
            debug!(bytes = self.buffer.len(), "Session gone, dropping utterance");
            self.buffer.clear();
            return;
        }

        self.set_state(SessionState::Ending);
        info!(bytes = self.buffer.len(), chunks = self.buffer.chunk_count(), "Audio stream ended");

        if self.buffer.is_empty() {
            self.state.protocol.empty_utterance();
            self.report(ProtocolError::EmptyUtterance);
            self.finish_utterance();
            return;
        }

        let audio = self.buffer.snapshot();
        self.set_state(SessionState::Processing);
        self.send(Message::ProcessingStarted);
        if let Some(session) = self.state.registry.get(&self.session_id) {
            session.record_utterance();
        }

        let outcome = self.state.pipeline.process(audio).await;

        match outcome {
            Ok(result) => {
                self.set_state(SessionState::Responding);
                self.state.protocol.utterance_processed();

                match self.state.registry.get(&self.session_id) {
                    Some(session) => {
                        let streamer = self.state.response_streamer();
                        match streamer.stream(&self.session_id, &result, session.as_ref()).await {
                            Ok(chunks) => self.state.protocol.chunks_streamed(chunks),
                            Err(e) => warn!(error = %e, "Response stream interrupted"),
                        }
                    }
                    None => warn!("Session gone before the response could be sent"),
                }
            }
            Err(e) => {
                self.state.protocol.pipeline_failure();
                self.report(ProtocolError::PipelineFailure(e));
                self.send(Message::ProcessingComplete);
            }
        }

        self.finish_utterance();
    }

    /// Clear the buffer and return to Idle. Runs exactly once per `AudioEnd`.
    fn finish_utterance(&mut self) {
        self.buffer.clear();
        if let Some(session) = self.state.registry.get(&self.session_id) {
            session.set_buffered_bytes(0);
            session.set_state(SessionState::Idle);
        }
    }

    fn is_registered(&self) -> bool {
        self.state.registry.get(&self.session_id).is_some()
    }

    fn set_state(&self, state: SessionState) {
        if let Some(session) = self.state.registry.get(&self.session_id) {
            session.set_state(state);
            debug!(state = state.as_str(), "Session state changed");
        }
    }

    fn report(&self, error: ProtocolError) {
        if error.is_reportable() {
            warn!(error = %error, "Reporting error to client");
            self.send(Message::error(error.to_string()));
        } else {
            warn!(error = %error, "Transport failure");
        }
    }

    /// Send through the registry so frames for a removed session are dropped.
    fn send(&self, message: Message) {
        let Some(session) = self.state.registry.get(&self.session_id) else {
            warn!(message_type = %message.message_type(), "Session no longer registered, dropping frame");
            return;
        };

        if let Err(e) = session.send(message.encode(&self.session_id)) {
            warn!(message_type = %message.message_type(), error = %e, "Failed to send frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::testing::RecordingSink;
    use crate::audio::SessionRegistry;
    use crate::error::EMPTY_UTTERANCE_MESSAGE;
    use crate::pipeline::{PipelineError, PipelineResult, ProcessingPipeline};
    use crate::protocol::{Frame, MessageType};
    use crate::state::testing::{test_state, ScriptedPipeline};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Dispatcher,
        sink: Arc<RecordingSink>,
        pipeline: Arc<ScriptedPipeline>,
        state: AppState,
        session_id: String,
    }

    fn harness(pipeline: ScriptedPipeline) -> Harness {
        let pipeline = Arc::new(pipeline);
        let state = test_state(pipeline.clone());
        let sink = Arc::new(RecordingSink::default());
        let session_id = state.registry.create(sink.clone()).unwrap();

        Harness {
            dispatcher: Dispatcher::new(session_id.clone(), state.clone()),
            sink,
            pipeline,
            state,
            session_id,
        }
    }

    fn chunk(audio: &[u8]) -> InboundFrame {
        InboundFrame::new(
            Message::AudioChunk {
                audio: Bytes::copy_from_slice(audio),
            }
            .encode("client-id"),
        )
    }

    fn end() -> InboundFrame {
        InboundFrame::new(Message::AudioEnd.encode("client-id"))
    }

    fn sent(sink: &RecordingSink) -> Vec<Message> {
        sink.frames()
            .iter()
            .map(|bytes| Message::decode(bytes).unwrap().1)
            .collect()
    }

    fn types(messages: &[Message]) -> Vec<MessageType> {
        messages.iter().map(Message::message_type).collect()
    }

    #[tokio::test]
    async fn test_chunks_reassemble_in_order() {
        let mut h = harness(ScriptedPipeline::succeeding("Try Luigi's", &[0xAB; 10]));

        h.dispatcher.handle_frame(chunk(&[1, 2, 3])).await;
        h.dispatcher.handle_frame(chunk(&[4, 5])).await;
        h.dispatcher.handle_frame(chunk(&[6, 7, 8, 9])).await;
        assert_eq!(
            h.state.registry.get(&h.session_id).unwrap().state(),
            SessionState::Receiving
        );

        h.dispatcher.handle_frame(end()).await;

        let calls = h.pipeline.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let messages = sent(&h.sink);
        assert_eq!(
            types(&messages),
            vec![
                MessageType::ProcessingStarted,
                MessageType::TextResponse,
                MessageType::AudioResponseStart,
                MessageType::AudioResponseChunk,
                MessageType::AudioResponseEnd,
                MessageType::ProcessingComplete,
            ]
        );
        assert_eq!(h.state.protocol.snapshot().chunks_streamed, 1);
    }

    #[tokio::test]
    async fn test_outbound_frames_carry_server_session_id() {
        let mut h = harness(ScriptedPipeline::succeeding("ok", &[]));
        h.dispatcher.handle_frame(chunk(&[1])).await;
        h.dispatcher.handle_frame(end()).await;

        for bytes in h.sink.frames() {
            let (session_id, _) = Message::decode(&bytes).unwrap();
            assert_eq!(session_id, h.session_id);
        }
    }

    #[tokio::test]
    async fn test_empty_utterance_sends_exactly_one_error() {
        let mut h = harness(ScriptedPipeline::default());
        h.dispatcher.handle_frame(end()).await;

        assert_eq!(sent(&h.sink), vec![Message::error(EMPTY_UTTERANCE_MESSAGE)]);
        assert!(h.pipeline.calls().is_empty());
        assert_eq!(h.state.protocol.snapshot().empty_utterances, 1);
        assert_eq!(
            h.state.registry.get(&h.session_id).unwrap().state(),
            SessionState::Idle
        );
    }

    #[tokio::test]
    async fn test_chunks_with_no_audio_count_as_empty() {
        let mut h = harness(ScriptedPipeline::default());
        h.dispatcher.handle_frame(chunk(&[])).await;
        h.dispatcher.handle_frame(end()).await;

        assert_eq!(sent(&h.sink), vec![Message::error(EMPTY_UTTERANCE_MESSAGE)]);
        assert!(h.pipeline.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_loop_alive() {
        let mut h = harness(ScriptedPipeline::succeeding("ok", &[1]));

        h.dispatcher.handle_frame(InboundFrame::new(Bytes::new())).await;
        h.dispatcher.handle_frame(chunk(&[7])).await;
        h.dispatcher.handle_frame(end()).await;

        let messages = sent(&h.sink);
        match &messages[0] {
            Message::Error { message } => {
                assert!(message.starts_with("Error processing message: "), "{}", message)
            }
            other => panic!("expected error frame, got {:?}", other),
        }
        assert_eq!(messages[1], Message::ProcessingStarted);
        assert_eq!(h.pipeline.calls()[0].as_ref(), &[7]);
        assert_eq!(h.state.protocol.snapshot().frames_received, 3);
    }

    #[tokio::test]
    async fn test_malformed_chunk_payload_is_reported() {
        let mut h = harness(ScriptedPipeline::default());
        let frame = Frame::new(MessageType::AudioChunk, "c", Bytes::from_static(&[1, 2]));
        h.dispatcher.handle_frame(InboundFrame::new(frame.encode())).await;

        assert_eq!(types(&sent(&h.sink)), vec![MessageType::Error]);
        assert!(h.dispatcher.buffer.is_empty());
        assert_eq!(h.state.protocol.snapshot().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_pipeline_failure_reports_and_clears_buffer() {
        let mut h = harness(ScriptedPipeline::failing("timeout"));
        h.pipeline.push_ok("second", &[]);

        h.dispatcher.handle_frame(chunk(&[1, 2])).await;
        h.dispatcher.handle_frame(end()).await;

        assert_eq!(
            sent(&h.sink),
            vec![
                Message::ProcessingStarted,
                Message::error("Transcription failed: timeout"),
                Message::ProcessingComplete,
            ]
        );
        assert!(h.dispatcher.buffer.is_empty());
        assert_eq!(h.state.protocol.snapshot().pipeline_failures, 1);

        // Next utterance starts from an empty buffer
        h.dispatcher.handle_frame(chunk(&[3])).await;
        h.dispatcher.handle_frame(end()).await;
        assert_eq!(h.pipeline.calls()[1].as_ref(), &[3]);
    }

    #[tokio::test]
    async fn test_buffer_cleared_after_success() {
        let mut h = harness(ScriptedPipeline::succeeding("one", &[]));
        h.pipeline.push_ok("two", &[]);

        h.dispatcher.handle_frame(chunk(&[1, 2, 3])).await;
        h.dispatcher.handle_frame(end()).await;
        assert!(h.dispatcher.buffer.is_empty());

        h.dispatcher.handle_frame(chunk(&[9])).await;
        h.dispatcher.handle_frame(end()).await;

        let calls = h.pipeline.calls();
        assert_eq!(calls[0].as_ref(), &[1, 2, 3]);
        assert_eq!(calls[1].as_ref(), &[9]);

        let session = h.state.registry.get(&h.session_id).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.summary().buffered_bytes, 0);
        assert_eq!(session.summary().utterances, 2);
    }

    #[tokio::test]
    async fn test_unknown_and_server_types_are_dropped() {
        let mut h = harness(ScriptedPipeline::default());

        let unknown = Frame::from_raw(0x42, "c", vec![1u8, 2, 3]).encode();
        h.dispatcher.handle_frame(InboundFrame::new(unknown)).await;
        h.dispatcher
            .handle_frame(InboundFrame::new(Message::ProcessingComplete.encode("c")))
            .await;

        assert!(h.sink.frames().is_empty());
        assert_eq!(
            h.state.registry.get(&h.session_id).unwrap().state(),
            SessionState::Idle
        );
    }

    #[tokio::test]
    async fn test_chunks_arriving_while_busy_are_discarded() {
        let mut h = harness(ScriptedPipeline::default());

        h.dispatcher.handle_frame(chunk(&[1])).await;
        h.dispatcher
            .handle_frame(InboundFrame::busy(
                Message::AudioChunk {
                    audio: Bytes::from_static(&[2]),
                }
                .encode("c"),
            ))
            .await;
        h.dispatcher.handle_frame(end()).await;

        assert_eq!(h.pipeline.calls()[0].as_ref(), &[1]);
        assert_eq!(h.state.protocol.snapshot().discarded_chunks, 1);
    }

    /// Pipeline that unregisters its session while the call is in flight,
    /// the way a client disconnect does.
    #[derive(Default)]
    struct DisconnectingPipeline {
        target: Mutex<Option<(Arc<SessionRegistry>, String)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcessingPipeline for DisconnectingPipeline {
        async fn process(&self, _audio: Bytes) -> Result<PipelineResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((registry, session_id)) = self.target.lock().unwrap().take() {
                registry.remove(&session_id);
            }
            Ok(PipelineResult::new("late", vec![1u8, 2, 3]))
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_pipeline_call_drops_response() {
        let pipeline = Arc::new(DisconnectingPipeline::default());
        let state = test_state(pipeline.clone());
        let sink = Arc::new(RecordingSink::default());
        let session_id = state.registry.create(sink.clone()).unwrap();
        *pipeline.target.lock().unwrap() = Some((state.registry.clone(), session_id.clone()));

        let mut dispatcher = Dispatcher::new(session_id.clone(), state.clone());
        dispatcher.handle_frame(chunk(&[1])).await;
        dispatcher.handle_frame(end()).await;

        // The in-flight call completes; only the frame sent before it went out
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        assert_eq!(types(&sent(&sink)), vec![MessageType::ProcessingStarted]);
        assert!(dispatcher.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_audio_end_after_removal_skips_pipeline() {
        let mut h = harness(ScriptedPipeline::succeeding("late", &[1, 2, 3]));

        h.dispatcher.handle_frame(chunk(&[1])).await;
        h.state.registry.remove(&h.session_id);
        h.dispatcher.handle_frame(end()).await;

        assert!(h.pipeline.calls().is_empty());
        assert!(h.sink.frames().is_empty());
        assert!(h.dispatcher.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_queued_frames_after_disconnect_are_not_processed() {
        let pipeline = Arc::new(ScriptedPipeline::succeeding("ok", &[1]));
        let state = test_state(pipeline.clone());
        let sink = Arc::new(RecordingSink::default());
        let session_id = state.registry.create(sink.clone()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.try_send(chunk(&[5, 6])).unwrap();
        tx.try_send(end()).unwrap();
        state.registry.remove(&session_id);
        drop(tx);

        Dispatcher::new(session_id, state.clone()).run(rx).await;

        assert!(pipeline.calls().is_empty());
        assert!(sink.frames().is_empty());
        assert_eq!(state.protocol.snapshot().frames_received, 0);
    }

    #[tokio::test]
    async fn test_utterance_limit_reports_once_and_keeps_prefix() {
        let pipeline = Arc::new(ScriptedPipeline::succeeding("ok", &[]));
        let state = test_state(pipeline.clone());
        let mut config = state.get_config();
        config.streaming.max_utterance_bytes = 4;
        state.update_config(config).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let session_id = state.registry.create(sink.clone()).unwrap();
        let mut dispatcher = Dispatcher::new(session_id, state.clone());

        dispatcher.handle_frame(chunk(&[1, 2, 3])).await;
        dispatcher.handle_frame(chunk(&[4, 5])).await;
        dispatcher.handle_frame(chunk(&[6, 7])).await;
        dispatcher.handle_frame(end()).await;

        let messages = sent(&sink);
        assert_eq!(
            messages[0],
            Message::error("Audio exceeds the maximum utterance size of 4 bytes")
        );
        assert_eq!(messages[1], Message::ProcessingStarted);
        assert_eq!(
            types(&messages).iter().filter(|t| **t == MessageType::Error).count(),
            1
        );
        assert_eq!(pipeline.calls()[0].as_ref(), &[1, 2, 3]);
        assert_eq!(state.protocol.snapshot().discarded_chunks, 2);
    }

    #[tokio::test]
    async fn test_run_removes_session_when_channel_closes() {
        let pipeline = Arc::new(ScriptedPipeline::succeeding("ok", &[]));
        let state = test_state(pipeline.clone());
        let sink = Arc::new(RecordingSink::default());
        let session_id = state.registry.create(sink.clone()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.try_send(chunk(&[5, 6])).unwrap();
        tx.try_send(end()).unwrap();
        drop(tx);

        Dispatcher::new(session_id.clone(), state.clone()).run(rx).await;

        assert!(state.registry.get(&session_id).is_none());
        assert_eq!(pipeline.calls()[0].as_ref(), &[5, 6]);
        assert_eq!(sink.frames().len(), 5);
    }
}

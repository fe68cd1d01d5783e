//! # Session Registry
//!
//! Tracks every live WebSocket connection. Each connection gets exactly one
//! [`Session`] holding its outbound channel and observable state; the audio
//! buffer itself stays with the connection's dispatcher loop.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: Waiting for the first chunk of an utterance
//! 2. **Receiving**: Accumulating `AudioChunk` frames
//! 3. **Ending**: `AudioEnd` received, checking the buffer
//! 4. **Processing**: Pipeline call in flight
//! 5. **Responding**: Streaming the result back
//!
//! After Responding (or a failure) the session returns to Idle. Sessions are
//! removed on disconnect, transport error or teardown of the dispatcher loop.

use crate::error::{ProtocolError, RegistryError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Outbound side of a connection.
///
/// ## Rust Concepts:
/// - **Trait object**: The registry stores `Arc<dyn FrameSink>` so tests can
///   swap the WebSocket actor for a recording sink
/// - **Send + Sync**: Sinks are shared between the actor and the dispatcher task
pub trait FrameSink: Send + Sync {
    /// Queue one complete frame for delivery as a single binary message.
    fn deliver(&self, frame: Bytes) -> Result<(), ProtocolError>;
}

/// Where a session is in its utterance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Receiving,
    Ending,
    Processing,
    Responding,
}

impl SessionState {
    /// Chunks arriving in these states belong to an utterance that is
    /// already being answered.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Processing | SessionState::Responding)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Receiving => "receiving",
            SessionState::Ending => "ending",
            SessionState::Processing => "processing",
            SessionState::Responding => "responding",
        }
    }
}

/// Per-session counters.
#[derive(Debug, Default)]
struct SessionStats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    utterances: AtomicU64,
}

/// Server-side state for one connection.
pub struct Session {
    id: String,
    sink: Arc<dyn FrameSink>,
    state: RwLock<SessionState>,
    pub created_at: DateTime<Utc>,
    buffered_bytes: AtomicUsize,
    stats: SessionStats,
}

impl Session {
    fn new(id: String, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            id,
            sink,
            state: RwLock::new(SessionState::Idle),
            created_at: Utc::now(),
            buffered_bytes: AtomicUsize::new(0),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Send one encoded frame to the client.
    pub fn send(&self, frame: Bytes) -> Result<(), ProtocolError> {
        self.sink.deliver(frame)?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_frame_received(&self) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_utterance(&self) {
        self.stats.utterances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_buffered_bytes(&self, bytes: usize) {
        self.buffered_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id().to_string(),
            state: self.state(),
            created_at: self.created_at,
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            utterances: self.stats.utterances.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for Session {
    fn deliver(&self, frame: Bytes) -> Result<(), ProtocolError> {
        self.send(frame)
    }
}

/// Serializable view of a session for the sessions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub buffered_bytes: usize,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub utterances: u64,
}

/// Concurrency-safe map of live sessions.
///
/// ## Thread Safety:
/// RwLock allows many concurrent lookups (every outbound frame does one) and
/// serializes create/remove. A poisoned lock is recovered rather than
/// propagated since the map itself is always left consistent.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
        }
    }

    /// Register a new connection and return its server-generated id.
    pub fn create(&self, sink: Arc<dyn FrameSink>) -> Result<String, RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());

        let max = self.max_sessions.load(Ordering::Relaxed);
        if sessions.len() >= max {
            return Err(RegistryError::CapacityReached(max));
        }

        let mut id = Uuid::new_v4().to_string();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        sessions.insert(id.clone(), Arc::new(Session::new(id.clone(), sink)));
        Ok(id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions.get(session_id).cloned()
    }

    /// Remove a session. Returns whether it was still registered; calling it
    /// twice is harmless.
    pub fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        sessions.remove(session_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_sessions.load(Ordering::Relaxed)
    }

    /// Applies to future `create` calls only; existing sessions are kept.
    pub fn set_max_sessions(&self, max_sessions: usize) {
        self.max_sessions.store(max_sessions, Ordering::Relaxed);
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        let mut summaries: Vec<_> = sessions.values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ClosedSink, RecordingSink};
    use super::*;
    use std::thread;

    fn sink() -> Arc<dyn FrameSink> {
        Arc::new(RecordingSink::default())
    }

    #[test]
    fn test_create_get_remove() {
        let registry = SessionRegistry::new(10);
        let id = registry.create(sink()).unwrap();

        let session = registry.get(&id).unwrap();
        assert_eq!(session.id(), id);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(registry.active_count(), 1);

        assert!(registry.remove(&id));
        assert!(registry.get(&id).is_none());
        // Idempotent
        assert!(!registry.remove(&id));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SessionRegistry::new(100);
        let a = registry.create(sink()).unwrap();
        let b = registry.create(sink()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_capacity_limit() {
        let registry = SessionRegistry::new(1);
        let id = registry.create(sink()).unwrap();
        assert!(!registry.has_capacity());
        assert_eq!(registry.create(sink()), Err(RegistryError::CapacityReached(1)));

        registry.remove(&id);
        assert!(registry.create(sink()).is_ok());
    }

    #[test]
    fn test_concurrent_create_and_remove() {
        let registry = Arc::new(SessionRegistry::new(1000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let id = registry.create(sink()).unwrap();
                        assert!(registry.get(&id).is_some());
                        assert!(registry.remove(&id));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_send_counts_frames() {
        let registry = SessionRegistry::new(10);
        let recording = Arc::new(RecordingSink::default());
        let id = registry.create(recording.clone()).unwrap();
        let session = registry.get(&id).unwrap();

        session.send(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(recording.frames().len(), 1);
        assert_eq!(session.summary().frames_sent, 1);
    }

    #[test]
    fn test_send_on_closed_sink_fails() {
        let registry = SessionRegistry::new(10);
        let id = registry.create(Arc::new(ClosedSink)).unwrap();
        let err = registry.get(&id).unwrap().send(Bytes::new()).unwrap_err();
        assert!(!err.is_reportable());
    }

    #[test]
    fn test_busy_states() {
        assert!(SessionState::Processing.is_busy());
        assert!(SessionState::Responding.is_busy());
        assert!(!SessionState::Receiving.is_busy());
        assert!(!SessionState::Idle.is_busy());
    }
}

//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket session.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Many handlers and session tasks hold a reference to the same data
//! - **RwLock**: Many concurrent readers OR one writer
//! - Used for the runtime config and the HTTP endpoint metrics
//!
//! ### Atomics
//! Protocol counters are bumped on every frame, so they are plain atomics
//! instead of sitting behind the metrics lock.
//!
//! ### Trait objects
//! The pipeline is stored as `Arc<dyn ProcessingPipeline>` so tests can plug in
//! a scripted implementation without touching the network.

use crate::audio::{ResponseStreamer, SessionRegistry};
use crate::config::AppConfig;
use crate::pipeline::ProcessingPipeline;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state that's shared across all handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (streaming section can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Frame-level counters across all sessions
    pub protocol: Arc<ProtocolCounters>,

    /// Live WebSocket sessions
    pub registry: Arc<SessionRegistry>,

    /// Utterance processing collaborator
    pub pipeline: Arc<dyn ProcessingPipeline>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed HTTP requests since server start
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Counters for the binary protocol.
#[derive(Debug, Default)]
pub struct ProtocolCounters {
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
    utterances_processed: AtomicU64,
    empty_utterances: AtomicU64,
    pipeline_failures: AtomicU64,
    chunks_streamed: AtomicU64,
    discarded_chunks: AtomicU64,
}

/// Point-in-time copy of [`ProtocolCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolSnapshot {
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub utterances_processed: u64,
    pub empty_utterances: u64,
    pub pipeline_failures: u64,
    pub chunks_streamed: u64,
    pub discarded_chunks: u64,
}

impl ProtocolCounters {
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn utterance_processed(&self) {
        self.utterances_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn empty_utterance(&self) {
        self.empty_utterances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pipeline_failure(&self) {
        self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_streamed(&self, count: usize) {
        self.chunks_streamed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn chunk_discarded(&self) {
        self.discarded_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProtocolSnapshot {
        ProtocolSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            utterances_processed: self.utterances_processed.load(Ordering::Relaxed),
            empty_utterances: self.empty_utterances.load(Ordering::Relaxed),
            pipeline_failures: self.pipeline_failures.load(Ordering::Relaxed),
            chunks_streamed: self.chunks_streamed.load(Ordering::Relaxed),
            discarded_chunks: self.discarded_chunks.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Create the shared state around a pipeline implementation.
    ///
    /// The registry's session limit is taken from the streaming config.
    pub fn new(config: AppConfig, pipeline: Arc<dyn ProcessingPipeline>) -> Self {
        let registry = SessionRegistry::new(config.streaming.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            protocol: Arc::new(ProtocolCounters::default()),
            registry: Arc::new(registry),
            pipeline,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.registry
            .set_max_sessions(new_config.streaming.max_concurrent_sessions);
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = new_config;
        Ok(())
    }

    /// Streamer built from the current chunk size and pacing.
    pub fn response_streamer(&self) -> ResponseStreamer {
        let config = self.config.read().unwrap_or_else(|p| p.into_inner());
        ResponseStreamer::new(
            config.streaming.response_chunk_size,
            config.streaming.chunk_pacing(),
        )
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|p| p.into_inner());
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|p| p.into_inner());
        metrics.error_count += 1;
    }

    /// Record one request against its endpoint.
    ///
    /// ## HashMap operations:
    /// The first request to an endpoint creates its entry with `or_default()`;
    /// later ones update it in place.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(|p| p.into_inner());
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the HTTP metrics, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(|p| p.into_inner());
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

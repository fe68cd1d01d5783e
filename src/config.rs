//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known environment variables (`HOST`, `PORT`, `OPENAI_API_KEY`, `YELP_API_KEY`)
//! 2. Prefixed environment variables (`APP_SERVER__PORT`, `APP_STREAMING__CHUNK_PACING_MS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Secrets:
//! API keys are loaded like every other setting but are never echoed back by the
//! config endpoints and cannot be changed at runtime.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The server socket, the streaming protocol and the external speech/search
/// services are tuned independently, so each gets its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub streaming: StreamingConfig,
    pub pipeline: PipelineConfig,
}

/// Where the HTTP/WebSocket server listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Protocol and session tuning.
///
/// ## Fields:
/// - `response_chunk_size`: Bytes of synthesized audio per `AudioResponseChunk` frame
/// - `chunk_pacing_ms`: Pause after every response chunk except the last
/// - `max_concurrent_sessions`: Upgrades beyond this are refused with 503
/// - `max_frame_bytes`: Largest WebSocket message accepted from a client
/// - `max_utterance_bytes`: Audio kept per utterance; later chunks are dropped
/// - `inbound_queue_frames`: Messages a connection may queue ahead of its dispatcher
/// - `heartbeat_interval_secs` / `client_timeout_secs`: Ping cadence and silence limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub response_chunk_size: usize,
    pub chunk_pacing_ms: u64,
    pub max_concurrent_sessions: usize,
    pub max_frame_bytes: usize,
    pub max_utterance_bytes: usize,
    pub inbound_queue_frames: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl StreamingConfig {
    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Settings for the speech, language and restaurant search services.
///
/// Keys are optional so the server can start without them; the pipeline
/// reports a configuration failure for each utterance until they are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub transcription_model: String,
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub yelp_api_key: Option<String>,
    pub yelp_base_url: String,
    pub search_limit: u32,
    pub request_timeout_secs: u64,
    /// Answer failures with a spoken apology instead of an `Error` frame
    pub fallback_on_error: bool,
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            streaming: StreamingConfig {
                response_chunk_size: 4096,     // 4KB response chunks
                chunk_pacing_ms: 50,
                max_concurrent_sessions: 100,
                max_frame_bytes: 1024 * 1024,  // 1MB per client message
                max_utterance_bytes: 25 * 1024 * 1024, // Whisper upload limit
                inbound_queue_frames: 256,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            pipeline: PipelineConfig {
                openai_api_key: None,
                openai_base_url: "https://api.openai.com/v1".to_string(),
                transcription_model: "whisper-1".to_string(),
                chat_model: "gpt-4".to_string(),
                tts_model: "tts-1".to_string(),
                tts_voice: "alloy".to_string(),
                yelp_api_key: None,
                yelp_base_url: "https://api.yelp.com/v3".to_string(),
                search_limit: 10,
                request_timeout_secs: 60,
                fallback_on_error: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_STREAMING__CHUNK_PACING_MS=20`: Faster response streaming
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform conventions
    /// - `OPENAI_API_KEY` / `YELP_API_KEY`: Service credentials
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names can keep their underscores
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("pipeline.openai_api_key", key)?;
        }

        if let Ok(key) = env::var("YELP_API_KEY") {
            settings = settings.set_override("pipeline.yelp_api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.streaming.response_chunk_size == 0 {
            return Err(anyhow::anyhow!("Response chunk size must be greater than 0"));
        }

        if self.streaming.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.streaming.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.streaming.max_utterance_bytes == 0 {
            return Err(anyhow::anyhow!("Max utterance size must be greater than 0"));
        }

        if self.streaming.inbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Inbound queue must hold at least one frame"));
        }

        if self.streaming.client_timeout_secs <= self.streaming.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the streaming section can change at runtime; the listen address and
    /// service credentials are fixed for the life of the process.
    ///
    /// ## Partial updates:
    /// `{"streaming": {"chunk_pacing_ms": 20}}` changes the pacing and nothing else.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if partial_config.get("server").is_some() || partial_config.get("pipeline").is_some() {
            return Err(anyhow::anyhow!(
                "Only the streaming section can be updated at runtime"
            ));
        }

        if let Some(streaming) = partial_config.get("streaming") {
            if let Some(size) = streaming.get("response_chunk_size").and_then(|v| v.as_u64()) {
                self.streaming.response_chunk_size = size as usize;
            }
            if let Some(pacing) = streaming.get("chunk_pacing_ms").and_then(|v| v.as_u64()) {
                self.streaming.chunk_pacing_ms = pacing;
            }
            if let Some(sessions) = streaming.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.streaming.max_concurrent_sessions = sessions as usize;
            }
            if let Some(frame) = streaming.get("max_frame_bytes").and_then(|v| v.as_u64()) {
                self.streaming.max_frame_bytes = frame as usize;
            }
            // The two limits below apply to connections opened after the update
            if let Some(bytes) = streaming.get("max_utterance_bytes").and_then(|v| v.as_u64()) {
                self.streaming.max_utterance_bytes = bytes as usize;
            }
            if let Some(frames) = streaming.get("inbound_queue_frames").and_then(|v| v.as_u64()) {
                self.streaming.inbound_queue_frames = frames as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Configuration as JSON with credentials replaced by presence flags.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "streaming": self.streaming,
            "pipeline": {
                "openai_configured": self.pipeline.openai_api_key.is_some(),
                "openai_base_url": self.pipeline.openai_base_url,
                "transcription_model": self.pipeline.transcription_model,
                "chat_model": self.pipeline.chat_model,
                "tts_model": self.pipeline.tts_model,
                "tts_voice": self.pipeline.tts_voice,
                "yelp_configured": self.pipeline.yelp_api_key.is_some(),
                "yelp_base_url": self.pipeline.yelp_base_url,
                "search_limit": self.pipeline.search_limit,
                "request_timeout_secs": self.pipeline.request_timeout_secs,
                "fallback_on_error": self.pipeline.fallback_on_error
            }
        })
    }
}

//! # Processing Pipeline
//!
//! The external collaborator that turns one complete utterance into a spoken
//! answer. The dispatcher only sees the [`ProcessingPipeline`] trait; the
//! production implementation chains speech-to-text, intent analysis, a
//! restaurant search, response writing and text-to-speech.
//!
//! ## Modules:
//! - **openai**: Transcription, chat completions and speech synthesis over HTTP
//! - **yelp**: Business search client and response models
//! - **recommender**: The food recommendation chain and its intent routing

pub mod openai;
pub mod recommender;
pub mod yelp;

pub use recommender::FoodRecommendationPipeline;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// What the pipeline hands back for one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub response_text: String,
    pub audio_data: Bytes,
}

impl PipelineResult {
    pub fn new(response_text: impl Into<String>, audio_data: impl Into<Bytes>) -> Self {
        Self {
            response_text: response_text.into(),
            audio_data: audio_data.into(),
        }
    }
}

/// Failures raised by a pipeline stage. The display text is what the client
/// receives in the `Error` frame.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Upstream service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Turns a complete utterance into response text plus synthesized audio.
///
/// ## Rust Concepts:
/// - **async_trait**: Lets the dispatcher hold an `Arc<dyn ProcessingPipeline>`
/// - **Send + Sync**: One pipeline instance is shared by every session
#[async_trait]
pub trait ProcessingPipeline: Send + Sync {
    async fn process(&self, audio: Bytes) -> Result<PipelineResult, PipelineError>;
}

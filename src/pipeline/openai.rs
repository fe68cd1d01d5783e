//! OpenAI HTTP client: Whisper transcription, chat completions and speech.

use crate::config::PipelineConfig;
use crate::pipeline::PipelineError;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Thin wrapper over the three OpenAI endpoints the recommender uses.
pub struct OpenAiClient {
    api_key: Option<String>,
    base_url: String,
    transcription_model: String,
    chat_model: String,
    tts_model: String,
    tts_voice: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &PipelineConfig, client: Client) -> Self {
        Self {
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            transcription_model: config.transcription_model.clone(),
            chat_model: config.chat_model.clone(),
            tts_model: config.tts_model.clone(),
            tts_voice: config.tts_voice.clone(),
            client,
        }
    }

    fn api_key(&self) -> Result<&str, PipelineError> {
        self.api_key
            .as_deref()
            .ok_or(PipelineError::NotConfigured("OpenAI API key"))
    }

    /// Upload the utterance as `audio.webm` and return the transcript.
    pub async fn transcribe(&self, audio: Bytes) -> Result<String, PipelineError> {
        let api_key = self.api_key()?;
        info!(audio_bytes = audio.len(), "Starting transcription");

        let file_part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.webm")
            .mime_str("audio/webm")
            .map_err(|e| PipelineError::Transcription(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.transcription_model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Transcription(e.to_string()))?;

        let response = check_status(response).await?;
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Transcription(e.to_string()))?;

        debug!(transcript = %body.text, "Transcription completed");
        Ok(body.text)
    }

    /// Single chat completion; returns the first choice's content.
    pub async fn complete(&self, system: Option<&str>, user: &str) -> Result<String, PipelineError> {
        let api_key = self.api_key()?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": user}));

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.chat_model,
                "messages": messages,
            }))
            .send()
            .await?;

        let response = check_status(response).await?;
        let body: ChatResponse = response.json().await?;

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    /// Synthesize speech for `text`, returning the encoded audio bytes.
    pub async fn synthesize(&self, text: &str) -> Result<Bytes, PipelineError> {
        let api_key = self.api_key()?;
        info!(text_chars = text.chars().count(), "Starting speech synthesis");

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.tts_model,
                "voice": self.tts_voice,
                "input": text,
            }))
            .send()
            .await
            .map_err(|e| PipelineError::Synthesis(e.to_string()))?;

        let response = check_status(response).await?;
        let audio = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Synthesis(e.to_string()))?;

        debug!(audio_bytes = audio.len(), "Speech synthesis completed");
        Ok(audio)
    }
}

/// Turn a non-2xx response into `PipelineError::Upstream` with its body.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::Upstream {
        status: status.as_u16(),
        body,
    })
}

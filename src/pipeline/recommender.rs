//! # Food Recommendation Chain
//!
//! transcribe → analyze intent → route → (search → write answer) → synthesize
//!
//! Routing is a pure function of the analyzed intent so it can be tested
//! without any network access. Failures after transcription degrade into
//! polite canned replies; only transcription and synthesis errors escape,
//! and even those are turned into a spoken apology when
//! `fallback_on_error` is enabled.

use crate::config::PipelineConfig;
use crate::pipeline::openai::OpenAiClient;
use crate::pipeline::yelp::{Business, YelpClient};
use crate::pipeline::{PipelineError, PipelineResult, ProcessingPipeline};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};

pub const APOLOGY: &str = "Really sorry, can't help you with this";
pub const ASK_ZIP_CODE: &str = "I'd be happy to help you find restaurants! Could you please provide your zip code so I can find places near you?";
pub const ASK_CUISINE: &str = "I heard you're looking for a specific cuisine. Could you please specify what type of food you're in the mood for?";
pub const UNSUPPORTED_REQUEST: &str = "Really sorry, can't help you with this. I can help you find restaurants near you if you provide your zip code!";
pub const NO_RESULTS: &str = "I couldn't find any restaurants matching your criteria in that area. Please try a different location or cuisine type.";
pub const FORMATTING_FALLBACK: &str = "I found some great restaurants for you, but I'm having trouble formatting the response right now.";

pub const INTENT_TOP_RATED: &str = "finding cuisine near me";
pub const INTENT_SPECIFIC_CUISINE: &str = "find specific cuisine near me";

const INTENT_PROMPT: &str = r#"You are an AI assistant that analyzes user intent for a food recommendation system.
Analyze the following text and extract:
1. Intent: Either 'finding cuisine near me' or 'find specific cuisine near me' or 'unknown'
2. Zip code if mentioned
3. Cuisine type if mentioned (e.g., Italian, Chinese, Mexican, etc.)

Return your response in JSON format like this:
{
    "intent": "finding cuisine near me",
    "zipCode": "12345",
    "cuisineType": "Italian"
}

If no zip code or cuisine type is mentioned, set them to null."#;

/// Structured reading of what the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentAnalysis {
    #[serde(default = "unknown_intent")]
    pub intent: String,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub cuisine_type: Option<String>,
}

fn unknown_intent() -> String {
    "unknown".to_string()
}

impl IntentAnalysis {
    pub fn unknown() -> Self {
        Self {
            intent: unknown_intent(),
            zip_code: None,
            cuisine_type: None,
        }
    }

    /// Parse the chat model's reply. Anything unparseable means `unknown`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        match serde_json::from_str::<IntentAnalysis>(trimmed) {
            Ok(mut analysis) => {
                analysis.zip_code = non_empty(analysis.zip_code);
                analysis.cuisine_type = non_empty(analysis.cuisine_type);
                analysis
            }
            Err(e) => {
                warn!(error = %e, "Intent reply was not valid JSON");
                Self::unknown()
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// What to do next for an analyzed intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Reply(&'static str),
    Search {
        zip_code: String,
        cuisine: Option<String>,
    },
}

pub fn route_intent(analysis: &IntentAnalysis) -> Route {
    let Some(zip_code) = analysis.zip_code.clone() else {
        return Route::Reply(ASK_ZIP_CODE);
    };

    match analysis.intent.as_str() {
        INTENT_TOP_RATED => Route::Search {
            zip_code,
            cuisine: None,
        },
        INTENT_SPECIFIC_CUISINE => match analysis.cuisine_type.clone() {
            Some(cuisine) => Route::Search {
                zip_code,
                cuisine: Some(cuisine),
            },
            None => Route::Reply(ASK_CUISINE),
        },
        _ => Route::Reply(UNSUPPORTED_REQUEST),
    }
}

/// Prompt asking the chat model to present the search results.
pub fn recommendation_prompt(intent: &str, businesses: &[Business]) -> String {
    let listing = businesses
        .iter()
        .map(Business::summary_line)
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Based on the user's intent '{}' and the following restaurant information, \
         create a friendly, human-readable bulleted response recommending these restaurants:\n\n\
         {}\n\n\
         Make it conversational and helpful. Highlight the top-rated places and mention key details like ratings and cuisine types.",
        intent, listing
    )
}

/// Production pipeline backed by OpenAI and Yelp.
pub struct FoodRecommendationPipeline {
    openai: OpenAiClient,
    yelp: YelpClient,
    fallback_on_error: bool,
}

impl FoodRecommendationPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        if config.openai_api_key.is_none() {
            warn!("OpenAI API key not configured; utterances will fail until it is set");
        }
        if config.yelp_api_key.is_none() {
            warn!("Yelp API key not configured; restaurant searches will fail");
        }

        Ok(Self {
            openai: OpenAiClient::new(config, client.clone()),
            yelp: YelpClient::new(config, client),
            fallback_on_error: config.fallback_on_error,
        })
    }

    async fn analyze_intent(&self, transcript: &str) -> IntentAnalysis {
        let user = format!("Analyze this text: {}", transcript);
        match self.openai.complete(Some(INTENT_PROMPT), &user).await {
            Ok(raw) => IntentAnalysis::parse(&raw),
            Err(e) => {
                warn!(error = %e, "Intent analysis failed");
                IntentAnalysis::unknown()
            }
        }
    }

    async fn answer(&self, analysis: &IntentAnalysis) -> String {
        let (zip_code, cuisine) = match route_intent(analysis) {
            Route::Reply(text) => return text.to_string(),
            Route::Search { zip_code, cuisine } => (zip_code, cuisine),
        };

        let businesses = match self.yelp.search(&zip_code, cuisine.as_deref()).await {
            Ok(businesses) => businesses,
            Err(e) => {
                warn!(error = %e, "Restaurant lookup failed");
                return APOLOGY.to_string();
            }
        };

        if businesses.is_empty() {
            return NO_RESULTS.to_string();
        }

        let prompt = recommendation_prompt(&analysis.intent, &businesses);
        match self.openai.complete(None, &prompt).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => FORMATTING_FALLBACK.to_string(),
            Err(e) => {
                warn!(error = %e, "Response generation failed");
                FORMATTING_FALLBACK.to_string()
            }
        }
    }

    async fn run(&self, audio: Bytes) -> Result<PipelineResult, PipelineError> {
        let transcript = self.openai.transcribe(audio).await?;
        if transcript.trim().is_empty() {
            return Err(PipelineError::Transcription("no speech recognized".to_string()));
        }

        let analysis = self.analyze_intent(&transcript).await;
        info!(
            intent = %analysis.intent,
            zip_code = analysis.zip_code.as_deref().unwrap_or("-"),
            cuisine = analysis.cuisine_type.as_deref().unwrap_or("-"),
            "Intent analyzed"
        );

        let response_text = self.answer(&analysis).await;
        let audio_data = self.openai.synthesize(&response_text).await?;
        Ok(PipelineResult::new(response_text, audio_data))
    }

    async fn apology(&self) -> PipelineResult {
        let audio = match self.openai.synthesize(APOLOGY).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(error = %e, "Could not synthesize apology, sending text only");
                Bytes::new()
            }
        };
        PipelineResult::new(APOLOGY, audio)
    }
}

#[async_trait]
impl ProcessingPipeline for FoodRecommendationPipeline {
    async fn process(&self, audio: Bytes) -> Result<PipelineResult, PipelineError> {
        match self.run(audio).await {
            Ok(result) => Ok(result),
            Err(e) if self.fallback_on_error => {
                warn!(error = %e, "Pipeline failed, answering with apology");
                Ok(self.apology().await)
            }
            Err(e) => Err(e),
        }
    }
}

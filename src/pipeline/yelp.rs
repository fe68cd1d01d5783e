//! Yelp Fusion business search.

use crate::config::PipelineConfig;
use crate::pipeline::openai::check_status;
use crate::pipeline::PipelineError;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub businesses: Vec<Business>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Business {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rating: f32,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub location: Location,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
}

impl Business {
    /// One bullet line used when asking the chat model to write the answer.
    pub fn summary_line(&self) -> String {
        let categories = self
            .categories
            .iter()
            .map(|c| c.title.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "• {} - Rating: {}/5 ({} reviews) - {} - {}, {}, {}",
            self.name,
            self.rating,
            self.review_count,
            categories,
            self.location.address1.as_deref().unwrap_or(""),
            self.location.city,
            self.location.state
        )
    }
}

/// Search term for an optional cuisine.
pub fn search_term(cuisine: Option<&str>) -> String {
    match cuisine.map(str::trim).filter(|c| !c.is_empty()) {
        Some(cuisine) => format!("{} restaurants", cuisine),
        None => "restaurants".to_string(),
    }
}

pub struct YelpClient {
    api_key: Option<String>,
    base_url: String,
    limit: u32,
    client: Client,
}

impl YelpClient {
    pub fn new(config: &PipelineConfig, client: Client) -> Self {
        Self {
            api_key: config.yelp_api_key.clone(),
            base_url: config.yelp_base_url.trim_end_matches('/').to_string(),
            limit: config.search_limit,
            client,
        }
    }

    /// Top rated restaurants near `zip_code`, optionally narrowed to a cuisine.
    pub async fn search(&self, zip_code: &str, cuisine: Option<&str>) -> Result<Vec<Business>, PipelineError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(PipelineError::NotConfigured("Yelp API key"))?;
        let term = search_term(cuisine);
        info!(%term, location = zip_code, "Searching restaurants");

        let limit = self.limit.to_string();
        let response = self
            .client
            .get(format!("{}/businesses/search", self.base_url))
            .bearer_auth(api_key)
            .query(&[
                ("term", term.as_str()),
                ("location", zip_code),
                ("sort_by", "rating"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::Search(e.to_string()))?;

        let response = check_status(response).await?;
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Search(e.to_string()))?;

        debug!(found = body.businesses.len(), "Restaurant search completed");
        Ok(body.businesses)
    }
}

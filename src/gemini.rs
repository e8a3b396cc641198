//! Client for the generative backend (text and image models).
//!
//! Everything above this module talks to [`GenerationGateway`]; the Gemini REST
//! client is the production implementation and tests substitute fakes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::Config;
use crate::error::GenerationError;

#[async_trait]
pub trait GenerationGateway: Send + Sync {
    /// Run the text model and return its raw text reply.
    async fn generate_text(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Run the image model and return the first image as a `data:` URL.
    async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

impl GenerateContentResponse {
    fn into_parts(self) -> Vec<Part> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default()
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    text_model: String,
    image_model: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        text_model: &str,
        image_model: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        if api_key.trim().is_empty() {
            return Err(GenerationError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("mumin/", env!("CARGO_PKG_VERSION"))),
        );

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            text_model: text_model.to_string(),
            image_model: image_model.to_string(),
            temperature,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let api_key = config.gemini_api_key().ok_or(GenerationError::MissingApiKey)?;
        Self::new(
            &config.gemini.base_url,
            &api_key,
            &config.gemini.text_model,
            &config.gemini.image_model,
            config.gemini.temperature,
            config.gemini_timeout(),
        )
    }

    async fn generate_content(&self, model: &str, body: Value) -> Result<Vec<Part>, GenerationError> {
        let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url);
        debug!(model = %model, "calling generateContent");

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let payload: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::OutputParse(e.to_string()))?;
        Ok(payload.into_parts())
    }
}

#[async_trait]
impl GenerationGateway for GeminiClient {
    async fn generate_text(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": self.temperature },
        });
        let parts = self.generate_content(&self.text_model, body).await?;

        let text: String = parts.into_iter().filter_map(|p| p.text).collect();
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyOutput("No text generated in the response".to_string()));
        }
        Ok(text)
    }

    async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        });
        let parts = self.generate_content(&self.image_model, body).await?;

        parts
            .into_iter()
            .find_map(|p| p.inline_data)
            .map(|d| format!("data:{};base64,{}", d.mime_type, d.data))
            .ok_or_else(|| GenerationError::EmptyOutput("No image generated in the response".to_string()))
    }
}

//! Gemini `generateContent` REST client.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use colloquy_core::config::ModelConfig;
use colloquy_core::error::{ColloquyError, Result};

use crate::backend::{GenerateRequest, ModelBackend, Part};

/// Header carrying the API key. Keeping the key out of the URL keeps it out
/// of transport error messages.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Models offered when the listing endpoint is unreachable.
pub const FALLBACK_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.5-pro"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiBlob,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModelEntry {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

/// Client for the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ColloquyError::ModelRequest(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build from config, reading the key from the configured environment
    /// variable.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ColloquyError::Config(format!("{} is not set", config.api_key_env))
        })?;
        if api_key.trim().is_empty() {
            return Err(ColloquyError::Config(format!("{} is empty", config.api_key_env)));
        }
        Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn build_request(request: &GenerateRequest) -> GeminiRequest {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => GeminiPart::Text { text: text.clone() },
                Part::InlineImage { mime_type, data } => GeminiPart::InlineData {
                    inline_data: GeminiBlob {
                        mime_type: mime_type.clone(),
                        data: BASE64.encode(data),
                    },
                },
            })
            .collect();

        GeminiRequest {
            contents: vec![GeminiContent { role: "user", parts }],
            generation_config: GeminiGenerationConfig {
                temperature: request.settings.temperature,
                top_p: request.settings.top_p,
                top_k: request.settings.top_k,
                max_output_tokens: request.settings.max_output_tokens,
            },
        }
    }
}

/// Map a non-200 response to a readable message.
fn status_error(status: StatusCode, body: &str) -> ColloquyError {
    let detail = serde_json::from_str::<GeminiErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let kind = match status.as_u16() {
        401 | 403 => "authentication failed",
        429 => "rate limited",
        400 | 404 => "invalid request",
        500..=599 => "server error",
        _ => "unexpected status",
    };
    ColloquyError::ModelRequest(format!("{} ({}): {}", kind, status.as_u16(), detail))
}

fn extract_text(response: GeminiResponse) -> Result<String> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ColloquyError::ModelRequest(format!("Prompt blocked: {}", reason)));
    }
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ColloquyError::ModelRequest("No candidates in response".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
        return Err(ColloquyError::ModelRequest(format!(
            "Empty response (finish reason: {})",
            reason
        )));
    }
    Ok(text)
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn provider(&self) -> &str {
        "Google Gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = Self::build_request(request);
        debug!(model = %self.model, parts = request.parts.len(), "Sending generateContent request");

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| ColloquyError::ModelRequest(format!("Request failed: {}", e.without_url())))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| {
                ColloquyError::ModelRequest(format!("Failed to read response: {}", e.without_url()))
            })?;

        if status != StatusCode::OK {
            error!(%status, "Gemini API error response");
            return Err(status_error(status, &text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text).map_err(|e| {
            ColloquyError::ModelRequest(format!("Malformed response: {}", e))
        })?;
        extract_text(parsed)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .send()
            .await
            .map_err(|e| ColloquyError::ModelRequest(format!("Request failed: {}", e.without_url())))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Model listing failed");
            return Err(status_error(status, &body));
        }

        let list: GeminiModelList = response
            .json()
            .await
            .map_err(|e| {
                ColloquyError::ModelRequest(format!("Malformed model list: {}", e.without_url()))
            })?;

        Ok(list
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| m.name.trim_start_matches("models/").to_string())
            .collect())
    }
}

//! Speech-to-text services.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, warn};

use colloquy_core::config::VoiceConfig;
use colloquy_core::error::{ColloquyError, Result};

use crate::endpoint::AudioClip;

/// Turns captured audio into text.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// `Ok(None)` means the audio held no intelligible speech.
    async fn recognize(&self, clip: &AudioClip) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct RecognitionLine {
    #[serde(default)]
    result: Vec<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternative: Vec<RecognitionAlternative>,
}

#[derive(Debug, Deserialize)]
struct RecognitionAlternative {
    transcript: Option<String>,
}

/// Client for a Google speech-api v2 compatible endpoint.
///
/// Audio is posted as `audio/l16`; the reply is newline-delimited JSON where
/// the first non-empty `result` carries the transcript.
#[derive(Debug, Clone)]
pub struct RemoteRecognizer {
    http: HttpClient,
    url: String,
    language: String,
    key: Option<String>,
}

impl RemoteRecognizer {
    pub fn new(url: impl Into<String>, language: impl Into<String>, key: Option<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ColloquyError::RecognitionService(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
            language: language.into(),
            key: key.filter(|k| !k.is_empty()),
        })
    }

    pub fn from_config(config: &VoiceConfig) -> Result<Self> {
        Self::new(
            config.recognition_url.clone(),
            config.language.clone(),
            Some(config.recognition_key.clone()),
        )
    }
}

/// First transcript in a newline-delimited recognition reply.
fn parse_transcript(body: &str) -> Result<Option<String>> {
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parsed: RecognitionLine = serde_json::from_str(line).map_err(|e| {
            ColloquyError::RecognitionService(format!("Malformed recognition reply: {}", e))
        })?;
        let transcript = parsed
            .result
            .into_iter()
            .flat_map(|r| r.alternative)
            .find_map(|a| a.transcript)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if transcript.is_some() {
            return Ok(transcript);
        }
    }
    Ok(None)
}

#[async_trait]
impl SpeechRecognizer for RemoteRecognizer {
    async fn recognize(&self, clip: &AudioClip) -> Result<Option<String>> {
        let mut query = vec![
            ("client", "chromium".to_string()),
            ("lang", self.language.clone()),
            ("output", "json".to_string()),
        ];
        if let Some(key) = &self.key {
            query.push(("key", key.clone()));
        }
        debug!(secs = clip.duration().as_secs_f32(), "Sending audio for recognition");

        let response = self
            .http
            .post(&self.url)
            .query(&query)
            .header("Content-Type", format!("audio/l16; rate={}", clip.sample_rate))
            .body(clip.to_l16())
            .send()
            .await
            .map_err(|e| {
                // The service key rides in the query string.
                ColloquyError::RecognitionService(format!("Request failed: {}", e.without_url()))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| {
                ColloquyError::RecognitionService(format!("Failed to read reply: {}", e.without_url()))
            })?;
        if !status.is_success() {
            warn!(%status, "Recognition service error");
            return Err(ColloquyError::RecognitionService(format!(
                "Service returned {}",
                status.as_u16()
            )));
        }
        parse_transcript(&body)
    }
}

/// Scripted recognizer for testing.
///
/// Pops one scripted outcome per call, then answers `Ok(None)`. An `Err`
/// entry becomes `RecognitionService`.
#[derive(Debug, Default)]
pub struct MockRecognizer {
    script: Mutex<VecDeque<std::result::Result<Option<String>, String>>>,
}

impl MockRecognizer {
    pub fn new(script: Vec<std::result::Result<Option<String>, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    /// Always recognizes `text` once.
    pub fn hearing(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(Some(text.into()))])
    }
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    async fn recognize(&self, _clip: &AudioClip) -> Result<Option<String>> {
        let next = self
            .script
            .lock()
            .map_err(|_| ColloquyError::RecognitionService("Mock state poisoned".to_string()))?
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(ColloquyError::RecognitionService(message)),
            None => Ok(None),
        }
    }
}

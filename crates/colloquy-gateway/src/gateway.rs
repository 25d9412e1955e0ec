//! Prompt construction and the success/error contract around a backend.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::types::{ChatMessage, ChatRole};

use crate::backend::{GenerateRequest, ModelBackend, Part};
use crate::gemini::FALLBACK_MODELS;
use crate::settings::{GenerationSettings, SettingsUpdate};

pub const DEFAULT_IMAGE_QUESTION: &str = "What do you see in this image?";

const CONVERSATION_PREAMBLE: &str =
    "You are a helpful AI assistant. Here's our conversation history:\n\n";
/// Messages of history included in a conversation prompt.
const CONVERSATION_WINDOW: usize = 20;
const CONNECTION_TEST_MESSAGE: &str = "Hello, this is a test message.";

/// Approximate token counts.
///
/// These are whitespace-separated word counts, not tokenizer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = count_words(prompt);
        let completion_tokens = count_words(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Whitespace word count used as the token estimate.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Outcome of a gateway call. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResult {
    pub success: bool,
    /// Model text on success, a user-facing apology on failure.
    pub response: String,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    pub error: Option<String>,
}

impl GatewayResult {
    fn ok(response: String, usage: Usage, model: &str) -> Self {
        Self {
            success: true,
            response,
            usage: Some(usage),
            model: Some(model.to_string()),
            error: None,
        }
    }

    fn failed(response: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: response.into(),
            usage: None,
            model: None,
            error: Some(error.into()),
        }
    }
}

/// One exchange for [`AiGateway::format_conversation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user: String,
    #[serde(default)]
    pub assistant: Option<String>,
}

/// Description of the active model for settings screens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub provider: String,
    pub available_models: Vec<String>,
    pub features: Vec<String>,
    pub generation: GenerationSettings,
}

/// Front door to the hosted model.
pub struct AiGateway {
    backend: Arc<dyn ModelBackend>,
    settings: Mutex<GenerationSettings>,
}

impl AiGateway {
    pub fn new(backend: Arc<dyn ModelBackend>, settings: GenerationSettings) -> Self {
        Self {
            backend,
            settings: Mutex::new(settings),
        }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Current sampling parameters.
    pub fn settings(&self) -> GenerationSettings {
        match self.settings.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Apply a partial, clamped update and return the result.
    pub fn update_settings(&self, update: &SettingsUpdate) -> GenerationSettings {
        let mut guard = match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.apply(update);
        info!(settings = ?*guard, "Generation settings updated");
        *guard
    }

    /// Answer a text prompt, optionally behind a system preamble.
    pub async fn text_response(&self, message: &str, system_preamble: Option<&str>) -> GatewayResult {
        let prompt = match system_preamble {
            Some(preamble) => format!("{}\n\nUser: {}", preamble, message),
            None => message.to_string(),
        };
        let request = GenerateRequest::text(prompt.clone(), self.settings());

        match self.backend.generate(&request).await {
            Ok(text) => {
                let usage = Usage::estimate(&prompt, &text);
                GatewayResult::ok(text, usage, self.backend.model())
            }
            Err(e) => {
                warn!(error = %e, "Text generation failed");
                let msg = e.to_string();
                GatewayResult::failed(format!("Sorry, I encountered an error: {}", msg), msg)
            }
        }
    }

    /// Ask a question about an image file.
    ///
    /// A missing file fails without contacting the model.
    pub async fn analyze_image(&self, path: &Path, question: Option<&str>) -> GatewayResult {
        if !path.is_file() {
            return GatewayResult::failed("Image file not found", "File not found");
        }
        let question = question.unwrap_or(DEFAULT_IMAGE_QUESTION);

        let jpeg = match load_as_jpeg(path.to_path_buf()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not load image for analysis");
                let msg = e.to_string();
                return GatewayResult::failed(format!("Failed to load image: {}", msg), msg);
            }
        };

        let request = GenerateRequest {
            parts: vec![
                Part::Text(question.to_string()),
                Part::InlineImage {
                    mime_type: "image/jpeg".to_string(),
                    data: jpeg,
                },
            ],
            settings: self.settings(),
        };

        match self.backend.generate(&request).await {
            Ok(text) => {
                let usage = Usage::estimate(question, &text);
                GatewayResult::ok(text, usage, self.backend.model())
            }
            Err(e) => {
                warn!(error = %e, "Image analysis failed");
                let msg = e.to_string();
                GatewayResult::failed(format!("Sorry, I couldn't analyze the image: {}", msg), msg)
            }
        }
    }

    /// Answer `new_message` in the context of the recent session history.
    pub async fn conversation_response(
        &self,
        history: &[ChatMessage],
        new_message: &str,
    ) -> GatewayResult {
        self.text_response(&build_transcript(history, new_message), None)
            .await
    }

    /// Models reachable through the backend, or a fixed fallback list.
    pub async fn available_models(&self) -> Vec<String> {
        match self.backend.list_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => fallback_models(),
            Err(e) => {
                warn!(error = %e, "Model listing failed, using fallback list");
                fallback_models()
            }
        }
    }

    pub async fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model: self.backend.model().to_string(),
            provider: self.backend.provider().to_string(),
            available_models: self.available_models().await,
            features: vec![
                "text_generation".to_string(),
                "image_analysis".to_string(),
                "conversation".to_string(),
            ],
            generation: self.settings(),
        }
    }

    /// Send a fixed greeting and report whether the model answered.
    pub async fn test_connection(&self) -> bool {
        self.text_response(CONNECTION_TEST_MESSAGE, None).await.success
    }

    /// Expand turns into alternating user/model messages in the Gemini
    /// `contents` shape.
    pub fn format_conversation(turns: &[ConversationTurn]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(turns.len() * 2);
        for turn in turns {
            messages.push(json!({ "role": "user", "parts": [{ "text": turn.user }] }));
            if let Some(answer) = &turn.assistant {
                messages.push(json!({ "role": "model", "parts": [{ "text": answer }] }));
            }
        }
        messages
    }
}

impl std::fmt::Debug for AiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiGateway")
            .field("model", &self.backend.model())
            .field("settings", &self.settings())
            .finish()
    }
}

fn fallback_models() -> Vec<String> {
    FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
}

/// Preamble, the last messages as `User:`/`Assistant:` lines, then the new
/// message.
fn build_transcript(history: &[ChatMessage], new_message: &str) -> String {
    let start = history.len().saturating_sub(CONVERSATION_WINDOW);
    let mut transcript = String::from(CONVERSATION_PREAMBLE);
    for message in &history[start..] {
        let speaker = match message.role {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        };
        transcript.push_str(&format!("{}: {}\n", speaker, message.content));
    }
    transcript.push_str(&format!("\nNow respond to: {}", new_message));
    transcript
}

/// Decode, flatten to RGB and re-encode as JPEG off the async runtime.
async fn load_as_jpeg(path: PathBuf) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let img = image::open(&path)
            .map_err(|e| ColloquyError::InvalidImage(e.to_string()))?
            .to_rgb8();
        let mut buf = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buf, 90)
            .encode_image(&img)
            .map_err(|e| ColloquyError::InvalidImage(e.to_string()))?;
        Ok(buf.into_inner())
    })
    .await
    .map_err(|e| ColloquyError::InvalidImage(format!("Image task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use chrono::Utc;

    fn gateway(stub: Arc<StubBackend>) -> AiGateway {
        AiGateway::new(stub, GenerationSettings::default())
    }

    fn message(id: u64, role: ChatRole, content: &str) -> ChatMessage {
        ChatMessage {
            id,
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn only_text(request: &GenerateRequest) -> String {
        match &request.parts[..] {
            [Part::Text(text)] => text.clone(),
            other => panic!("expected a single text part, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_response_success() {
        let stub = Arc::new(StubBackend::replying("pong"));
        let result = gateway(stub.clone()).text_response("ping", None).await;

        assert!(result.success);
        assert_eq!(result.response, "pong");
        assert_eq!(result.model.as_deref(), Some("stub-model"));
        assert!(result.error.is_none());
        let usage = result.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 1);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 2);
        assert_eq!(only_text(&stub.requests()[0]), "ping");
    }

    #[tokio::test]
    async fn test_text_response_with_preamble() {
        let stub = Arc::new(StubBackend::replying("ok"));
        gateway(stub.clone())
            .text_response("hello there", Some("Be brief."))
            .await;
        assert_eq!(only_text(&stub.requests()[0]), "Be brief.\n\nUser: hello there");
    }

    #[tokio::test]
    async fn test_text_response_failure_is_a_value() {
        let stub = Arc::new(StubBackend::failing("quota exceeded"));
        let result = gateway(stub).text_response("ping", None).await;

        assert!(!result.success);
        assert!(result.usage.is_none());
        assert!(result.model.is_none());
        assert_eq!(result.error.as_deref(), Some("Model request failed: quota exceeded"));
        assert_eq!(
            result.response,
            "Sorry, I encountered an error: Model request failed: quota exceeded"
        );
    }

    #[tokio::test]
    async fn test_analyze_missing_image_skips_backend() {
        let stub = Arc::new(StubBackend::replying("never"));
        let result = gateway(stub.clone())
            .analyze_image(Path::new("/nonexistent.png"), Some("describe"))
            .await;

        assert!(!result.success);
        assert_eq!(result.response, "Image file not found");
        assert_eq!(result.error.as_deref(), Some("File not found"));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_analyze_image_sends_question_and_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        image::RgbaImage::new(4, 4).save(&path).unwrap();

        let stub = Arc::new(StubBackend::replying("a small black square"));
        let result = gateway(stub.clone()).analyze_image(&path, None).await;

        assert!(result.success);
        assert_eq!(result.usage.unwrap().prompt_tokens, count_words(DEFAULT_IMAGE_QUESTION));
        let request = &stub.requests()[0];
        assert_eq!(request.parts[0], Part::Text(DEFAULT_IMAGE_QUESTION.to_string()));
        match &request.parts[1] {
            Part::InlineImage { mime_type, data } => {
                assert_eq!(mime_type, "image/jpeg");
                assert_eq!(&data[..2], &[0xFF, 0xD8]);
            }
            other => panic!("expected image part, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_undecodable_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        let stub = Arc::new(StubBackend::replying("never"));
        let result = gateway(stub.clone()).analyze_image(&path, Some("what?")).await;
        assert!(!result.success);
        assert!(result.response.starts_with("Failed to load image: "));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_analyze_backend_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.png");
        image::RgbImage::new(2, 2).save(&path).unwrap();

        let stub = Arc::new(StubBackend::failing("boom"));
        let result = gateway(stub).analyze_image(&path, Some("what?")).await;
        assert!(!result.success);
        assert_eq!(
            result.response,
            "Sorry, I couldn't analyze the image: Model request failed: boom"
        );
    }

    #[tokio::test]
    async fn test_conversation_transcript_uses_last_twenty() {
        let history: Vec<ChatMessage> = (0..25)
            .map(|i| {
                let role = if i % 2 == 0 { ChatRole::User } else { ChatRole::Assistant };
                message(i, role, &format!("m{}", i))
            })
            .collect();

        let transcript = build_transcript(&history, "next?");
        assert!(transcript.starts_with(CONVERSATION_PREAMBLE));
        assert!(!transcript.contains("m4\n"));
        assert!(transcript.contains("Assistant: m5\n"));
        assert!(transcript.contains("User: m24\n"));
        assert!(transcript.ends_with("\nNow respond to: next?"));
        assert_eq!(transcript.lines().filter(|l| l.starts_with("User: ") || l.starts_with("Assistant: ")).count(), 20);
    }

    #[tokio::test]
    async fn test_conversation_response_sends_transcript() {
        let stub = Arc::new(StubBackend::replying("sure"));
        let history = vec![
            message(1, ChatRole::User, "hi"),
            message(2, ChatRole::Assistant, "hello"),
        ];
        let result = gateway(stub.clone()).conversation_response(&history, "how are you").await;
        assert!(result.success);
        assert_eq!(
            only_text(&stub.requests()[0]),
            format!("{}User: hi\nAssistant: hello\n\nNow respond to: how are you", CONVERSATION_PREAMBLE)
        );
    }

    #[tokio::test]
    async fn test_settings_flow_into_requests() {
        let stub = Arc::new(StubBackend::replying("ok"));
        let gw = gateway(stub.clone());
        let updated = gw.update_settings(&SettingsUpdate {
            temperature: Some(5.0),
            top_k: Some(10),
            ..SettingsUpdate::default()
        });
        assert_eq!(updated.temperature, 1.0);
        assert_eq!(gw.settings().top_k, 10);

        gw.text_response("hi", None).await;
        assert_eq!(stub.requests()[0].settings.top_k, 10);
    }

    #[tokio::test]
    async fn test_model_info_and_connection() {
        let stub = Arc::new(StubBackend::replying("hello"));
        let gw = gateway(stub);
        let info = gw.model_info().await;
        assert_eq!(info.model, "stub-model");
        assert_eq!(info.provider, "Stub");
        assert_eq!(info.available_models, vec!["stub-model".to_string()]);
        assert!(gw.test_connection().await);

        let failing = gateway(Arc::new(StubBackend::failing("down")));
        assert!(!failing.test_connection().await);
    }

    #[test]
    fn test_format_conversation() {
        let turns = vec![
            ConversationTurn {
                user: "hi".into(),
                assistant: Some("hello".into()),
            },
            ConversationTurn {
                user: "bye".into(),
                assistant: None,
            },
        ];
        let messages = AiGateway::format_conversation(&turns);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "model");
        assert_eq!(messages[1]["parts"][0]["text"], "hello");
        assert_eq!(messages[2]["parts"][0]["text"], "bye");
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_reveal_api_key() {
        let backend = crate::gemini::GeminiBackend::new(
            "SECRET-KEY-123",
            "gemini-2.5-flash",
            "http://127.0.0.1:1",
            std::time::Duration::from_secs(2),
        )
        .unwrap();
        let gw = AiGateway::new(Arc::new(backend), GenerationSettings::default());

        let result = gw.text_response("ping", None).await;
        assert!(!result.success);
        assert!(result.response.starts_with("Sorry, I encountered an error"));
        assert!(!result.response.contains("SECRET-KEY-123"));
        assert!(!result.error.unwrap_or_default().contains("SECRET-KEY-123"));
    }

    #[test]
    fn test_count_words() {
        assert_eq!(count_words("  one two\tthree\n"), 3);
        assert_eq!(count_words(""), 0);
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use colloquy_core::error::{ColloquyError, Result};

use crate::settings::GenerationSettings;

/// One piece of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineImage { mime_type: String, data: Vec<u8> },
}

/// A single-turn generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub parts: Vec<Part>,
    pub settings: GenerationSettings,
}

impl GenerateRequest {
    pub fn text(prompt: impl Into<String>, settings: GenerationSettings) -> Self {
        Self {
            parts: vec![Part::Text(prompt.into())],
            settings,
        }
    }
}

/// A hosted model that turns a prompt into text.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider name for display, e.g. "Google Gemini".
    fn provider(&self) -> &str;

    /// Model identifier requests are sent to.
    fn model(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<String>;

    /// Models this backend can reach.
    async fn list_models(&self) -> Result<Vec<String>>;
}

/// Backend that replays canned replies, for tests and offline checks.
///
/// Replies are consumed in order; once exhausted the last reply repeats.
/// An `Err` entry is returned as `ModelRequest`.
#[derive(Debug, Default)]
pub struct StubBackend {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    last: Mutex<Option<std::result::Result<String, String>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    calls: AtomicUsize,
}

impl StubBackend {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self::with_replies(vec![Ok(reply.into())])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_replies(vec![Err(message.into())])
    }

    pub fn with_replies(replies: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Number of `generate` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    fn provider(&self) -> &str {
        "Stub"
    }

    fn model(&self) -> &str {
        "stub-model"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }

        let mut replies = self
            .replies
            .lock()
            .map_err(|_| ColloquyError::ModelRequest("Stub state poisoned".to_string()))?;
        let mut last = self
            .last
            .lock()
            .map_err(|_| ColloquyError::ModelRequest("Stub state poisoned".to_string()))?;
        if let Some(next) = replies.pop_front() {
            *last = Some(next);
        }
        match last.clone() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(ColloquyError::ModelRequest(message)),
            None => Err(ColloquyError::ModelRequest("No stub reply configured".to_string())),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![self.model().to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_replays_in_order_then_repeats() {
        let stub = StubBackend::with_replies(vec![Ok("one".into()), Ok("two".into())]);
        let req = GenerateRequest::text("hi", GenerationSettings::default());
        assert_eq!(stub.generate(&req).await.unwrap(), "one");
        assert_eq!(stub.generate(&req).await.unwrap(), "two");
        assert_eq!(stub.generate(&req).await.unwrap(), "two");
        assert_eq!(stub.calls(), 3);
        assert_eq!(stub.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_stub_failure() {
        let stub = StubBackend::failing("quota exceeded");
        let req = GenerateRequest::text("hi", GenerationSettings::default());
        let err = stub.generate(&req).await.unwrap_err();
        assert_eq!(err.to_string(), "Model request failed: quota exceeded");
    }
}

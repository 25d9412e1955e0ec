//! Error types for chat orchestration.

use colloquy_core::error::ColloquyError;
use uuid::Uuid;

/// Errors from the chat orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("assistant message not found: {0}")]
    MessageNotFound(u64),
    #[error(transparent)]
    Core(#[from] ColloquyError),
}

impl ChatError {
    /// Machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::EmptyMessage => "empty_message",
            ChatError::SessionNotFound(_) => "session_not_found",
            ChatError::MessageNotFound(_) => "message_not_found",
            ChatError::Core(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_error_display() {
        assert_eq!(ChatError::EmptyMessage.to_string(), "message cannot be empty");

        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            ChatError::SessionNotFound(id).to_string(),
            "session not found: 550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            ChatError::MessageNotFound(7).to_string(),
            "assistant message not found: 7"
        );
    }

    #[test]
    fn test_core_errors_pass_through() {
        let err: ChatError = ColloquyError::Camera("no device".into()).into();
        assert_eq!(err.to_string(), "Camera error: no device");
        assert_eq!(err.code(), "camera");
        assert_eq!(ChatError::EmptyMessage.code(), "empty_message");
    }
}

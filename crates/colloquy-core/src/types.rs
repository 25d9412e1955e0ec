use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ColloquyError;

// =============================================================================
// Enums
// =============================================================================

/// What the user submitted for a turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Plain text prompt.
    #[default]
    Text,
    /// Prompt about an attached or captured image.
    Image,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Text => "text",
            QueryKind::Image => "image",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryKind {
    type Err = ColloquyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(QueryKind::Text),
            "image" => Ok(QueryKind::Image),
            other => Err(ColloquyError::Storage(format!(
                "Unknown query kind: {}",
                other
            ))),
        }
    }
}

/// Author of an in-session chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

// =============================================================================
// Conversation log
// =============================================================================

/// One persisted turn: a user query and the assistant's response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Store-assigned, strictly increasing in insertion order.
    pub id: i64,
    pub user_query: String,
    pub ai_response: String,
    /// Insertion time, second resolution.
    pub created_at: DateTime<Utc>,
    pub kind: QueryKind,
    /// Path of the image the query referred to, if any.
    pub image_ref: Option<String>,
}

/// Insert payload for the conversation store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub user_query: String,
    pub ai_response: String,
    #[serde(default)]
    pub kind: QueryKind,
    #[serde(default)]
    pub image_ref: Option<String>,
}

impl NewConversation {
    pub fn text(user_query: impl Into<String>, ai_response: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            ai_response: ai_response.into(),
            kind: QueryKind::Text,
            image_ref: None,
        }
    }

    pub fn image(
        user_query: impl Into<String>,
        ai_response: impl Into<String>,
        image_ref: impl Into<String>,
    ) -> Self {
        Self {
            user_query: user_query.into(),
            ai_response: ai_response.into(),
            kind: QueryKind::Image,
            image_ref: Some(image_ref.into()),
        }
    }
}

/// Aggregate counts over the conversation log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total: u64,
    /// Record count per query kind ("text", "image").
    pub by_kind: BTreeMap<String, u64>,
    /// Records created within the last 7 days.
    pub recent: u64,
}

// =============================================================================
// Media
// =============================================================================

/// Metadata about an image on disk. The bytes themselves are never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub path: String,
    pub filename: String,
    pub format: String,
    /// Color model, e.g. "RGB", "RGBA", "L".
    pub color_mode: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
}

// =============================================================================
// Session
// =============================================================================

/// A message shown in a chat session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_kind_roundtrip() {
        for kind in [QueryKind::Text, QueryKind::Image] {
            assert_eq!(kind.as_str().parse::<QueryKind>().unwrap(), kind);
        }
        assert!("video".parse::<QueryKind>().is_err());
    }

    #[test]
    fn test_query_kind_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&QueryKind::Image).unwrap(), "\"image\"");
        assert_eq!(serde_json::to_string(&ChatRole::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn test_new_conversation_constructors() {
        let text = NewConversation::text("hi", "hello");
        assert_eq!(text.kind, QueryKind::Text);
        assert!(text.image_ref.is_none());

        let image = NewConversation::image("cat?", "a feline", "/tmp/cat.png");
        assert_eq!(image.kind, QueryKind::Image);
        assert_eq!(image.image_ref.as_deref(), Some("/tmp/cat.png"));
    }

    #[test]
    fn test_new_conversation_defaults_when_deserializing() {
        let parsed: NewConversation =
            serde_json::from_str(r#"{"user_query":"q","ai_response":"a"}"#).unwrap();
        assert_eq!(parsed.kind, QueryKind::Text);
        assert!(parsed.image_ref.is_none());
    }
}

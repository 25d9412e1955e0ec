//! Per-session chat state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_core::types::{ChatMessage, ChatRole};
use colloquy_voice::SpeechTask;

/// State of one chat session, from creation until it is ended.
#[derive(Debug)]
pub struct SessionContext {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
    message_counter: u64,
    current_image: Option<PathBuf>,
    pub auto_read: bool,
    playing_message: Option<u64>,
    playback: Option<SpeechTask>,
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    pub current_image: Option<PathBuf>,
    pub auto_read: bool,
    pub playing_message: Option<u64>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            messages: Vec::new(),
            message_counter: 0,
            current_image: None,
            auto_read: false,
            playing_message: None,
            playback: None,
        }
    }

    /// Append a message with the next id and return a copy of it.
    pub fn add_message(&mut self, role: ChatRole, content: impl Into<String>) -> ChatMessage {
        self.message_counter += 1;
        let message = ChatMessage {
            id: self.message_counter,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        };
        self.messages.push(message.clone());
        message
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn message(&self, id: u64) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn current_image(&self) -> Option<&Path> {
        self.current_image.as_deref()
    }

    pub fn set_image(&mut self, path: PathBuf) {
        self.current_image = Some(path);
    }

    pub fn clear_image(&mut self) {
        self.current_image = None;
    }

    /// Drop all messages and the attached image. Message ids keep counting.
    pub fn clear_chat(&mut self) {
        self.messages.clear();
        self.current_image = None;
    }

    /// The message being read aloud, if its playback is still running.
    ///
    /// Playback stopped from elsewhere (another session speaking through the
    /// shared bridge) counts as not playing.
    pub fn playing_message(&self) -> Option<u64> {
        match &self.playback {
            Some(task) if !task.is_finished() && !task.is_cancelled() => self.playing_message,
            _ => None,
        }
    }

    pub fn start_playback(&mut self, message_id: u64, task: SpeechTask) {
        if let Some(previous) = self.playback.replace(task) {
            previous.stop();
        }
        self.playing_message = Some(message_id);
    }

    /// Stop playback. Returns whether anything was still playing.
    pub fn stop_playback(&mut self) -> bool {
        let was_playing = self.playing_message().is_some();
        if let Some(task) = self.playback.take() {
            task.stop();
        }
        self.playing_message = None;
        was_playing
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            created_at: self.created_at,
            messages: self.messages.clone(),
            current_image: self.current_image.clone(),
            auto_read: self.auto_read,
            playing_message: self.playing_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use colloquy_voice::MockSynthesizer;

    #[test]
    fn test_message_ids_increase_across_clear() {
        let mut session = SessionContext::new();
        let first = session.add_message(ChatRole::User, "hi");
        let second = session.add_message(ChatRole::Assistant, "hello");
        assert_eq!((first.id, second.id), (1, 2));

        session.set_image(PathBuf::from("/tmp/cat.jpg"));
        session.clear_chat();
        assert!(session.messages().is_empty());
        assert!(session.current_image().is_none());

        let third = session.add_message(ChatRole::User, "again");
        assert_eq!(third.id, 3);
        assert_eq!(session.message(3).unwrap().content, "again");
        assert!(session.message(1).is_none());
    }

    #[test]
    fn test_image_attach_and_clear() {
        let mut session = SessionContext::new();
        session.set_image(PathBuf::from("/tmp/a.png"));
        assert_eq!(session.current_image(), Some(Path::new("/tmp/a.png")));
        session.clear_image();
        assert!(session.current_image().is_none());
    }

    #[tokio::test]
    async fn test_playback_bookkeeping() {
        let synth = Arc::new(MockSynthesizer::with_duration(Duration::from_secs(5)));
        let mut session = SessionContext::new();
        assert!(session.playing_message().is_none());
        assert!(!session.stop_playback());

        let task = SpeechTask::spawn(synth.clone(), "reading");
        session.start_playback(4, task.clone());
        assert_eq!(session.playing_message(), Some(4));
        assert_eq!(session.snapshot().playing_message, Some(4));

        assert!(session.stop_playback());
        task.join().await.unwrap();
        assert!(session.playing_message().is_none());
        assert!(synth.completed().is_empty());
    }

    #[tokio::test]
    async fn test_finished_playback_is_not_playing() {
        let synth = Arc::new(MockSynthesizer::new());
        let mut session = SessionContext::new();
        let task = SpeechTask::spawn(synth, "short");
        session.start_playback(2, task.clone());
        task.join().await.unwrap();
        assert!(session.playing_message().is_none());
    }

    #[tokio::test]
    async fn test_playback_stopped_elsewhere_is_not_playing() {
        let synth = Arc::new(MockSynthesizer::with_duration(Duration::from_secs(5)));
        let mut session = SessionContext::new();
        let task = SpeechTask::spawn(synth, "interrupted");
        session.start_playback(3, task.clone());
        assert_eq!(session.playing_message(), Some(3));

        task.stop();
        assert!(session.playing_message().is_none());
        assert!(session.snapshot().playing_message.is_none());
        assert!(!session.stop_playback());
        task.join().await.unwrap();
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut session = SessionContext::new();
        session.add_message(ChatRole::User, "hi");
        session.auto_read = true;
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["auto_read"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["playing_message"].is_null());
    }
}

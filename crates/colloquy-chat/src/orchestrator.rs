//! Chat orchestrator: routes session turns between gateway, store and voice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use colloquy_core::error::ColloquyError;
use colloquy_core::types::{ChatMessage, ChatRole, NewConversation, QueryKind};
use colloquy_gateway::{AiGateway, GatewayResult, Usage};
use colloquy_media::{CameraManager, ImageProcessor};
use colloquy_storage::ConversationStore;
use colloquy_voice::VoiceBridge;

use crate::error::ChatError;
use crate::session::{SessionContext, SessionSnapshot};

const CAMERA_QUESTION: &str = "What do you see in this image? Please describe it in detail.";
const CAMERA_QUERY: &str = "Camera capture - What do you see?";
/// Longest phrase accepted from a single voice input.
const VOICE_PHRASE_LIMIT: Duration = Duration::from_secs(10);

/// Result of one user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub success: bool,
    pub user_message: ChatMessage,
    /// The model reply, or `"Error: ..."` when the model call failed.
    pub assistant_message: ChatMessage,
    pub kind: QueryKind,
    pub usage: Option<Usage>,
    /// Store id of the recorded turn; `None` when the turn was not saved.
    pub record_id: Option<i64>,
    /// Whether the reply is being read aloud.
    pub speaking: bool,
    pub error: Option<String>,
}

/// Outcome of a playback toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message_id", rename_all = "snake_case")]
pub enum PlaybackState {
    Playing(u64),
    Stopped,
}

/// Central coordinator for chat sessions.
pub struct ChatOrchestrator {
    store: ConversationStore,
    gateway: Arc<AiGateway>,
    voice: Arc<VoiceBridge>,
    media: ImageProcessor,
    camera: Arc<CameraManager>,
    sessions: Mutex<HashMap<Uuid, SessionContext>>,
}

impl ChatOrchestrator {
    pub fn new(
        store: ConversationStore,
        gateway: Arc<AiGateway>,
        voice: Arc<VoiceBridge>,
        media: ImageProcessor,
        camera: Arc<CameraManager>,
    ) -> Self {
        Self {
            store,
            gateway,
            voice,
            media,
            camera,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn gateway(&self) -> &AiGateway {
        &self.gateway
    }

    pub fn voice(&self) -> &Arc<VoiceBridge> {
        &self.voice
    }

    pub fn media(&self) -> &ImageProcessor {
        &self.media
    }

    pub fn camera(&self) -> &Arc<CameraManager> {
        &self.camera
    }

    // -- Sessions --

    pub fn create_session(&self) -> Result<SessionSnapshot, ChatError> {
        let session = SessionContext::new();
        let snapshot = session.snapshot();
        self.lock_sessions()?.insert(session.id, session);
        info!(session = %snapshot.id, "Session created");
        Ok(snapshot)
    }

    /// Remove a session, stopping any playback it started.
    pub fn end_session(&self, session_id: Uuid) -> Result<(), ChatError> {
        let removed = self.lock_sessions()?.remove(&session_id);
        match removed {
            Some(mut session) => {
                session.stop_playback();
                info!(session = %session_id, "Session ended");
                Ok(())
            }
            None => Err(ChatError::SessionNotFound(session_id)),
        }
    }

    pub fn session_snapshot(&self, session_id: Uuid) -> Result<SessionSnapshot, ChatError> {
        self.with_session(session_id, |s| s.snapshot())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn set_auto_read(&self, session_id: Uuid, enabled: bool) -> Result<(), ChatError> {
        self.with_session(session_id, |s| s.auto_read = enabled)
    }

    /// Clear messages and the attached image.
    pub fn clear_chat(&self, session_id: Uuid) -> Result<(), ChatError> {
        self.with_session(session_id, |s| {
            s.stop_playback();
            s.clear_chat();
        })
    }

    // -- Turns --

    /// Send a user message to the model.
    ///
    /// With an image attached the message is a question about that image.
    /// Model failures are reported in the reply, not as errors.
    pub async fn process_user_input(
        &self,
        session_id: Uuid,
        text: &str,
    ) -> Result<ChatReply, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (user_message, image) = self.with_session(session_id, |s| {
            let message = s.add_message(ChatRole::User, text);
            (message, s.current_image().map(Path::to_path_buf))
        })?;

        let (kind, result) = match &image {
            Some(path) => (
                QueryKind::Image,
                self.gateway.analyze_image(path, Some(text)).await,
            ),
            None => (QueryKind::Text, self.gateway.text_response(text, None).await),
        };

        if !result.success {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            warn!(session = %session_id, error = %error, "Model call failed");
            let assistant_message = self.with_session(session_id, |s| {
                s.add_message(ChatRole::Assistant, format!("Error: {}", error))
            })?;
            return Ok(ChatReply {
                success: false,
                user_message,
                assistant_message,
                kind,
                usage: None,
                record_id: None,
                speaking: false,
                error: Some(error),
            });
        }

        let turn = match &image {
            Some(path) => NewConversation::image(text, &result.response, path.display().to_string()),
            None => NewConversation::text(text, &result.response),
        };
        self.record_reply(session_id, user_message, result, turn).await
    }

    /// Prepare an image and attach it to the session.
    pub async fn attach_image(&self, session_id: Uuid, path: &Path) -> Result<PathBuf, ChatError> {
        self.ensure_session(session_id)?;
        let prepared = self.prepare_image(path).await?;
        self.with_session(session_id, |s| s.set_image(prepared.clone()))?;
        info!(session = %session_id, path = %prepared.display(), "Image attached");
        Ok(prepared)
    }

    pub fn clear_image(&self, session_id: Uuid) -> Result<(), ChatError> {
        self.with_session(session_id, |s| s.clear_image())
    }

    /// Take a photo, attach it and ask the model to describe it.
    ///
    /// Unlike typed turns, nothing is added to the session when the model
    /// call fails; the failure is returned as `ModelRequest`.
    pub async fn capture_and_analyze(&self, session_id: Uuid) -> Result<ChatReply, ChatError> {
        self.ensure_session(session_id)?;

        let camera = self.camera.clone();
        let captured = tokio::task::spawn_blocking(move || camera.capture().capture_headless(None))
            .await
            .map_err(|e| ColloquyError::Camera(format!("Capture task failed: {}", e)))?
            .ok_or_else(|| ColloquyError::Camera("Failed to capture image from camera".to_string()))?;

        let prepared = self.prepare_image(&captured).await?;
        self.with_session(session_id, |s| s.set_image(prepared.clone()))?;

        let result = self.gateway.analyze_image(&prepared, Some(CAMERA_QUESTION)).await;
        if !result.success {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(ColloquyError::ModelRequest(error).into());
        }

        let user_message = self.with_session(session_id, |s| s.add_message(ChatRole::User, CAMERA_QUERY))?;
        let turn = NewConversation::image(
            CAMERA_QUERY,
            &result.response,
            prepared.display().to_string(),
        );
        self.record_reply(session_id, user_message, result, turn).await
    }

    /// Listen for one utterance and send it as a user message.
    ///
    /// `Ok(None)` when nothing intelligible was heard.
    pub async fn voice_input(
        &self,
        session_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<ChatReply>, ChatError> {
        self.ensure_session(session_id)?;
        let heard = self
            .voice
            .listen_once(Some(timeout), Some(VOICE_PHRASE_LIMIT))
            .await?;
        match heard {
            Some(text) => {
                info!(session = %session_id, "Voice input recognized");
                self.process_user_input(session_id, &text).await.map(Some)
            }
            None => Ok(None),
        }
    }

    // -- Playback --

    /// Toggle reading an assistant message aloud.
    ///
    /// Asking for the message already playing stops it; any other message
    /// replaces the current playback.
    pub async fn request_playback(
        &self,
        session_id: Uuid,
        message_id: u64,
    ) -> Result<PlaybackState, ChatError> {
        let message = self.with_session(session_id, |s| {
            if s.playing_message() == Some(message_id) {
                s.stop_playback();
                return Ok(None);
            }
            match s.message(message_id) {
                Some(m) if m.role == ChatRole::Assistant => Ok(Some(m.clone())),
                _ => Err(ChatError::MessageNotFound(message_id)),
            }
        })??;

        match message {
            Some(message) => {
                self.stop_playback(session_id)?;
                self.start_playback(session_id, &message).await?;
                Ok(PlaybackState::Playing(message_id))
            }
            None => Ok(PlaybackState::Stopped),
        }
    }

    /// Stop this session's playback. Returns whether anything was playing.
    pub fn stop_playback(&self, session_id: Uuid) -> Result<bool, ChatError> {
        self.with_session(session_id, |s| s.stop_playback())
    }

    // -- Private helpers --

    async fn record_reply(
        &self,
        session_id: Uuid,
        user_message: ChatMessage,
        result: GatewayResult,
        turn: NewConversation,
    ) -> Result<ChatReply, ChatError> {
        let (assistant_message, auto_read) = self.with_session(session_id, |s| {
            (s.add_message(ChatRole::Assistant, result.response.clone()), s.auto_read)
        })?;

        let record_id = match self.store.append(&turn) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(session = %session_id, error = %e, "Failed to record conversation");
                None
            }
        };

        let speaking = if auto_read {
            match self.start_playback(session_id, &assistant_message).await {
                Ok(started) => started,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Auto-read failed");
                    false
                }
            }
        } else {
            false
        };

        Ok(ChatReply {
            success: true,
            user_message,
            assistant_message,
            kind: turn.kind,
            usage: result.usage,
            record_id,
            speaking,
            error: None,
        })
    }

    async fn start_playback(&self, session_id: Uuid, message: &ChatMessage) -> Result<bool, ChatError> {
        match self.voice.speak(&message.content, false).await? {
            Some(task) => {
                self.with_session(session_id, |s| s.start_playback(message.id, task))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn prepare_image(&self, path: &Path) -> Result<PathBuf, ChatError> {
        let media = self.media.clone();
        let path = path.to_path_buf();
        let prepared = tokio::task::spawn_blocking(move || media.prepare_for_analysis(&path))
            .await
            .map_err(|e| ColloquyError::InvalidImage(format!("Image task failed: {}", e)))??;
        Ok(prepared)
    }

    fn lock_sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, SessionContext>>, ChatError> {
        self.sessions
            .lock()
            .map_err(|e| ColloquyError::Storage(format!("session lock poisoned: {}", e)).into())
    }

    fn with_session<T>(
        &self,
        session_id: Uuid,
        f: impl FnOnce(&mut SessionContext) -> T,
    ) -> Result<T, ChatError> {
        let mut sessions = self.lock_sessions()?;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(ChatError::SessionNotFound(session_id))?;
        Ok(f(session))
    }

    fn ensure_session(&self, session_id: Uuid) -> Result<(), ChatError> {
        self.with_session(session_id, |_| ())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use colloquy_core::config::{MediaConfig, VoiceConfig};
    use colloquy_gateway::{GenerationSettings, Part, StubBackend};
    use colloquy_media::{FrameSource, MockFrameSource};
    use colloquy_storage::Database;
    use colloquy_voice::{MockMicrophone, MockMicrophoneProvider, MockRecognizer, MockSynthesizer};

    struct Harness {
        orch: ChatOrchestrator,
        backend: Arc<StubBackend>,
        synth: Arc<MockSynthesizer>,
        dir: tempfile::TempDir,
    }

    fn harness_with(backend: StubBackend, camera_frames: usize, recognizer: MockRecognizer) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let store = ConversationStore::new(db);

        let backend = Arc::new(backend);
        let gateway = Arc::new(AiGateway::new(backend.clone(), GenerationSettings::default()));

        let synth = Arc::new(MockSynthesizer::with_duration(Duration::from_secs(5)));
        let mic = MockMicrophone::new("mock")
            .with_silence(1.0)
            .with_speech(1.0)
            .with_silence(2.0);
        let voice = VoiceBridge::builder(&VoiceConfig::default())
            .microphones(Arc::new(MockMicrophoneProvider::new(vec![mic])))
            .recognizer(Arc::new(recognizer))
            .synthesizer(synth.clone())
            .build()
            .unwrap();

        let media = ImageProcessor::new(&MediaConfig {
            temp_dir: dir.path().display().to_string(),
            ..MediaConfig::default()
        });
        let camera = CameraManager::new(
            move |_| Box::new(MockFrameSource::with_frames(camera_frames, 64, 48)) as Box<dyn FrameSource>,
            0,
            2,
            dir.path().to_path_buf(),
        );

        Harness {
            orch: ChatOrchestrator::new(store, gateway, Arc::new(voice), media, Arc::new(camera)),
            backend,
            synth,
            dir,
        }
    }

    fn harness(backend: StubBackend) -> Harness {
        harness_with(backend, 5, MockRecognizer::default())
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_pixel(32, 32, image::Rgb([10, 200, 30]))
            .save(&path)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_text_turn_is_recorded() {
        let h = harness(StubBackend::replying("pong"));
        let sid = h.orch.create_session().unwrap().id;

        let reply = h.orch.process_user_input(sid, "  ping ").await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.kind, QueryKind::Text);
        assert_eq!(reply.user_message.content, "ping");
        assert_eq!(reply.assistant_message.content, "pong");
        assert_eq!(reply.usage.unwrap().total_tokens, 2);
        assert!(!reply.speaking);

        let records = h.orch.store().list_recent(None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(Some(records[0].id), reply.record_id);
        assert_eq!(records[0].user_query, "ping");
        assert_eq!(records[0].ai_response, "pong");

        let snapshot = h.orch.session_snapshot(sid).unwrap();
        assert_eq!(snapshot.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let h = harness(StubBackend::replying("unused"));
        let sid = h.orch.create_session().unwrap().id;
        let err = h.orch.process_user_input(sid, "   ").await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
        assert_eq!(h.backend.calls(), 0);
        assert!(h.orch.session_snapshot(sid).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(StubBackend::replying("unused"));
        let missing = Uuid::new_v4();
        assert!(matches!(
            h.orch.process_user_input(missing, "hi").await,
            Err(ChatError::SessionNotFound(id)) if id == missing
        ));
        assert!(matches!(h.orch.end_session(missing), Err(ChatError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_model_failure_becomes_error_message() {
        let h = harness(StubBackend::failing("quota exceeded"));
        let sid = h.orch.create_session().unwrap().id;

        let reply = h.orch.process_user_input(sid, "hello").await.unwrap();
        assert!(!reply.success);
        assert!(reply.assistant_message.content.starts_with("Error: "));
        assert!(reply.assistant_message.content.contains("quota exceeded"));
        assert!(reply.record_id.is_none());
        assert_eq!(h.orch.store().stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_attached_image_routes_to_analysis() {
        let h = harness(StubBackend::replying("a green square"));
        let sid = h.orch.create_session().unwrap().id;
        let source = write_png(h.dir.path(), "square.png");

        let prepared = h.orch.attach_image(sid, &source).await.unwrap();
        let reply = h.orch.process_user_input(sid, "what is this?").await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.kind, QueryKind::Image);

        let record = &h.orch.store().list_recent(Some(1)).unwrap()[0];
        assert_eq!(record.kind, QueryKind::Image);
        assert_eq!(record.image_ref.as_deref(), Some(prepared.display().to_string().as_str()));

        h.orch.clear_image(sid).unwrap();
        let reply = h.orch.process_user_input(sid, "and now?").await.unwrap();
        assert_eq!(reply.kind, QueryKind::Text);
    }

    #[tokio::test]
    async fn test_attach_invalid_image() {
        let h = harness(StubBackend::replying("unused"));
        let sid = h.orch.create_session().unwrap().id;
        let notes = h.dir.path().join("notes.txt");
        std::fs::write(&notes, "not an image").unwrap();

        let err = h.orch.attach_image(sid, &notes).await.unwrap_err();
        assert!(matches!(err, ChatError::Core(ColloquyError::InvalidImage(_))));
        assert!(h.orch.session_snapshot(sid).unwrap().current_image.is_none());
    }

    #[tokio::test]
    async fn test_camera_capture_and_analyze() {
        let h = harness(StubBackend::replying("a dark red frame"));
        let sid = h.orch.create_session().unwrap().id;

        let reply = h.orch.capture_and_analyze(sid).await.unwrap();
        assert_eq!(reply.user_message.content, CAMERA_QUERY);
        assert_eq!(reply.kind, QueryKind::Image);

        let requests = h.backend.requests();
        assert_eq!(requests[0].parts[0], Part::Text(CAMERA_QUESTION.to_string()));

        let record = &h.orch.store().list_recent(Some(1)).unwrap()[0];
        assert_eq!(record.user_query, CAMERA_QUERY);
        assert!(h.orch.session_snapshot(sid).unwrap().current_image.is_some());
    }

    #[tokio::test]
    async fn test_camera_without_frames_fails() {
        let h = harness_with(StubBackend::replying("unused"), 0, MockRecognizer::default());
        let sid = h.orch.create_session().unwrap().id;
        let err = h.orch.capture_and_analyze(sid).await.unwrap_err();
        assert!(matches!(err, ChatError::Core(ColloquyError::Camera(_))));
        assert_eq!(h.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_voice_input_processes_recognized_text() {
        let h = harness_with(
            StubBackend::replying("It is noon."),
            5,
            MockRecognizer::hearing("what time is it"),
        );
        let sid = h.orch.create_session().unwrap().id;
        let reply = h
            .orch
            .voice_input(sid, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.user_message.content, "what time is it");
        assert_eq!(reply.assistant_message.content, "It is noon.");
    }

    #[tokio::test]
    async fn test_voice_input_nothing_heard() {
        let h = harness(StubBackend::replying("unused"));
        let sid = h.orch.create_session().unwrap().id;
        let reply = h.orch.voice_input(sid, Duration::from_secs(5)).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(h.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_auto_read_speaks_reply() {
        let h = harness(StubBackend::replying("spoken answer"));
        let sid = h.orch.create_session().unwrap().id;
        h.orch.set_auto_read(sid, true).unwrap();

        let reply = h.orch.process_user_input(sid, "read this").await.unwrap();
        assert!(reply.speaking);
        assert_eq!(
            h.orch.session_snapshot(sid).unwrap().playing_message,
            Some(reply.assistant_message.id)
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.synth.started(), vec!["spoken answer"]);
        assert!(h.orch.stop_playback(sid).unwrap());
    }

    #[tokio::test]
    async fn test_request_playback_toggles() {
        let h = harness(StubBackend::with_replies(vec![
            Ok("first answer".into()),
            Ok("second answer".into()),
        ]));
        let sid = h.orch.create_session().unwrap().id;
        let first = h.orch.process_user_input(sid, "one").await.unwrap();
        let second = h.orch.process_user_input(sid, "two").await.unwrap();
        let first_id = first.assistant_message.id;
        let second_id = second.assistant_message.id;

        assert_eq!(
            h.orch.request_playback(sid, first_id).await.unwrap(),
            PlaybackState::Playing(first_id)
        );
        assert_eq!(
            h.orch.request_playback(sid, second_id).await.unwrap(),
            PlaybackState::Playing(second_id)
        );
        assert_eq!(
            h.orch.request_playback(sid, second_id).await.unwrap(),
            PlaybackState::Stopped
        );
        assert!(h.orch.session_snapshot(sid).unwrap().playing_message.is_none());

        // User messages cannot be played.
        assert!(matches!(
            h.orch.request_playback(sid, first.user_message.id).await,
            Err(ChatError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_playback_taken_over_by_other_session() {
        let h = harness(StubBackend::with_replies(vec![
            Ok("answer for a".into()),
            Ok("answer for b".into()),
        ]));
        let a = h.orch.create_session().unwrap().id;
        let b = h.orch.create_session().unwrap().id;
        let a_msg = h.orch.process_user_input(a, "one").await.unwrap().assistant_message.id;
        let b_msg = h.orch.process_user_input(b, "two").await.unwrap().assistant_message.id;

        assert_eq!(
            h.orch.request_playback(a, a_msg).await.unwrap(),
            PlaybackState::Playing(a_msg)
        );
        assert_eq!(
            h.orch.request_playback(b, b_msg).await.unwrap(),
            PlaybackState::Playing(b_msg)
        );

        // The shared bridge stopped a's reading when b started.
        assert!(h.orch.session_snapshot(a).unwrap().playing_message.is_none());
        assert_eq!(h.orch.session_snapshot(b).unwrap().playing_message, Some(b_msg));

        // Asking a to read again starts playback instead of toggling it off.
        assert_eq!(
            h.orch.request_playback(a, a_msg).await.unwrap(),
            PlaybackState::Playing(a_msg)
        );
        assert!(h.orch.session_snapshot(b).unwrap().playing_message.is_none());
    }

    #[tokio::test]
    async fn test_end_session_stops_playback() {
        let h = harness(StubBackend::replying("long reply"));
        let sid = h.orch.create_session().unwrap().id;
        let reply = h.orch.process_user_input(sid, "talk").await.unwrap();
        h.orch
            .request_playback(sid, reply.assistant_message.id)
            .await
            .unwrap();
        let stops = h.synth.stop_count();

        h.orch.end_session(sid).unwrap();
        assert!(h.synth.stop_count() > stops);
        assert_eq!(h.orch.session_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_chat() {
        let h = harness(StubBackend::replying("ok"));
        let sid = h.orch.create_session().unwrap().id;
        let source = write_png(h.dir.path(), "pic.png");
        h.orch.attach_image(sid, &source).await.unwrap();
        h.orch.process_user_input(sid, "hi").await.unwrap();

        h.orch.clear_chat(sid).unwrap();
        let snapshot = h.orch.session_snapshot(sid).unwrap();
        assert!(snapshot.messages.is_empty());
        assert!(snapshot.current_image.is_none());
        // The stored history is untouched.
        assert_eq!(h.orch.store().stats().unwrap().total, 1);
    }
}

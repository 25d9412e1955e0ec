//! Route handler functions for all API endpoints.
//!
//! Handlers extract path, query and body parameters, call into the chat
//! orchestrator or the conversation store, and return JSON.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use colloquy_chat::{ChatReply, PlaybackState, SessionSnapshot};
use colloquy_core::types::{ConversationRecord, ConversationStats, MediaAsset};
use colloquy_gateway::{GenerationSettings, ModelInfo, SettingsUpdate};
use colloquy_storage::ExportFormat;
use colloquy_voice::VoiceInfo;

use crate::error::ApiError;
use crate::state::AppState;

/// Seconds to wait for speech when the request does not say.
const DEFAULT_VOICE_TIMEOUT_SECS: u64 = 10;
const MAX_VOICE_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct VoiceRequest {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionSettingsRequest {
    pub auto_read: bool,
}

/// Body of `PUT /voice/settings`. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceSettingsUpdate {
    pub microphone: Option<usize>,
    pub voice: Option<String>,
    pub rate: Option<u32>,
    pub volume: Option<f32>,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub total_records: u64,
    pub active_sessions: usize,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub records: Vec<ConversationRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageResponse {
    /// The prepared file the model will see.
    pub path: PathBuf,
    pub info: Option<MediaAsset>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceResponse {
    /// False when nothing intelligible was heard before the timeout.
    pub heard: bool,
    pub reply: Option<ChatReply>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceSettingsResponse {
    pub microphones: Vec<String>,
    /// `None` while the system default input is in use.
    pub selected_microphone: Option<usize>,
    pub voices: Vec<VoiceInfo>,
    pub voice: Option<String>,
    /// Words per minute.
    pub rate: u32,
    pub volume: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceTestResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CameraResponse {
    /// Whether the configured device delivers frames.
    pub available: bool,
    /// Indices of the devices that delivered a frame.
    pub devices: Vec<u32>,
}

// =============================================================================
// Health
// =============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let total_records = state.chat.store().stats().map(|s| s.total).unwrap_or(0);
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        total_records,
        active_sessions: state.chat.session_count(),
        model: state.chat.gateway().model().to_string(),
    }))
}

// =============================================================================
// Sessions
// =============================================================================

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    let snapshot = state.chat.create_session()?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.chat.session_snapshot(id)?))
}

/// DELETE /sessions/{id}
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.chat.end_session(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/{id}/messages
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<MessageRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    Ok(Json(state.chat.process_user_input(id, &body.text).await?))
}

/// DELETE /sessions/{id}/messages
pub async fn clear_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.chat.clear_chat(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /sessions/{id}/image
pub async fn attach_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ImageRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    let path = state.chat.attach_image(id, &body.path).await?;
    let info = state.chat.media().image_info(&path).ok();
    Ok(Json(ImageResponse { path, info }))
}

/// DELETE /sessions/{id}/image
pub async fn clear_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.chat.clear_image(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/{id}/camera
pub async fn capture_camera(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatReply>, ApiError> {
    Ok(Json(state.chat.capture_and_analyze(id).await?))
}

/// POST /sessions/{id}/voice
///
/// The body is optional; `{ "timeout_secs": n }` bounds the wait for speech.
pub async fn voice_input(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<VoiceResponse>, ApiError> {
    let request: VoiceRequest = if body.iter().all(u8::is_ascii_whitespace) {
        VoiceRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid voice request: {}", e)))?
    };
    let timeout = request
        .timeout_secs
        .unwrap_or(DEFAULT_VOICE_TIMEOUT_SECS)
        .clamp(1, MAX_VOICE_TIMEOUT_SECS);

    let reply = state
        .chat
        .voice_input(id, Duration::from_secs(timeout))
        .await?;
    Ok(Json(VoiceResponse {
        heard: reply.is_some(),
        reply,
    }))
}

/// PUT /sessions/{id}/settings
pub async fn update_session_settings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SessionSettingsRequest>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state.chat.set_auto_read(id, body.auto_read)?;
    Ok(Json(state.chat.session_snapshot(id)?))
}

/// POST /sessions/{id}/messages/{msg}/play
pub async fn play_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(Uuid, u64)>,
) -> Result<Json<PlaybackState>, ApiError> {
    Ok(Json(state.chat.request_playback(id, message_id).await?))
}

/// POST /sessions/{id}/playback/stop
pub async fn stop_playback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StopResponse>, ApiError> {
    let stopped = state.chat.stop_playback(id)?;
    Ok(Json(StopResponse { stopped }))
}

// =============================================================================
// History
// =============================================================================

/// GET /history?limit=
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let records = state.chat.store().list_recent(params.limit)?;
    Ok(Json(HistoryResponse {
        count: records.len(),
        records,
    }))
}

/// GET /history/search?q=
pub async fn search_history(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let term = params
        .q
        .ok_or_else(|| ApiError::BadRequest("Query parameter 'q' is required".to_string()))?;
    let records = state.chat.store().search(&term)?;
    Ok(Json(HistoryResponse {
        count: records.len(),
        records,
    }))
}

/// GET /history/stats
pub async fn history_stats(
    State(state): State<AppState>,
) -> Result<Json<ConversationStats>, ApiError> {
    Ok(Json(state.chat.store().stats()?))
}

/// GET /history/export?format=json|csv
pub async fn export_history(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let format: ExportFormat = match params.format.as_deref() {
        Some(f) => f
            .parse()
            .map_err(|e: colloquy_core::error::ColloquyError| ApiError::BadRequest(e.to_string()))?,
        None => ExportFormat::default(),
    };

    let mut body = Vec::new();
    let count = state.chat.store().export(format, &mut body)?;
    let extension = match format {
        ExportFormat::Json => "json",
        ExportFormat::Csv => "csv",
    };
    let filename = format!(
        "chatbot_history_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        extension
    );
    info!(count, format = extension, "History exported");

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    ))
}

/// DELETE /history/{id}
pub async fn delete_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.chat.store().delete_one(id)?;
    Ok(Json(DeleteResponse { deleted }))
}

/// DELETE /history
pub async fn clear_history(
    State(state): State<AppState>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.chat.store().clear_all()?;
    info!(deleted, "History cleared");
    Ok(Json(DeleteResponse { deleted }))
}

// =============================================================================
// Voice and camera devices
// =============================================================================

fn voice_settings(state: &AppState) -> Result<VoiceSettingsResponse, ApiError> {
    let voice = state.chat.voice();
    let props = voice.speech_properties();
    Ok(VoiceSettingsResponse {
        microphones: voice.list_microphones()?,
        selected_microphone: voice.selected_microphone(),
        voices: voice.list_voices()?,
        voice: props.voice,
        rate: props.rate,
        volume: props.volume,
    })
}

/// GET /voice/settings
pub async fn get_voice_settings(
    State(state): State<AppState>,
) -> Result<Json<VoiceSettingsResponse>, ApiError> {
    Ok(Json(voice_settings(&state)?))
}

/// PUT /voice/settings
///
/// Rate and volume are clamped and mirrored into the in-memory
/// configuration. An unknown microphone index or voice is rejected.
pub async fn update_voice_settings(
    State(state): State<AppState>,
    Json(update): Json<VoiceSettingsUpdate>,
) -> Result<Json<VoiceSettingsResponse>, ApiError> {
    let voice = state.chat.voice();
    if let Some(index) = update.microphone {
        voice
            .set_microphone(index)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    if let Some(id) = &update.voice {
        voice
            .set_voice(id)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    let rate = update.rate.map(|rate| voice.set_rate(rate));
    let volume = update.volume.map(|volume| voice.set_volume(volume));
    {
        let mut config = state
            .config
            .lock()
            .map_err(|e| ApiError::Internal(format!("Config lock poisoned: {}", e)))?;
        if let Some(rate) = rate {
            config.voice.speech_rate = rate;
        }
        if let Some(volume) = volume {
            config.voice.speech_volume = volume;
        }
    }
    info!(?update, "Voice settings updated");
    Ok(Json(voice_settings(&state)?))
}

/// POST /voice/test/microphone
///
/// Listens for a few seconds. `ok` is true when speech was recognized.
pub async fn test_microphone(State(state): State<AppState>) -> Json<DeviceTestResponse> {
    let ok = state.chat.voice().test_microphone().await;
    Json(DeviceTestResponse { ok })
}

/// POST /voice/test/speakers
///
/// Speaks a fixed sentence and returns once it has played.
pub async fn test_speakers(State(state): State<AppState>) -> Json<DeviceTestResponse> {
    let ok = state.chat.voice().test_speakers().await;
    Json(DeviceTestResponse { ok })
}

/// GET /camera
pub async fn camera_status(State(state): State<AppState>) -> Result<Json<CameraResponse>, ApiError> {
    let camera = state.chat.camera().clone();
    let (available, devices) =
        tokio::task::spawn_blocking(move || (camera.is_available(), camera.list_cameras()))
            .await
            .map_err(|e| ApiError::Internal(format!("Camera check failed: {}", e)))?;
    Ok(Json(CameraResponse { available, devices }))
}

// =============================================================================
// Model settings
// =============================================================================

/// GET /settings/generation
pub async fn get_generation_settings(
    State(state): State<AppState>,
) -> Json<GenerationSettings> {
    Json(state.chat.gateway().settings())
}

/// PUT /settings/generation
///
/// Values are clamped to their valid ranges and mirrored into the
/// in-memory configuration.
pub async fn update_generation_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<GenerationSettings>, ApiError> {
    let settings = state.chat.gateway().update_settings(&update);
    let mut config = state
        .config
        .lock()
        .map_err(|e| ApiError::Internal(format!("Config lock poisoned: {}", e)))?;
    config.model.temperature = settings.temperature;
    config.model.max_output_tokens = settings.max_output_tokens;
    config.model.top_p = settings.top_p;
    config.model.top_k = settings.top_k;
    Ok(Json(settings))
}

/// GET /model
pub async fn model_info(State(state): State<AppState>) -> Json<ModelInfo> {
    Json(state.chat.gateway().model_info().await)
}

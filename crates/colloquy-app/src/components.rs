//! Construction of the runtime components from configuration.
//!
//! `serve` and `check` build the same pieces. `serve` wires them into one
//! `ChatOrchestrator` and `check` only reports whether each one came up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use colloquy_chat::ChatOrchestrator;
use colloquy_core::config::ColloquyConfig;
use colloquy_core::error::Result;
use colloquy_gateway::{AiGateway, GeminiBackend, GenerationSettings};
use colloquy_media::{resolve_temp_dir, CameraManager, ImageProcessor};
use colloquy_storage::{ConversationStore, Database};
use colloquy_voice::VoiceBridge;

/// Resolve a data directory string, expanding a leading `~/`.
pub fn resolve_data_dir(dir: &str) -> PathBuf {
    let rest = dir.strip_prefix("~/").or_else(|| dir.strip_prefix("~\\"));
    match (rest, home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(dir),
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let home = std::env::var("USERPROFILE");
    #[cfg(not(target_os = "windows"))]
    let home = std::env::var("HOME");
    home.ok().map(PathBuf::from)
}

pub fn database_path(config: &ColloquyConfig, data_dir: &Path) -> PathBuf {
    data_dir.join(&config.storage.db_file)
}

/// Open the conversation database, creating it and its schema if needed.
pub fn open_store(config: &ColloquyConfig, data_dir: &Path) -> Result<ConversationStore> {
    let db_path = database_path(config, data_dir);
    let db = Database::new(&db_path)?;
    let store = ConversationStore::new(Arc::new(db));
    store.initialize()?;
    tracing::info!(path = %db_path.display(), "Conversation store ready");
    Ok(store)
}

/// Gemini-backed gateway. Fails when the API key is not in the environment.
pub fn build_gateway(config: &ColloquyConfig) -> Result<AiGateway> {
    let backend = GeminiBackend::from_config(&config.model)?;
    let gateway = AiGateway::new(Arc::new(backend), GenerationSettings::from(&config.model));
    tracing::info!(model = %gateway.model(), "Model gateway ready");
    Ok(gateway)
}

/// Image processor with its working directory created.
pub fn build_media(config: &ColloquyConfig) -> Result<ImageProcessor> {
    let media = ImageProcessor::new(&config.media);
    std::fs::create_dir_all(media.temp_dir())?;
    Ok(media)
}

pub fn build_voice(config: &ColloquyConfig) -> Result<VoiceBridge> {
    let voice = VoiceBridge::from_config(&config.voice)?;
    tracing::info!("Voice bridge ready");
    Ok(voice)
}

/// Wire every component into the chat orchestrator.
pub fn build_orchestrator(config: &ColloquyConfig, data_dir: &Path) -> Result<ChatOrchestrator> {
    let store = open_store(config, data_dir)?;
    let gateway = build_gateway(config)?;
    let media = build_media(config)?;
    let voice = build_voice(config)?;
    let camera = CameraManager::ffmpeg(&config.camera, resolve_temp_dir(&config.media));

    Ok(ChatOrchestrator::new(
        store,
        Arc::new(gateway),
        Arc::new(voice),
        media,
        Arc::new(camera),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_plain() {
        assert_eq!(resolve_data_dir("/var/lib/colloquy"), PathBuf::from("/var/lib/colloquy"));
        assert_eq!(resolve_data_dir("data"), PathBuf::from("data"));
    }

    #[test]
    fn test_resolve_data_dir_expands_home() {
        let resolved = resolve_data_dir("~/.colloquy/data");
        match home_dir() {
            Some(home) => assert_eq!(resolved, home.join(".colloquy/data")),
            None => assert_eq!(resolved, PathBuf::from("~/.colloquy/data")),
        }
    }

    #[test]
    fn test_open_store_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");
        let config = ColloquyConfig::default();

        let store = open_store(&config, &data_dir).unwrap();
        assert_eq!(store.stats().unwrap().total, 0);
        assert!(data_dir.join("chatbot_history.db").exists());
    }

    #[test]
    fn test_build_gateway_requires_key() {
        let mut config = ColloquyConfig::default();
        config.model.api_key_env = "COLLOQUY_TEST_KEY_NEVER_SET".to_string();
        assert!(build_gateway(&config).is_err());
    }

    #[test]
    fn test_build_media_creates_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ColloquyConfig::default();
        config.media.temp_dir = dir.path().join("media").to_string_lossy().to_string();

        let media = build_media(&config).unwrap();
        assert!(media.temp_dir().is_dir());
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ColloquyError, Result};

/// Top-level configuration for Colloquy.
///
/// Loaded from `~/.colloquy/config.toml` by default. Each section maps to one
/// component crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColloquyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ColloquyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ColloquyConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ColloquyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the database and captured media.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Port for the HTTP server (bound to 127.0.0.1).
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.colloquy/data".to_string(),
            log_level: "info".to_string(),
            port: 8501,
        }
    }
}

/// Hosted model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key_env: "GEMINI_API_KEY".to_string(),
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            temperature: 0.7,
            max_output_tokens: 1500,
            top_p: 0.8,
            top_k: 40,
            request_timeout_secs: 60,
        }
    }
}

/// Image preparation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub thumbnail_size: u32,
    /// Directory for derived images and captures. Empty means the OS temp dir.
    pub temp_dir: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 1024,
            thumbnail_size: 150,
            temp_dir: String::new(),
        }
    }
}

/// Camera capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    /// Frames discarded before the kept frame in headless capture.
    pub warmup_frames: u32,
    /// Program used to read frames from the device.
    pub ffmpeg_program: String,
    /// DirectShow device name on Windows. Empty picks the device at
    /// `device_index` from ffmpeg's device listing.
    pub device_name: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            warmup_frames: 5,
            ffmpeg_program: "ffmpeg".to_string(),
            device_name: String::new(),
        }
    }
}

/// Speech recognition and synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// RMS energy above which audio counts as speech.
    pub energy_threshold: f32,
    pub dynamic_energy: bool,
    /// Seconds of silence that end a phrase.
    pub pause_threshold_secs: f32,
    /// Minimum seconds of speech for a phrase.
    pub phrase_threshold_secs: f32,
    pub recognition_url: String,
    pub recognition_key: String,
    pub language: String,
    /// Words per minute.
    pub speech_rate: u32,
    pub speech_volume: f32,
    /// TTS program override. Empty picks the platform default.
    pub tts_program: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 4000.0,
            dynamic_energy: true,
            pause_threshold_secs: 0.8,
            phrase_threshold_secs: 0.3,
            recognition_url: "http://www.google.com/speech-api/v2/recognize".to_string(),
            recognition_key: String::new(),
            language: "en-US".to_string(),
            speech_rate: 200,
            speech_volume: 0.9,
            tts_program: String::new(),
        }
    }
}

/// Conversation store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name inside the data directory.
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: "chatbot_history.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ColloquyConfig::default();
        assert_eq!(config.general.data_dir, "~/.colloquy/data");
        assert_eq!(config.general.port, 8501);
        assert_eq!(config.model.model, "gemini-2.5-flash");
        assert_eq!(config.model.temperature, 0.7);
        assert_eq!(config.model.max_output_tokens, 1500);
        assert_eq!(config.model.top_k, 40);
        assert_eq!(config.media.max_width, 1024);
        assert_eq!(config.camera.warmup_frames, 5);
        assert_eq!(config.voice.energy_threshold, 4000.0);
        assert_eq!(config.voice.speech_rate, 200);
        assert_eq!(config.storage.db_file, "chatbot_history.db");
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "debug"

[model]
model = "gemini-2.5-pro"
temperature = 0.2
"#;
        let file = create_temp_config(content);
        let config = ColloquyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.model.model, "gemini-2.5-pro");
        assert_eq!(config.model.temperature, 0.2);
        assert_eq!(config.model.top_p, 0.8);
        assert_eq!(config.camera.width, 1280);
    }

    #[test]
    fn test_load_invalid_toml_is_config_error() {
        let file = create_temp_config("[general\nport = ");
        let err = ColloquyConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ColloquyError::Config(_)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = ColloquyConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.colloquy/data");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ColloquyConfig::default();
        config.voice.language = "en-GB".to_string();
        config.save(&path).unwrap();

        let reloaded = ColloquyConfig::load(&path).unwrap();
        assert_eq!(reloaded.voice.language, "en-GB");
        assert_eq!(reloaded.media.thumbnail_size, 150);
    }
}

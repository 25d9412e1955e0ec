use thiserror::Error;

/// Top-level error type for Colloquy.
///
/// Every component boundary returns this type. Recognition timeouts and
/// unintelligible audio are not errors: the voice bridge reports them as
/// `Ok(None)`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ColloquyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Recognition service error: {0}")]
    RecognitionService(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ColloquyError {
    /// Short machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ColloquyError::Config(_) => "config",
            ColloquyError::StorageUnavailable(_) => "storage_unavailable",
            ColloquyError::StorageWrite(_) => "storage_write",
            ColloquyError::Storage(_) => "storage",
            ColloquyError::InvalidImage(_) => "invalid_image",
            ColloquyError::Camera(_) => "camera",
            ColloquyError::ModelRequest(_) => "model_request",
            ColloquyError::RecognitionService(_) => "recognition_service",
            ColloquyError::Audio(_) => "audio",
            ColloquyError::Synthesis(_) => "synthesis",
            ColloquyError::Io(_) => "io",
            ColloquyError::Serialization(_) => "serialization",
        }
    }
}

impl From<toml::de::Error> for ColloquyError {
    fn from(err: toml::de::Error) -> Self {
        ColloquyError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ColloquyError {
    fn from(err: toml::ser::Error) -> Self {
        ColloquyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ColloquyError {
    fn from(err: serde_json::Error) -> Self {
        ColloquyError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Colloquy operations.
pub type Result<T> = std::result::Result<T, ColloquyError>;

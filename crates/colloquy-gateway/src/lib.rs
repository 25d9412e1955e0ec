//! Colloquy Gateway crate - hosted model access.
//!
//! `AiGateway` turns text, image and conversation prompts into calls on a
//! `ModelBackend` and folds every outcome into a `GatewayResult`, so callers
//! never see an error escape. `GeminiBackend` talks to the Gemini
//! `generateContent` REST endpoint; `StubBackend` answers locally for tests.

pub mod backend;
pub mod gateway;
pub mod gemini;
pub mod settings;

pub use backend::{GenerateRequest, ModelBackend, Part, StubBackend};
pub use gateway::{
    count_words, AiGateway, ConversationTurn, GatewayResult, ModelInfo, Usage,
    DEFAULT_IMAGE_QUESTION,
};
pub use gemini::GeminiBackend;
pub use settings::{GenerationSettings, SettingsUpdate};

//! Application state shared across all route handlers.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use colloquy_chat::ChatOrchestrator;
use colloquy_core::config::ColloquyConfig;

/// Shared application state, passed to handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Mutex<ColloquyConfig>>,
    pub chat: Arc<ChatOrchestrator>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: ColloquyConfig, chat: ChatOrchestrator) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            chat: Arc::new(chat),
            start_time: Instant::now(),
        }
    }
}

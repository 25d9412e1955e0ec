//! Colloquy API crate - axum HTTP server and route handlers.
//!
//! Exposes chat sessions, image and camera input, voice input and playback,
//! the conversation history, and model settings as a JSON API on localhost.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;

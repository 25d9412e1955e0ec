//! Colloquy Storage crate - SQLite conversation log.
//!
//! Provides a WAL-mode SQLite database with versioned migrations and the
//! `ConversationStore` repository used by the chat and HTTP layers.

pub mod db;
pub mod export;
pub mod migrations;
pub mod store;

pub use db::Database;
pub use export::ExportFormat;
pub use store::ConversationStore;

//! Chat sessions for Colloquy.
//!
//! Each session owns its message list, attached image and playback state.
//! `ChatOrchestrator` routes user turns to the model gateway, records them in
//! the conversation store and reads replies aloud through the voice bridge.

pub mod error;
pub mod orchestrator;
pub mod session;

pub use error::ChatError;
pub use orchestrator::{ChatOrchestrator, ChatReply, PlaybackState};
pub use session::{SessionContext, SessionSnapshot};

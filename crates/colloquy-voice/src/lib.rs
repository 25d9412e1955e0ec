//! Colloquy Voice crate - speech-to-text capture and text-to-speech playback.
//!
//! Microphone input is endpointed by signal energy and sent to a remote
//! recognition service. Playback drives the platform TTS program. Every
//! device and service sits behind a trait with a mock implementation, so
//! `VoiceBridge` can be exercised without audio hardware.

pub mod bridge;
pub mod commands;
pub mod endpoint;
pub mod microphone;
pub mod recognizer;
pub mod synth;

pub use bridge::{SpeechTask, VoiceBridge, VoiceBridgeBuilder};
pub use commands::{parse_voice_command, VoiceAction, VoiceCommand};
pub use endpoint::{AudioClip, Capture, EndpointConfig, Endpointer};
pub use microphone::{
    Microphone, MicrophoneProvider, MockMicrophone, MockMicrophoneProvider, SystemMicrophones,
};
pub use recognizer::{MockRecognizer, RemoteRecognizer, SpeechRecognizer};
pub use synth::{
    CommandSynthesizer, MockSynthesizer, SpeechProperties, SpeechSynthesizer, TtsEngine, VoiceInfo,
};

//! Spoken command recognition.

use serde::{Deserialize, Serialize};

/// What a recognized utterance asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceAction {
    SearchHistory,
    ClearHistory,
    ExportHistory,
    CaptureImage,
    ChangeMode,
    Help,
    Stop,
    /// No trigger matched; the text is a chat message.
    Chat,
}

impl VoiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceAction::SearchHistory => "search_history",
            VoiceAction::ClearHistory => "clear_history",
            VoiceAction::ExportHistory => "export_history",
            VoiceAction::CaptureImage => "capture_image",
            VoiceAction::ChangeMode => "change_mode",
            VoiceAction::Help => "help",
            VoiceAction::Stop => "stop",
            VoiceAction::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceCommand {
    pub action: VoiceAction,
    /// Text after the trigger phrase, or the whole utterance for `Chat`.
    pub parameter: String,
    pub original_text: String,
}

/// Trigger phrases, checked in order. The first match wins.
const TRIGGERS: &[(VoiceAction, &[&str])] = &[
    (
        VoiceAction::SearchHistory,
        &["search history", "find conversation", "look for"],
    ),
    (
        VoiceAction::ClearHistory,
        &["clear history", "delete all", "remove all"],
    ),
    (
        VoiceAction::ExportHistory,
        &["export history", "save conversation", "download history"],
    ),
    (
        VoiceAction::CaptureImage,
        &["take photo", "capture image", "camera"],
    ),
    (
        VoiceAction::ChangeMode,
        &["dark mode", "light mode", "switch theme"],
    ),
    (VoiceAction::Help, &["help", "what can you do", "commands"]),
    (VoiceAction::Stop, &["stop", "quit", "exit", "close"]),
];

/// Match an utterance against the trigger table, case-insensitively.
pub fn parse_voice_command(text: &str) -> VoiceCommand {
    let lowered = text.to_lowercase();
    for (action, phrases) in TRIGGERS {
        for phrase in phrases.iter() {
            if let Some(start) = lowered.find(phrase) {
                let end = start + phrase.len();
                // Lowercasing can shift byte offsets for non-ASCII text.
                let parameter = if lowered.len() == text.len() && text.is_char_boundary(end) {
                    text[end..].trim().to_string()
                } else {
                    lowered[end..].trim().to_string()
                };
                return VoiceCommand {
                    action: *action,
                    parameter,
                    original_text: text.to_string(),
                };
            }
        }
    }
    VoiceCommand {
        action: VoiceAction::Chat,
        parameter: text.to_string(),
        original_text: text.to_string(),
    }
}

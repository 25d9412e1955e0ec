use serde::{Deserialize, Serialize};

use colloquy_core::config::ModelConfig;

pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 1.0);
pub const MAX_OUTPUT_TOKENS_RANGE: (u32, u32) = (1, 2048);
pub const TOP_P_RANGE: (f32, f32) = (0.0, 1.0);
pub const TOP_K_RANGE: (u32, u32) = (1, 40);

/// Sampling parameters sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 1500,
            top_p: 0.8,
            top_k: 40,
        }
    }
}

impl From<&ModelConfig> for GenerationSettings {
    fn from(config: &ModelConfig) -> Self {
        // Config values go through the same clamps as runtime updates.
        let mut settings = Self::default();
        settings.apply(&SettingsUpdate {
            temperature: Some(config.temperature),
            max_output_tokens: Some(config.max_output_tokens),
            top_p: Some(config.top_p),
            top_k: Some(config.top_k),
        });
        settings
    }
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
}

impl GenerationSettings {
    /// Apply a partial update, clamping each field into its legal range.
    pub fn apply(&mut self, update: &SettingsUpdate) {
        if let Some(t) = update.temperature {
            self.temperature = clamp_f32(t, TEMPERATURE_RANGE);
        }
        if let Some(m) = update.max_output_tokens {
            self.max_output_tokens = m.clamp(MAX_OUTPUT_TOKENS_RANGE.0, MAX_OUTPUT_TOKENS_RANGE.1);
        }
        if let Some(p) = update.top_p {
            self.top_p = clamp_f32(p, TOP_P_RANGE);
        }
        if let Some(k) = update.top_k {
            self.top_k = k.clamp(TOP_K_RANGE.0, TOP_K_RANGE.1);
        }
    }
}

/// NaN maps to the lower bound.
fn clamp_f32(value: f32, (lo, hi): (f32, f32)) -> f32 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

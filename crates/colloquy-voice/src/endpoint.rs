//! Energy-based speech endpointing.
//!
//! Chunks whose RMS energy (on the i16 scale) exceeds the threshold count as
//! speech. A phrase starts at the first speech chunk and ends after
//! `pause_threshold` of silence or when the phrase limit is reached. Time is
//! measured in samples consumed, not wall-clock time.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use colloquy_core::config::VoiceConfig;
use colloquy_core::error::Result;

use crate::microphone::Microphone;

/// Per-second damping applied when adapting the threshold to ambient noise.
const DYNAMIC_DAMPING: f32 = 0.15;
/// Ambient energy is multiplied by this to get the adapted threshold.
const DYNAMIC_RATIO: f32 = 1.5;
/// Audio kept from before the onset so the first syllable is not clipped.
const PRE_ROLL_SECS: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub energy_threshold: f32,
    pub dynamic_energy: bool,
    pub pause_threshold_secs: f32,
    pub phrase_threshold_secs: f32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 4000.0,
            dynamic_energy: true,
            pause_threshold_secs: 0.8,
            phrase_threshold_secs: 0.3,
        }
    }
}

impl From<&VoiceConfig> for EndpointConfig {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            energy_threshold: config.energy_threshold,
            dynamic_energy: config.dynamic_energy,
            pause_threshold_secs: config.pause_threshold_secs,
            phrase_threshold_secs: config.phrase_threshold_secs,
        }
    }
}

/// Captured mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Signed 16-bit big-endian PCM (`audio/l16`).
    pub fn to_l16(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }
}

/// Result of one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    Phrase(AudioClip),
    /// No speech started before the timeout.
    TimedOut,
}

/// RMS energy of f32 samples, scaled to the i16 range.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| (s * 32768.0).powi(2)).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Stateful endpointer; the threshold adapts across calls.
#[derive(Debug, Clone)]
pub struct Endpointer {
    config: EndpointConfig,
    threshold: f32,
}

impl Endpointer {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            threshold: config.energy_threshold,
            config,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn adapt(&mut self, energy: f32, chunk_secs: f32) {
        let damping = DYNAMIC_DAMPING.powf(chunk_secs);
        self.threshold = self.threshold * damping + energy * DYNAMIC_RATIO * (1.0 - damping);
    }

    /// Listen for `duration` and move the threshold toward the ambient level.
    pub fn calibrate(&mut self, mic: &mut dyn Microphone, duration: Duration) -> Result<()> {
        let rate = mic.sample_rate();
        let target = samples_for(duration, rate);
        let mut consumed = 0u64;
        while consumed < target {
            let chunk = mic.read_chunk()?;
            if chunk.is_empty() {
                break;
            }
            consumed += chunk.len() as u64;
            self.adapt(rms_energy(&chunk), chunk.len() as f32 / rate as f32);
        }
        debug!(threshold = self.threshold, "Calibrated for ambient noise");
        Ok(())
    }

    /// Wait for speech and record one phrase.
    ///
    /// `timeout` bounds the wait for speech to start; `phrase_limit` bounds
    /// the phrase length. Bursts shorter than the phrase threshold are
    /// discarded as noise and waiting resumes.
    pub fn capture(
        &mut self,
        mic: &mut dyn Microphone,
        timeout: Option<Duration>,
        phrase_limit: Option<Duration>,
    ) -> Result<Capture> {
        let rate = mic.sample_rate();
        let timeout = timeout.map(|t| samples_for(t, rate));
        let phrase_limit = phrase_limit.map(|t| samples_for(t, rate));
        let pause_limit = secs_to_samples(self.config.pause_threshold_secs, rate);
        let min_speech = secs_to_samples(self.config.phrase_threshold_secs, rate);
        let pre_roll_limit = secs_to_samples(PRE_ROLL_SECS, rate);

        let mut waited = 0u64;
        loop {
            // Wait for onset.
            let mut pre_roll: VecDeque<Vec<f32>> = VecDeque::new();
            let mut pre_roll_len = 0u64;
            let onset_len = loop {
                if timeout.is_some_and(|t| waited >= t) {
                    return Ok(Capture::TimedOut);
                }
                let chunk = mic.read_chunk()?;
                let len = chunk.len() as u64;
                waited += len;
                let energy = rms_energy(&chunk);
                pre_roll_len += len;
                pre_roll.push_back(chunk);
                if energy > self.threshold {
                    break len;
                }
                while pre_roll_len > pre_roll_limit + len {
                    if let Some(old) = pre_roll.pop_front() {
                        pre_roll_len -= old.len() as u64;
                    }
                }
                if self.config.dynamic_energy {
                    self.adapt(energy, len as f32 / rate as f32);
                }
            };

            // Record until a long enough pause.
            let mut frames: Vec<f32> = pre_roll.into_iter().flatten().collect();
            let mut phrase_len = onset_len;
            let mut speech_len = onset_len;
            let mut pause_len = 0u64;
            loop {
                if phrase_limit.is_some_and(|limit| phrase_len >= limit) {
                    break;
                }
                let chunk = mic.read_chunk()?;
                let len = chunk.len() as u64;
                phrase_len += len;
                if rms_energy(&chunk) > self.threshold {
                    pause_len = 0;
                    speech_len += len;
                } else {
                    pause_len += len;
                }
                frames.extend(chunk);
                if pause_len > pause_limit {
                    break;
                }
            }

            if speech_len >= min_speech {
                debug!(
                    secs = frames.len() as f32 / rate as f32,
                    "Captured phrase"
                );
                return Ok(Capture::Phrase(AudioClip {
                    samples: frames,
                    sample_rate: rate,
                }));
            }
            trace!(speech_len, "Discarding short burst");
        }
    }
}

fn samples_for(duration: Duration, rate: u32) -> u64 {
    (duration.as_secs_f64() * rate as f64).round() as u64
}

fn secs_to_samples(secs: f32, rate: u32) -> u64 {
    (secs.max(0.0) as f64 * rate as f64).round() as u64
}

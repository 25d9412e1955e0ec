//! VoiceBridge - one handle over microphone, recognizer and synthesizer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use colloquy_core::config::VoiceConfig;
use colloquy_core::error::{ColloquyError, Result};

use crate::endpoint::{Capture, EndpointConfig, Endpointer};
use crate::microphone::{Microphone, MicrophoneProvider, SystemMicrophones};
use crate::recognizer::{RemoteRecognizer, SpeechRecognizer};
use crate::synth::{
    clamp_rate, clamp_volume, preferred_voice, CommandSynthesizer, SpeechProperties,
    SpeechSynthesizer, TtsEngine, VoiceInfo,
};

const LISTEN_CALIBRATION: Duration = Duration::from_secs(1);
const CONTINUOUS_CALIBRATION: Duration = Duration::from_millis(500);
const CONTINUOUS_TIMEOUT: Duration = Duration::from_secs(1);
const CONTINUOUS_PHRASE_LIMIT: Duration = Duration::from_secs(5);

const SPEAKER_TEST_TEXT: &str = "This is a test of the text-to-speech system.";

// =============================================================================
// SpeechTask
// =============================================================================

struct TaskInner {
    text: String,
    cancelled: AtomicBool,
    finished: AtomicBool,
    synth: Arc<dyn SpeechSynthesizer>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Handle to speech playing on the blocking pool.
///
/// Clones share the same playback. `stop` is a no-op once playback has
/// finished, so a stale handle never interrupts newer speech.
#[derive(Clone)]
pub struct SpeechTask {
    inner: Arc<TaskInner>,
}

impl SpeechTask {
    /// Start speaking `text` in the background. Must be called within a
    /// tokio runtime.
    pub fn spawn(synth: Arc<dyn SpeechSynthesizer>, text: impl Into<String>) -> Self {
        let inner = Arc::new(TaskInner {
            text: text.into(),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            synth,
            handle: Mutex::new(None),
        });

        let worker = inner.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = if worker.cancelled.load(Ordering::SeqCst) {
                Ok(())
            } else {
                worker.synth.speak(&worker.text)
            };
            worker.finished.store(true, Ordering::SeqCst);
            if let Err(e) = &result {
                warn!(error = %e, "Background speech failed");
            }
            result
        });
        if let Ok(mut slot) = inner.handle.lock() {
            *slot = Some(handle);
        }
        Self { inner }
    }

    pub fn text(&self) -> &str {
        &self.inner.text
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Interrupt playback if it is still running.
    pub fn stop(&self) {
        if self.is_finished() {
            return;
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.synth.stop();
        debug!("Speech task stopped");
    }

    /// Wait for playback to end. Later calls on any clone return `Ok(())`.
    pub async fn join(&self) -> Result<()> {
        let handle = self
            .inner
            .handle
            .lock()
            .map_err(|_| ColloquyError::Synthesis("Speech task state poisoned".to_string()))?
            .take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| ColloquyError::Synthesis(format!("Speech task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SpeechTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechTask")
            .field("text", &self.inner.text)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

// =============================================================================
// VoiceBridge
// =============================================================================

/// Input side: the opened device and the endpointer whose threshold carries
/// over between listens.
struct InputState {
    device: Option<Box<dyn Microphone>>,
    device_index: Option<usize>,
    endpointer: Endpointer,
}

pub struct VoiceBridge {
    provider: Arc<dyn MicrophoneProvider>,
    input: Arc<Mutex<InputState>>,
    recognizer: Arc<dyn SpeechRecognizer>,
    synth: Arc<dyn SpeechSynthesizer>,
    current: Mutex<Option<SpeechTask>>,
}

impl fmt::Debug for VoiceBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceBridge")
            .field("speaking", &self.is_speaking())
            .finish_non_exhaustive()
    }
}

/// Builder for `VoiceBridge`. Unset parts fall back to the system
/// microphones, the remote recognizer and the platform TTS program.
pub struct VoiceBridgeBuilder {
    config: VoiceConfig,
    provider: Option<Arc<dyn MicrophoneProvider>>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    synth: Option<Arc<dyn SpeechSynthesizer>>,
}

impl VoiceBridgeBuilder {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            config: config.clone(),
            provider: None,
            recognizer: None,
            synth: None,
        }
    }

    pub fn microphones(mut self, provider: Arc<dyn MicrophoneProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn synthesizer(mut self, synth: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synth = Some(synth);
        self
    }

    pub fn build(self) -> Result<VoiceBridge> {
        let provider = match self.provider {
            Some(p) => p,
            None => Arc::new(SystemMicrophones),
        };
        let recognizer = match self.recognizer {
            Some(r) => r,
            None => Arc::new(RemoteRecognizer::from_config(&self.config)?),
        };
        let synth: Arc<dyn SpeechSynthesizer> = match self.synth {
            Some(s) => s,
            None => Arc::new(CommandSynthesizer::new(
                TtsEngine::from_program(&self.config.tts_program),
                self.config.speech_rate,
                self.config.speech_volume,
            )),
        };

        synth.set_rate(self.config.speech_rate);
        synth.set_volume(self.config.speech_volume);
        match synth.voices() {
            Ok(voices) => {
                if let Some(voice) = preferred_voice(&voices) {
                    if let Err(e) = synth.set_voice(&voice.id) {
                        warn!(error = %e, "Failed to select startup voice");
                    } else {
                        debug!(voice = %voice.name, "Selected startup voice");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not enumerate voices"),
        }

        Ok(VoiceBridge {
            provider,
            input: Arc::new(Mutex::new(InputState {
                device: None,
                device_index: None,
                endpointer: Endpointer::new(EndpointConfig::from(&self.config)),
            })),
            recognizer,
            synth,
            current: Mutex::new(None),
        })
    }
}

impl VoiceBridge {
    pub fn builder(config: &VoiceConfig) -> VoiceBridgeBuilder {
        VoiceBridgeBuilder::new(config)
    }

    /// Bridge over the system devices and services.
    pub fn from_config(config: &VoiceConfig) -> Result<Self> {
        VoiceBridgeBuilder::new(config).build()
    }

    /// Calibrate, wait for speech and record one phrase on the blocking pool.
    async fn capture(
        &self,
        calibration: Duration,
        timeout: Option<Duration>,
        phrase_limit: Option<Duration>,
    ) -> Result<Capture> {
        let input = self.input.clone();
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = input
                .lock()
                .map_err(|_| ColloquyError::Audio("Microphone state poisoned".to_string()))?;
            let state = &mut *state;
            if state.device.is_none() {
                let device = provider.open(state.device_index)?;
                info!(device = device.name(), "Opened microphone");
                state.device = Some(device);
            }
            let device = state
                .device
                .as_mut()
                .ok_or_else(|| ColloquyError::Audio("No microphone".to_string()))?;
            if !calibration.is_zero() {
                state.endpointer.calibrate(device.as_mut(), calibration)?;
            }
            state.endpointer.capture(device.as_mut(), timeout, phrase_limit)
        })
        .await
        .map_err(|e| ColloquyError::Audio(format!("Capture task failed: {}", e)))?
    }

    /// Listen for a single utterance.
    ///
    /// Returns `Ok(None)` when nothing was said before `timeout` or the
    /// speech could not be understood.
    pub async fn listen_once(
        &self,
        timeout: Option<Duration>,
        phrase_limit: Option<Duration>,
    ) -> Result<Option<String>> {
        info!("Listening...");
        match self.capture(LISTEN_CALIBRATION, timeout, phrase_limit).await? {
            Capture::TimedOut => {
                debug!("No speech before timeout");
                Ok(None)
            }
            Capture::Phrase(clip) => {
                let text = self.recognizer.recognize(&clip).await?;
                match &text {
                    Some(t) => info!(chars = t.len(), "Recognized speech"),
                    None => debug!("Speech was unintelligible"),
                }
                Ok(text)
            }
        }
    }

    /// Keep listening until `stop` is set, handing each recognized phrase to
    /// `on_text`. A recognition or audio failure ends the loop with that
    /// error.
    pub fn listen_continuous<F>(self: &Arc<Self>, on_text: F, stop: Arc<AtomicBool>) -> JoinHandle<Result<()>>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut calibration = CONTINUOUS_CALIBRATION;
            while !stop.load(Ordering::SeqCst) {
                let capture = bridge
                    .capture(calibration, Some(CONTINUOUS_TIMEOUT), Some(CONTINUOUS_PHRASE_LIMIT))
                    .await;
                calibration = Duration::ZERO;
                let clip = match capture {
                    Ok(Capture::Phrase(clip)) => clip,
                    Ok(Capture::TimedOut) => continue,
                    Err(e) => {
                        warn!(error = %e, "Continuous listening stopped");
                        return Err(e);
                    }
                };
                match bridge.recognizer.recognize(&clip).await {
                    Ok(Some(text)) => {
                        let text = text.trim();
                        if !text.is_empty() {
                            on_text(text.to_string());
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Continuous listening stopped");
                        return Err(e);
                    }
                }
            }
            debug!("Continuous listening ended");
            Ok(())
        })
    }

    /// Speak `text`.
    ///
    /// Any playback already in flight is stopped first. With `blocking` the
    /// call returns once playback ends; otherwise it returns the handle of
    /// the background playback. Blank text does nothing.
    pub async fn speak(&self, text: &str, blocking: bool) -> Result<Option<SpeechTask>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        self.stop_speaking();

        if blocking {
            let synth = self.synth.clone();
            let text = text.to_string();
            tokio::task::spawn_blocking(move || synth.speak(&text))
                .await
                .map_err(|e| ColloquyError::Synthesis(format!("Speech task failed: {}", e)))??;
            return Ok(None);
        }

        let task = SpeechTask::spawn(self.synth.clone(), text);
        if let Ok(mut current) = self.current.lock() {
            *current = Some(task.clone());
        }
        Ok(Some(task))
    }

    /// Stop the background playback, if any.
    pub fn stop_speaking(&self) {
        let previous = self.current.lock().ok().and_then(|mut c| c.take());
        if let Some(task) = previous {
            task.stop();
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.current
            .lock()
            .map(|c| c.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Render `text` to an audio file. Returns false on failure.
    pub async fn speak_to_file(&self, text: &str, path: &Path) -> bool {
        let synth = self.synth.clone();
        let text = text.to_string();
        let target: PathBuf = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || synth.save_to_file(&text, &target)).await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, path = %path.display(), "Failed to save speech");
                false
            }
            Err(e) => {
                warn!(error = %e, "Speech task failed");
                false
            }
        }
    }

    pub fn list_microphones(&self) -> Result<Vec<String>> {
        self.provider.list()
    }

    /// Switch input device. The device is opened on the next listen.
    pub fn set_microphone(&self, index: usize) -> Result<()> {
        let count = self.provider.list()?.len();
        if index >= count {
            return Err(ColloquyError::Audio(format!(
                "Microphone index {} out of range ({} available)",
                index, count
            )));
        }
        let mut state = self
            .input
            .lock()
            .map_err(|_| ColloquyError::Audio("Microphone state poisoned".to_string()))?;
        state.device_index = Some(index);
        state.device = None;
        info!(index, "Microphone selected");
        Ok(())
    }

    /// Index picked with `set_microphone`. `None` means the system default.
    pub fn selected_microphone(&self) -> Option<usize> {
        self.input.lock().ok().and_then(|state| state.device_index)
    }

    /// Current rate, volume and voice of the synthesizer.
    pub fn speech_properties(&self) -> SpeechProperties {
        self.synth.properties()
    }

    pub fn list_voices(&self) -> Result<Vec<VoiceInfo>> {
        self.synth.voices()
    }

    pub fn set_voice(&self, id: &str) -> Result<()> {
        self.synth.set_voice(id)
    }

    /// Words per minute, clamped to 50..=400.
    pub fn set_rate(&self, rate: u32) -> u32 {
        let rate = clamp_rate(rate);
        self.synth.set_rate(rate);
        rate
    }

    /// Clamped to 0.0..=1.0.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let volume = clamp_volume(volume);
        self.synth.set_volume(volume);
        volume
    }

    /// Listen briefly; true when any speech was recognized.
    pub async fn test_microphone(&self) -> bool {
        match self
            .listen_once(Some(Duration::from_secs(3)), Some(Duration::from_secs(2)))
            .await
        {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Microphone test failed");
                false
            }
        }
    }

    /// Speak a fixed sentence and wait for it to finish.
    pub async fn test_speakers(&self) -> bool {
        match self.speak(SPEAKER_TEST_TEXT, true).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Speaker test failed");
                false
            }
        }
    }
}

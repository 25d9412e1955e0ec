//! Text-to-speech.
//!
//! `CommandSynthesizer` drives the platform speech program (espeak-ng on
//! Linux, `say` on macOS, System.Speech through PowerShell on Windows) with
//! the text on stdin. `stop` kills the running child.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use colloquy_core::error::{ColloquyError, Result};

pub const MIN_RATE: u32 = 50;
pub const MAX_RATE: u32 = 400;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// An installed voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    /// Identifier passed back to `set_voice`.
    pub id: String,
    pub name: String,
    pub language: Option<String>,
}

/// Current playback parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechProperties {
    /// Words per minute.
    pub rate: u32,
    /// 0.0 to 1.0.
    pub volume: f32,
    pub voice: Option<String>,
}

impl Default for SpeechProperties {
    fn default() -> Self {
        Self {
            rate: 200,
            volume: 0.9,
            voice: None,
        }
    }
}

/// Speech output engine.
///
/// Implementations use interior mutability so one instance can be shared
/// between the caller and a background playback task.
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak and block until playback finishes or `stop` is called.
    fn speak(&self, text: &str) -> Result<()>;

    /// Render speech to an audio file instead of the speakers.
    fn save_to_file(&self, text: &str, path: &Path) -> Result<()>;

    /// Interrupt the current playback, if any.
    fn stop(&self);

    fn voices(&self) -> Result<Vec<VoiceInfo>>;

    fn set_voice(&self, id: &str) -> Result<()>;

    /// Words per minute, clamped to 50..=400.
    fn set_rate(&self, rate: u32);

    /// Clamped to 0.0..=1.0.
    fn set_volume(&self, volume: f32);

    fn properties(&self) -> SpeechProperties;
}

/// Prefer a voice whose name mentions "female" or "zira", else the first.
pub fn preferred_voice(voices: &[VoiceInfo]) -> Option<&VoiceInfo> {
    voices
        .iter()
        .find(|v| {
            let name = v.name.to_lowercase();
            name.contains("female") || name.contains("zira")
        })
        .or_else(|| voices.first())
}

pub(crate) fn clamp_rate(rate: u32) -> u32 {
    rate.clamp(MIN_RATE, MAX_RATE)
}

pub(crate) fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Platform engines
// =============================================================================

/// How to invoke a speech program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsEngine {
    Espeak { program: String },
    Say,
    Sapi,
}

impl TtsEngine {
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            TtsEngine::Say
        } else if cfg!(target_os = "windows") {
            TtsEngine::Sapi
        } else {
            TtsEngine::Espeak {
                program: "espeak-ng".to_string(),
            }
        }
    }

    /// Engine for a configured program name; empty means the platform default.
    pub fn from_program(program: &str) -> Self {
        match program {
            "" => Self::platform_default(),
            "say" => TtsEngine::Say,
            p if p.starts_with("powershell") || p.starts_with("pwsh") => TtsEngine::Sapi,
            p => TtsEngine::Espeak {
                program: p.to_string(),
            },
        }
    }

    pub fn program(&self) -> &str {
        match self {
            TtsEngine::Espeak { program } => program,
            TtsEngine::Say => "say",
            TtsEngine::Sapi => "powershell",
        }
    }

    /// Arguments for speaking stdin, or writing it to `output`.
    pub fn speak_args(&self, props: &SpeechProperties, output: Option<&Path>) -> Vec<String> {
        match self {
            TtsEngine::Espeak { .. } => {
                let mut args = vec![
                    "-s".to_string(),
                    props.rate.to_string(),
                    "-a".to_string(),
                    ((props.volume * 100.0).round() as u32).to_string(),
                ];
                if let Some(voice) = &props.voice {
                    args.extend(["-v".to_string(), voice.clone()]);
                }
                if let Some(path) = output {
                    args.extend(["-w".to_string(), path.display().to_string()]);
                }
                args.push("--stdin".to_string());
                args
            }
            TtsEngine::Say => {
                let mut args = vec!["-r".to_string(), props.rate.to_string()];
                if let Some(voice) = &props.voice {
                    args.extend(["-v".to_string(), voice.clone()]);
                }
                if let Some(path) = output {
                    args.extend(["-o".to_string(), path.display().to_string()]);
                }
                args
            }
            TtsEngine::Sapi => {
                // System.Speech rate runs -10..10 around a default of about 200 wpm.
                let rate = ((props.rate as i32 - 200) / 20).clamp(-10, 10);
                let volume = (props.volume * 100.0).round() as u32;
                let mut script = format!(
                    "Add-Type -AssemblyName System.Speech; \
                     $s = New-Object System.Speech.Synthesis.SpeechSynthesizer; \
                     $s.Rate = {}; $s.Volume = {}; ",
                    rate, volume
                );
                if let Some(voice) = &props.voice {
                    script.push_str(&format!("$s.SelectVoice('{}'); ", ps_quote(voice)));
                }
                if let Some(path) = output {
                    script.push_str(&format!(
                        "$s.SetOutputToWaveFile('{}'); ",
                        ps_quote(&path.display().to_string())
                    ));
                }
                script.push_str("$s.Speak([Console]::In.ReadToEnd())");
                vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    script,
                ]
            }
        }
    }

    /// Text to feed on stdin. `say` has no volume flag, so it gets an
    /// inline volume command.
    pub fn stdin_text(&self, props: &SpeechProperties, text: &str) -> String {
        match self {
            TtsEngine::Say => format!("[[volm {:.2}]] {}", props.volume, text),
            _ => text.to_string(),
        }
    }

    pub fn voices_args(&self) -> Vec<String> {
        match self {
            TtsEngine::Espeak { .. } => vec!["--voices".to_string()],
            TtsEngine::Say => vec!["-v".to_string(), "?".to_string()],
            TtsEngine::Sapi => vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                "Add-Type -AssemblyName System.Speech; \
                 (New-Object System.Speech.Synthesis.SpeechSynthesizer).GetInstalledVoices() | \
                 ForEach-Object { $_.VoiceInfo.Name + '|' + $_.VoiceInfo.Culture }"
                    .to_string(),
            ],
        }
    }

    pub fn parse_voices(&self, output: &str) -> Vec<VoiceInfo> {
        match self {
            TtsEngine::Espeak { .. } => output
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    (cols.len() >= 5).then(|| VoiceInfo {
                        id: cols[3].to_string(),
                        name: cols[3].to_string(),
                        language: Some(cols[1].to_string()),
                    })
                })
                .collect(),
            TtsEngine::Say => output
                .lines()
                .filter_map(|line| {
                    let head = line.split('#').next()?.trim();
                    let (name, language) = head.rsplit_once(char::is_whitespace)?;
                    let name = name.trim();
                    (!name.is_empty()).then(|| VoiceInfo {
                        id: name.to_string(),
                        name: name.to_string(),
                        language: Some(language.to_string()),
                    })
                })
                .collect(),
            TtsEngine::Sapi => output
                .lines()
                .filter_map(|line| {
                    let (name, culture) = line.trim().split_once('|')?;
                    Some(VoiceInfo {
                        id: name.to_string(),
                        name: name.to_string(),
                        language: Some(culture.to_string()).filter(|c| !c.is_empty()),
                    })
                })
                .collect(),
        }
    }
}

fn ps_quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// Speech through a child process per utterance.
#[derive(Debug)]
pub struct CommandSynthesizer {
    engine: TtsEngine,
    props: Mutex<SpeechProperties>,
    /// The playing child, tagged with the utterance it belongs to.
    current: Mutex<Option<(u64, Child)>>,
    next_utterance: AtomicU64,
}

impl CommandSynthesizer {
    pub fn new(engine: TtsEngine, rate: u32, volume: f32) -> Self {
        Self {
            engine,
            props: Mutex::new(SpeechProperties {
                rate: clamp_rate(rate),
                volume: clamp_volume(volume),
                voice: None,
            }),
            current: Mutex::new(None),
            next_utterance: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &TtsEngine {
        &self.engine
    }

    /// Whether the speech program can be started at all.
    pub fn is_available(&self) -> bool {
        Command::new(self.engine.program())
            .args(self.engine.voices_args())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn spawn(&self, text: &str, output: Option<&Path>) -> Result<Child> {
        let props = self.properties();
        let mut child = Command::new(self.engine.program())
            .args(self.engine.speak_args(&props, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ColloquyError::Synthesis(format!("Failed to start {}: {}", self.engine.program(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.engine.stdin_text(&props, text).as_bytes())
                .map_err(|e| ColloquyError::Synthesis(format!("Failed to send text: {}", e)))?;
        }
        Ok(child)
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        let child = self.spawn(text, None)?;
        let utterance = self.next_utterance.fetch_add(1, Ordering::SeqCst);
        {
            let mut current = self
                .current
                .lock()
                .map_err(|_| ColloquyError::Synthesis("Playback state poisoned".to_string()))?;
            *current = Some((utterance, child));
        }
        debug!(utterance, "Speech started");

        loop {
            {
                let mut current = self
                    .current
                    .lock()
                    .map_err(|_| ColloquyError::Synthesis("Playback state poisoned".to_string()))?;
                match current.as_mut() {
                    Some((id, child)) if *id == utterance => match child.try_wait() {
                        Ok(Some(status)) => {
                            *current = None;
                            return if status.success() {
                                Ok(())
                            } else {
                                Err(ColloquyError::Synthesis(format!(
                                    "{} exited with {}",
                                    self.engine.program(),
                                    status
                                )))
                            };
                        }
                        Ok(None) => {}
                        Err(e) => {
                            *current = None;
                            return Err(ColloquyError::Synthesis(e.to_string()));
                        }
                    },
                    // Stopped or replaced.
                    _ => return Ok(()),
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn save_to_file(&self, text: &str, path: &Path) -> Result<()> {
        let child = self.spawn(text, Some(path))?;
        let output = child
            .wait_with_output()
            .map_err(|e| ColloquyError::Synthesis(e.to_string()))?;
        if !output.status.success() {
            return Err(ColloquyError::Synthesis(format!(
                "{} exited with {}",
                self.engine.program(),
                output.status
            )));
        }
        info!(path = %path.display(), "Speech saved to file");
        Ok(())
    }

    fn stop(&self) {
        let taken = match self.current.lock() {
            Ok(mut current) => current.take(),
            Err(_) => None,
        };
        if let Some((utterance, mut child)) = taken {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Speech process already exited");
            }
            if let Err(e) = child.wait() {
                warn!(error = %e, "Failed to reap speech process");
            }
            debug!(utterance, "Speech stopped");
        }
    }

    fn voices(&self) -> Result<Vec<VoiceInfo>> {
        let output = Command::new(self.engine.program())
            .args(self.engine.voices_args())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| ColloquyError::Synthesis(format!("Failed to list voices: {}", e)))?;
        Ok(self
            .engine
            .parse_voices(&String::from_utf8_lossy(&output.stdout)))
    }

    fn set_voice(&self, id: &str) -> Result<()> {
        let voices = self.voices()?;
        if !voices.is_empty() && !voices.iter().any(|v| v.id == id) {
            return Err(ColloquyError::Synthesis(format!("Unknown voice: {}", id)));
        }
        if let Ok(mut props) = self.props.lock() {
            props.voice = Some(id.to_string());
        }
        Ok(())
    }

    fn set_rate(&self, rate: u32) {
        if let Ok(mut props) = self.props.lock() {
            props.rate = clamp_rate(rate);
        }
    }

    fn set_volume(&self, volume: f32) {
        if let Ok(mut props) = self.props.lock() {
            props.volume = clamp_volume(volume);
        }
    }

    fn properties(&self) -> SpeechProperties {
        self.props
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Mock implementation
// =============================================================================

/// Recording synthesizer for testing.
///
/// Each `speak` lasts `duration` unless interrupted by `stop`.
#[derive(Debug, Default)]
pub struct MockSynthesizer {
    duration: Duration,
    voices: Vec<VoiceInfo>,
    props: Mutex<SpeechProperties>,
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    saved: Mutex<Vec<PathBuf>>,
    stop_generation: AtomicU64,
    stops: AtomicUsize,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each utterance takes `duration` to play.
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    pub fn with_voices(mut self, names: &[&str]) -> Self {
        self.voices = names
            .iter()
            .map(|n| VoiceInfo {
                id: n.to_string(),
                name: n.to_string(),
                language: Some("en-US".to_string()),
            })
            .collect();
        self
    }

    /// Texts whose playback began.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Texts that played to the end.
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn saved(&self) -> Vec<PathBuf> {
        self.saved.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl SpeechSynthesizer for MockSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        let generation = self.stop_generation.load(Ordering::SeqCst);
        if let Ok(mut started) = self.started.lock() {
            started.push(text.to_string());
        }
        let mut remaining = self.duration;
        while !remaining.is_zero() {
            if self.stop_generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let step = remaining.min(Duration::from_millis(5));
            std::thread::sleep(step);
            remaining -= step;
        }
        if let Ok(mut completed) = self.completed.lock() {
            completed.push(text.to_string());
        }
        Ok(())
    }

    fn save_to_file(&self, text: &str, path: &Path) -> Result<()> {
        std::fs::write(path, text)?;
        if let Ok(mut saved) = self.saved.lock() {
            saved.push(path.to_path_buf());
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn voices(&self) -> Result<Vec<VoiceInfo>> {
        Ok(self.voices.clone())
    }

    fn set_voice(&self, id: &str) -> Result<()> {
        if !self.voices.iter().any(|v| v.id == id) {
            return Err(ColloquyError::Synthesis(format!("Unknown voice: {}", id)));
        }
        if let Ok(mut props) = self.props.lock() {
            props.voice = Some(id.to_string());
        }
        Ok(())
    }

    fn set_rate(&self, rate: u32) {
        if let Ok(mut props) = self.props.lock() {
            props.rate = clamp_rate(rate);
        }
    }

    fn set_volume(&self, volume: f32) {
        if let Ok(mut props) = self.props.lock() {
            props.volume = clamp_volume(volume);
        }
    }

    fn properties(&self) -> SpeechProperties {
        self.props.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(name: &str) -> VoiceInfo {
        VoiceInfo {
            id: name.to_string(),
            name: name.to_string(),
            language: None,
        }
    }

    #[test]
    fn test_preferred_voice() {
        let voices = vec![voice("David"), voice("Microsoft Zira Desktop"), voice("Mark")];
        assert_eq!(preferred_voice(&voices).unwrap().name, "Microsoft Zira Desktop");

        let voices = vec![voice("David"), voice("Mark")];
        assert_eq!(preferred_voice(&voices).unwrap().name, "David");
        assert!(preferred_voice(&[]).is_none());
    }

    #[test]
    fn test_clamps() {
        assert_eq!(clamp_rate(10), 50);
        assert_eq!(clamp_rate(1000), 400);
        assert_eq!(clamp_rate(180), 180);
        assert_eq!(clamp_volume(1.5), 1.0);
        assert_eq!(clamp_volume(-0.1), 0.0);
        assert_eq!(clamp_volume(f32::NAN), 0.0);
    }

    #[test]
    fn test_espeak_args() {
        let engine = TtsEngine::Espeak {
            program: "espeak-ng".into(),
        };
        let props = SpeechProperties {
            rate: 180,
            volume: 0.9,
            voice: Some("en-us".into()),
        };
        assert_eq!(
            engine.speak_args(&props, Some(Path::new("/tmp/out.wav"))),
            vec!["-s", "180", "-a", "90", "-v", "en-us", "-w", "/tmp/out.wav", "--stdin"]
        );
        assert_eq!(engine.stdin_text(&props, "hi"), "hi");
    }

    #[test]
    fn test_say_args_and_volume_prefix() {
        let props = SpeechProperties::default();
        assert_eq!(TtsEngine::Say.speak_args(&props, None), vec!["-r", "200"]);
        assert_eq!(TtsEngine::Say.stdin_text(&props, "hello"), "[[volm 0.90]] hello");
    }

    #[test]
    fn test_sapi_script() {
        let props = SpeechProperties {
            rate: 300,
            volume: 0.5,
            voice: Some("O'Brien".into()),
        };
        let args = TtsEngine::Sapi.speak_args(&props, None);
        let script = args.last().unwrap();
        assert!(script.contains("$s.Rate = 5;"));
        assert!(script.contains("$s.Volume = 50;"));
        assert!(script.contains("SelectVoice('O''Brien')"));
    }

    #[test]
    fn test_parse_espeak_voices() {
        let output = "Pty Language       Age/Gender VoiceName          File                 Other Languages\n \
                      5  af              --/M      Afrikaans          gmw/af\n \
                      5  en-us           --/M      English_(America)  gmw/en-US            (en 10)\n";
        let voices = TtsEngine::Espeak { program: "espeak-ng".into() }.parse_voices(output);
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[1].id, "English_(America)");
        assert_eq!(voices[1].language.as_deref(), Some("en-us"));
    }

    #[test]
    fn test_parse_say_voices() {
        let output = "Alex                en_US    # Most people recognize me by my voice.\n\
                      Bad News            en_US    # The light you see at the end of the tunnel\n";
        let voices = TtsEngine::Say.parse_voices(output);
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[1].name, "Bad News");
        assert_eq!(voices[1].language.as_deref(), Some("en_US"));
    }

    #[test]
    fn test_parse_sapi_voices() {
        let voices = TtsEngine::Sapi.parse_voices("Microsoft David Desktop|en-US\r\nMicrosoft Zira Desktop|en-US\r\n");
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[1].name, "Microsoft Zira Desktop");
    }

    #[test]
    fn test_from_program() {
        assert_eq!(TtsEngine::from_program("say"), TtsEngine::Say);
        assert_eq!(TtsEngine::from_program("powershell.exe"), TtsEngine::Sapi);
        assert_eq!(
            TtsEngine::from_program("espeak"),
            TtsEngine::Espeak { program: "espeak".into() }
        );
        assert_eq!(TtsEngine::from_program(""), TtsEngine::platform_default());
    }

    #[test]
    fn test_missing_program_is_synthesis_error() {
        let synth = CommandSynthesizer::new(
            TtsEngine::Espeak {
                program: "definitely-not-a-tts-program".into(),
            },
            200,
            0.9,
        );
        assert!(!synth.is_available());
        assert!(matches!(synth.speak("hello"), Err(ColloquyError::Synthesis(_))));
        synth.stop();
    }

    #[test]
    fn test_command_synth_clamps_properties() {
        let synth = CommandSynthesizer::new(TtsEngine::Say, 1000, 2.0);
        assert_eq!(synth.properties().rate, 400);
        assert_eq!(synth.properties().volume, 1.0);
        synth.set_rate(20);
        synth.set_volume(0.3);
        assert_eq!(synth.properties().rate, 50);
        assert_eq!(synth.properties().volume, 0.3);
    }

    #[test]
    fn test_mock_stop_interrupts() {
        let synth = std::sync::Arc::new(MockSynthesizer::with_duration(Duration::from_secs(5)));
        let worker = {
            let synth = synth.clone();
            std::thread::spawn(move || synth.speak("long story"))
        };
        std::thread::sleep(Duration::from_millis(30));
        synth.stop();
        worker.join().unwrap().unwrap();
        assert_eq!(synth.started(), vec!["long story"]);
        assert!(synth.completed().is_empty());
    }
}

//! Interactive menu, environment setup and the component self-check.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use colloquy_core::config::ColloquyConfig;
use colloquy_core::error::Result;
use colloquy_media::resolve_temp_dir;
use colloquy_voice::TtsEngine;

use crate::components;

// =============================================================================
// Menu
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Serve,
    Setup,
    Check,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(MenuChoice::Serve),
            "2" => Some(MenuChoice::Setup),
            "3" => Some(MenuChoice::Check),
            "4" => Some(MenuChoice::Exit),
            _ => None,
        }
    }
}

const MENU: &str = "\
Colloquy launcher
  1) Launch the server
  2) Set up the environment
  3) Run the self-check
  4) Exit";

/// Show the menu and read choices until a valid one arrives.
///
/// End of input counts as `Exit`.
pub async fn prompt_choice<R>(reader: &mut R) -> std::io::Result<MenuChoice>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        println!("\n{}", MENU);
        print!("Enter your choice (1-4): ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(MenuChoice::Exit);
        }
        match MenuChoice::parse(&line) {
            Some(choice) => return Ok(choice),
            None => println!("Invalid choice. Please enter 1, 2, 3, or 4."),
        }
    }
}

// =============================================================================
// Setup
// =============================================================================

#[derive(Debug)]
pub struct SetupReport {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    /// False when a config file was already present.
    pub config_written: bool,
    pub api_key_env: String,
    pub api_key_set: bool,
    pub ffmpeg: Option<PathBuf>,
    pub tts_program: String,
    pub tts: Option<PathBuf>,
}

impl SetupReport {
    pub fn is_complete(&self) -> bool {
        self.api_key_set && self.ffmpeg.is_some() && self.tts.is_some()
    }
}

impl fmt::Display for SetupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data directory: {}", self.data_dir.display())?;
        if self.config_written {
            writeln!(f, "Wrote default config: {}", self.config_path.display())?;
        } else {
            writeln!(f, "Using existing config: {}", self.config_path.display())?;
        }
        let key = if self.api_key_set { "set" } else { "NOT SET" };
        writeln!(f, "{}: {}", self.api_key_env, key)?;
        match &self.ffmpeg {
            Some(path) => writeln!(f, "ffmpeg: {}", path.display())?,
            None => writeln!(f, "ffmpeg: not found (camera capture unavailable)")?,
        }
        match &self.tts {
            Some(path) => write!(f, "{}: {}", self.tts_program, path.display()),
            None => write!(f, "{}: not found (speech output unavailable)", self.tts_program),
        }
    }
}

/// Prepare directories and config, then look for external requirements.
pub fn run_setup(
    config_path: &Path,
    config: &ColloquyConfig,
    data_dir: &Path,
) -> Result<SetupReport> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(resolve_temp_dir(&config.media))?;

    let config_written = !config_path.exists();
    if config_written {
        config.save(config_path)?;
    }

    let api_key_set = std::env::var(&config.model.api_key_env)
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false);
    let engine = TtsEngine::from_program(&config.voice.tts_program);
    let tts_program = engine.program().to_string();

    Ok(SetupReport {
        data_dir: data_dir.to_path_buf(),
        config_path: config_path.to_path_buf(),
        config_written,
        api_key_env: config.model.api_key_env.clone(),
        api_key_set,
        ffmpeg: which::which(&config.camera.ffmpeg_program).ok(),
        tts: which::which(&tts_program).ok(),
        tts_program,
    })
}

// =============================================================================
// Self-check
// =============================================================================

#[derive(Debug)]
pub struct ComponentCheck {
    pub name: &'static str,
    /// `None` on success, otherwise the failure.
    pub error: Option<String>,
}

impl ComponentCheck {
    fn from_result<T>(name: &'static str, result: Result<T>) -> Self {
        Self {
            name,
            error: result.err().map(|e| e.to_string()),
        }
    }

    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct CheckReport {
    pub checks: Vec<ComponentCheck>,
}

impl CheckReport {
    pub fn failures(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed()).count()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            match &check.error {
                None => writeln!(f, "[ OK ] {}", check.name)?,
                Some(e) => writeln!(f, "[FAIL] {}: {}", check.name, e)?,
            }
        }
        if self.failures() == 0 {
            write!(f, "All components initialized.")
        } else {
            write!(f, "{} of {} components failed.", self.failures(), self.checks.len())
        }
    }
}

/// Construct each component once and record whether it came up.
pub fn run_check(config: &ColloquyConfig, data_dir: &Path) -> CheckReport {
    let checks = vec![
        ComponentCheck::from_result("Conversation store", components::open_store(config, data_dir)),
        ComponentCheck::from_result("Model gateway", components::build_gateway(config)),
        ComponentCheck::from_result("Image processor", components::build_media(config)),
        ComponentCheck::from_result("Voice bridge", components::build_voice(config)),
    ];
    CheckReport { checks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn temp_config(dir: &Path) -> ColloquyConfig {
        let mut config = ColloquyConfig::default();
        config.general.data_dir = dir.join("data").to_string_lossy().to_string();
        config.media.temp_dir = dir.join("media").to_string_lossy().to_string();
        config.model.api_key_env = "COLLOQUY_TEST_KEY_NEVER_SET".to_string();
        config.camera.ffmpeg_program = "colloquy-no-such-ffmpeg".to_string();
        config
    }

    #[test]
    fn test_menu_choice_parse() {
        assert_eq!(MenuChoice::parse("1\n"), Some(MenuChoice::Serve));
        assert_eq!(MenuChoice::parse(" 2 "), Some(MenuChoice::Setup));
        assert_eq!(MenuChoice::parse("3"), Some(MenuChoice::Check));
        assert_eq!(MenuChoice::parse("4"), Some(MenuChoice::Exit));
        assert_eq!(MenuChoice::parse("5"), None);
        assert_eq!(MenuChoice::parse("serve"), None);
        assert_eq!(MenuChoice::parse(""), None);
    }

    #[tokio::test]
    async fn test_prompt_skips_invalid_input() {
        let mut reader = BufReader::new(&b"9\nabc\n3\n"[..]);
        assert_eq!(prompt_choice(&mut reader).await.unwrap(), MenuChoice::Check);
    }

    #[tokio::test]
    async fn test_prompt_eof_exits() {
        let mut reader = BufReader::new(&b"7\n"[..]);
        assert_eq!(prompt_choice(&mut reader).await.unwrap(), MenuChoice::Exit);
    }

    #[test]
    fn test_setup_writes_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());
        let config_path = dir.path().join("conf").join("config.toml");
        let data_dir = dir.path().join("data");

        let first = run_setup(&config_path, &config, &data_dir).unwrap();
        assert!(first.config_written);
        assert!(config_path.exists());
        assert!(data_dir.is_dir());
        assert!(dir.path().join("media").is_dir());
        assert!(!first.api_key_set);
        assert!(first.ffmpeg.is_none());
        assert!(!first.is_complete());

        let second = run_setup(&config_path, &config, &data_dir).unwrap();
        assert!(!second.config_written);

        let saved = ColloquyConfig::load(&config_path).unwrap();
        assert_eq!(saved.model.api_key_env, "COLLOQUY_TEST_KEY_NEVER_SET");
    }

    #[test]
    fn test_setup_report_display() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());
        let report = run_setup(&dir.path().join("c.toml"), &config, &dir.path().join("data")).unwrap();
        let text = report.to_string();
        assert!(text.contains("COLLOQUY_TEST_KEY_NEVER_SET: NOT SET"));
        assert!(text.contains("ffmpeg: not found"));
    }

    #[test]
    fn test_check_reports_each_component() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(dir.path());

        let report = run_check(&config, &dir.path().join("data"));
        let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            ["Conversation store", "Model gateway", "Image processor", "Voice bridge"]
        );
        assert!(report.checks[0].passed());
        assert!(!report.checks[1].passed());
        assert!(report.checks[2].passed());
        assert!(report.failures() >= 1);
        assert!(report.to_string().contains("[FAIL] Model gateway"));
    }
}

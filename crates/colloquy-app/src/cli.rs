//! Command-line arguments for the `colloquy` binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const CONFIG_ENV: &str = "COLLOQUY_CONFIG";
pub const PORT_ENV: &str = "COLLOQUY_PORT";
pub const DEFAULT_PORT: u16 = 8501;

/// Colloquy - a chat assistant with image, camera and voice input.
#[derive(Parser, Debug)]
#[command(name = "colloquy", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the conversation database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// What to run. Without a command an interactive menu is shown.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server.
    Serve {
        /// Port to listen on (127.0.0.1 only).
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
    },
    /// Create the data directory and a default config, then report what is
    /// missing from the environment.
    Setup,
    /// Construct each component and report whether it works.
    Check,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > COLLOQUY_CONFIG env var > ~/.colloquy/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        default_config_path()
    }

    /// Resolve the data directory override, if any.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Resolve the server port.
///
/// Priority: --port flag > COLLOQUY_PORT env var > config file value > 8501.
pub fn resolve_port(flag: Option<u16>, config_port: u16) -> u16 {
    pick_port(flag, std::env::var(PORT_ENV).ok().as_deref(), config_port)
}

fn pick_port(flag: Option<u16>, env_value: Option<&str>, config_port: u16) -> u16 {
    if let Some(p) = flag {
        return p;
    }
    if let Some(p) = env_value.and_then(|v| v.trim().parse::<u16>().ok()) {
        return p;
    }
    if config_port != 0 {
        return config_port;
    }
    DEFAULT_PORT
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".colloquy").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".colloquy").join("config.toml");
    }
    PathBuf::from("config.toml")
}

//! Colloquy application binary - composition root.
//!
//! 1. Load `.env` and the TOML configuration
//! 2. Initialize tracing
//! 3. Run the chosen command, or the interactive menu when none is given
//!
//! `serve` opens the conversation store, builds the model gateway, media
//! processing, camera and voice bridge, and serves the HTTP API until Ctrl-C.

mod cli;
mod components;
mod launcher;

use std::path::PathBuf;

use clap::Parser;
use tokio::io::BufReader;

use colloquy_api::AppState;
use colloquy_core::config::ColloquyConfig;

use cli::{CliArgs, Command};
use launcher::MenuChoice;

/// Everything a command needs after startup.
struct Context {
    config_path: PathBuf,
    config: ColloquyConfig,
    data_dir: PathBuf,
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

async fn serve(ctx: &Context, port_flag: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = cli::resolve_port(port_flag, ctx.config.general.port);

    let mut config = ctx.config.clone();
    config.general.port = port;

    let chat = components::build_orchestrator(&config, &ctx.data_dir).map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize components");
        e
    })?;
    let state = AppState::new(config, chat);

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    };

    tracing::info!(port, "Starting HTTP server");
    if let Err(e) = colloquy_api::start_server(port, state, shutdown).await {
        tracing::error!(port, error = %e, "Server failed");
        return Err(e.into());
    }
    tracing::info!("Server stopped");
    Ok(())
}

fn setup(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let report = launcher::run_setup(&ctx.config_path, &ctx.config, &ctx.data_dir)?;
    println!("{}", report);
    if !report.is_complete() {
        println!("Some requirements are missing; the affected features will be unavailable.");
    }
    Ok(())
}

/// Print the self-check. Returns the number of failed components.
fn check(ctx: &Context) -> usize {
    let report = launcher::run_check(&ctx.config, &ctx.data_dir);
    println!("{}", report);
    report.failures()
}

async fn menu(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    loop {
        match launcher::prompt_choice(&mut stdin).await? {
            MenuChoice::Serve => return serve(ctx, None).await,
            MenuChoice::Setup => {
                if let Err(e) = setup(ctx) {
                    println!("Setup failed: {}", e);
                }
            }
            MenuChoice::Check => {
                check(ctx);
            }
            MenuChoice::Exit => {
                println!("Goodbye!");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();

    let config_path = args.resolve_config_path();
    let loaded = ColloquyConfig::load(&config_path);
    let log_level = args
        .resolve_log_level()
        .or_else(|| loaded.as_ref().ok().map(|c| c.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_tracing(&log_level);

    tracing::info!("Starting Colloquy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            if config_path.exists() {
                tracing::warn!(path = %config_path.display(), error = %e, "Invalid config, using defaults");
            } else {
                tracing::info!(path = %config_path.display(), "No config file, using defaults");
            }
            ColloquyConfig::default()
        }
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    let data_dir = components::resolve_data_dir(&config.general.data_dir);

    let ctx = Context {
        config_path,
        config,
        data_dir,
    };

    match args.command {
        Some(Command::Serve { port }) => serve(&ctx, port).await,
        Some(Command::Setup) => setup(&ctx),
        Some(Command::Check) => match check(&ctx) {
            0 => Ok(()),
            failed => Err(format!("{} component(s) failed the self-check", failed).into()),
        },
        None => menu(&ctx).await,
    }
}

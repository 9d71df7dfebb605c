//! buildenv - Copy-on-write build environments
//!
//! CLI entry point that dispatches to subcommands.

use buildenv::cli::{Cli, Commands};
use buildenv::config::ConfigManager;
use buildenv::error::BuildEnvResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> BuildEnvResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("buildenv=warn"),
        1 => EnvFilter::new("buildenv=info"),
        _ => EnvFilter::new("buildenv=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
    debug!("Loaded configuration from {}", config_manager.path().display());

    match cli.command {
        Commands::Image(args) => buildenv::cli::commands::image(args, &config).await,
        Commands::Scratch(args) => buildenv::cli::commands::scratch(args, &config).await,
        Commands::Config(args) => {
            buildenv::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

//! KernelHive - multi-kernel manager
//!
//! Main entry point for the KernelHive CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kernelhive_config::ConfigLoader;

mod cli;
mod cmd_config;
mod cmd_run;

use cli::{Cli, Commands};

/// Get the .kernelhive directory path.
fn kernelhive_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".kernelhive"))
        .unwrap_or_else(|| PathBuf::from(".kernelhive"))
}

/// Initialize tracing with console and file output.
///
/// Log files are written to ~/.kernelhive/logs/ with daily rotation.
fn init_tracing() -> anyhow::Result<()> {
    let log_dir = kernelhive_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("kernelhive")
        .filename_suffix("log")
        .max_log_files(14)
        .build(&log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keeps the file writer flushing for the life of the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        // Console goes to stderr so stdout carries only program output.
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            mode,
            language,
            format,
        } => {
            let config = ConfigLoader::load_or_default(cli.config.as_deref())?;
            cmd_run::run_file(config, &file, mode.map(Into::into), language, format).await
        }
        Commands::Pool { wait_secs, format } => {
            let config = ConfigLoader::load_or_default(cli.config.as_deref())?;
            cmd_run::show_pool(config, Duration::from_secs(wait_secs), format).await
        }
        Commands::CheckConfig { path } => cmd_config::check_config(path.or(cli.config)),
    }
}

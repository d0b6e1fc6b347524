//! CLI definitions for KernelHive.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use kernelhive_protocols::KernelMode;

/// KernelHive CLI.
#[derive(Parser)]
#[command(name = "kernelhive")]
#[command(about = "Multi-kernel manager for isolated code execution engines")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (defaults to the user config dir)
    #[arg(short, long, global = true, env = "KERNELHIVE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Execute a script file in a fresh kernel and print its events
    Run {
        /// Script file to execute
        file: PathBuf,

        /// Execution mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Kernel language
        #[arg(long = "lang")]
        language: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Preload the kernel pool and print its statistics
    Pool {
        /// Seconds to wait for the pool to fill
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Validate a configuration file
    CheckConfig {
        /// File to validate (overrides --config)
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ModeArg {
    InProcess,
    IsolatedWorker,
}

impl From<ModeArg> for KernelMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::InProcess => KernelMode::InProcess,
            ModeArg::IsolatedWorker => KernelMode::IsolatedWorker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "kernelhive",
            "run",
            "demo.ks",
            "--mode",
            "in-process",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                file,
                mode,
                language,
                format,
            } => {
                assert_eq!(file, PathBuf::from("demo.ks"));
                assert_eq!(mode.map(KernelMode::from), Some(KernelMode::InProcess));
                assert!(language.is_none());
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_check_config_with_global_flag() {
        let cli = Cli::try_parse_from(["kernelhive", "--config", "a.toml", "check-config"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("a.toml")));
        assert!(matches!(cli.command, Commands::CheckConfig { path: None }));
    }
}

//! CLI parser and dispatch.

mod check_config;
mod replay;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pacer")]
#[command(about = "Adaptive request pacing controller for crawlers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file, then print the effective settings
    CheckConfig {
        /// Config file (TOML, YAML or JSON)
        path: PathBuf,
    },

    /// Feed a recorded JSON-lines trace through a controller
    Replay {
        /// Trace file, one outcome per line
        trace: PathBuf,
        /// Config file (defaults are used when omitted)
        #[arg(short, long, env = "PACER_CONFIG")]
        config: Option<PathBuf>,
        /// Jitter seed, overrides the config
        #[arg(long)]
        seed: Option<u64>,
        /// Number of failing URLs listed in the final report
        #[arg(long, default_value = "10")]
        top: usize,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => check_config::cmd_check_config(&path).await,
        Commands::Replay {
            trace,
            config,
            seed,
            top,
        } => replay::cmd_replay(&trace, config.as_deref(), seed, top).await,
    }
}

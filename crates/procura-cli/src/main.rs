//! procura - operator CLI for the authority enforcement core.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use procura_core::CoreConfig;
use tracing_subscriber::EnvFilter;

mod commands;

/// procura - mandate authority operations
#[derive(Parser, Debug)]
#[command(name = "procura")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the core configuration file
    #[arg(short, long, default_value = "procura.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Key management ===
    /// Generate a signing keypair for a principal
    Keys {
        #[command(subcommand)]
        command: commands::keys::KeysCommand,
    },

    // === Mandate inspection ===
    /// Inspect mandates and delegation chains
    Mandates {
        #[command(subcommand)]
        command: commands::mandates::MandatesCommand,
    },

    // === Audit ===
    /// Query and export the audit ledger
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommand,
    },

    // === Recovery ===
    /// Replay the ledger to rebuild derived state
    Replay(commands::replay::ReplayArgs),

    /// Take a snapshot of derived state
    Snapshot {
        /// Partition to snapshot
        #[arg(long, default_value_t = 0)]
        partition: i32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = if cli.config.exists() {
        CoreConfig::load(&cli.config)?
    } else {
        CoreConfig::default()
    };

    match cli.command {
        Commands::Keys { command } => commands::keys::run(&config, command),
        Commands::Mandates { command } => commands::mandates::run(&config, command),
        Commands::Audit { command } => commands::audit::run(&config, command),
        Commands::Replay(args) => commands::replay::run(&config, &args),
        Commands::Snapshot { partition } => commands::replay::snapshot(&config, partition),
    }
}

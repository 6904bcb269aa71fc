//! keyfleet — distributed keyspace search coordinator.
//!
//! Single binary that assembles the fleet subsystems:
//! - State store (redb)
//! - Keyspace partitioner
//! - Deployment orchestrator (gcloud cloud-shell transport)
//! - Fleet monitor + stats
//! - Stop controller
//! - Scaling controller
//! - Checkpoint backups
//!
//! # Usage
//!
//! ```text
//! keyfleet deploy --config keyfleet.toml --registry targets.txt
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "keyfleet",
    about = "Distributed keyspace search coordinator",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Partition the keyspace, deploy workers, and run to completion.
    Deploy {
        /// Coordinator configuration (TOML).
        #[arg(long, default_value = "keyfleet.toml")]
        config: PathBuf,

        /// Target registry, one `identifier[:locality[:principal]]` per line.
        #[arg(long, default_value = "targets.txt")]
        registry: PathBuf,

        /// Directory for persistent run state.
        #[arg(long, default_value = "./keyfleet-state")]
        data_dir: PathBuf,
    },
    /// Emit the derived instance manifest as JSON and exit.
    Config {
        #[arg(long, default_value = "keyfleet.toml")]
        config: PathBuf,

        #[arg(long, default_value = "targets.txt")]
        registry: PathBuf,
    },
    /// Probe connectivity to every target. No mutation.
    Test {
        #[arg(long, default_value = "keyfleet.toml")]
        config: PathBuf,

        #[arg(long, default_value = "targets.txt")]
        registry: PathBuf,
    },
    /// Terminate workers and remove work directories on all targets.
    Cleanup {
        #[arg(long, default_value = "keyfleet.toml")]
        config: PathBuf,

        #[arg(long, default_value = "targets.txt")]
        registry: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keyfleet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Deploy {
            config,
            registry,
            data_dir,
        } => commands::deploy::run(&config, &registry, &data_dir).await,
        Command::Config { config, registry } => commands::config::run(&config, &registry),
        Command::Test { config, registry } => commands::probe::run(&config, &registry).await,
        Command::Cleanup { config, registry } => commands::cleanup::run(&config, &registry).await,
    }
}

//! Top-level CLI definition and dispatch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::core::errors::Result;
use crate::objects;

/// fleetmon — monitoring daemon core engine.
#[derive(Parser)]
#[command(name = "fleetmon", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the monitoring daemon in the foreground.
    Daemon {
        /// Engine configuration TOML.
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Fleet definition TOML (hosts, services, commands, dependencies).
        #[arg(long, value_name = "FILE")]
        fleet: PathBuf,
    },
    /// Parse and validate the configuration and fleet files, then exit.
    CheckConfig {
        /// Engine configuration TOML.
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Fleet definition TOML.
        #[arg(long, value_name = "FILE")]
        fleet: PathBuf,
    },
    /// Internal check-runner mode; spawned by the daemon, not for direct use.
    #[command(hide = true)]
    Worker {
        /// Concurrent job cap for this worker process; 0 means unlimited.
        #[arg(long, default_value_t = 64)]
        max_jobs: usize,
    },
}

/// Dispatch a parsed command line.
pub fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Daemon { config, fleet } => {
            let cfg = EngineConfig::load(config)?;
            let arena = objects::load_fleet(fleet)?;
            crate::daemon::run_daemon(cfg, arena)
        }
        Command::CheckConfig { config, fleet } => {
            let cfg = EngineConfig::load(config)?;
            let arena = objects::load_fleet(fleet)?;
            println!(
                "configuration OK: {} hosts, {} services, {} commands, {} workers",
                arena.hosts.len(),
                arena.services.len(),
                arena.commands.len(),
                cfg.worker_count
            );
            Ok(())
        }
        Command::Worker { max_jobs } => run_worker(*max_jobs),
    }
}

#[cfg(unix)]
fn run_worker(max_jobs: usize) -> Result<()> {
    crate::workers::runner::run(max_jobs)
}

#[cfg(not(unix))]
fn run_worker(_max_jobs: usize) -> Result<()> {
    Err(crate::core::errors::FmError::Runtime {
        details: "worker mode is only available on unix".to_string(),
    })
}

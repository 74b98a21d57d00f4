//! Daemon subsystem: the foreground monitoring loop, signal handling, and
//! the external command vocabulary.

pub mod loop_main;
pub mod signals;

pub use loop_main::{LoopExit, run_event_loop};
pub use signals::SignalFlags;

use crossbeam_channel::Receiver;

use crate::config::EngineConfig;
use crate::core::UnixTs;
use crate::core::errors::Result;
use crate::engine::Engine;
use crate::objects::ObjectArena;
use crate::workers::{ProcessSpawner, WorkerPools};

/// Commands submitted from outside the engine (passive results, control).
#[derive(Debug, Clone)]
pub enum ExternalCommand {
    /// Externally produced host check result.
    PassiveHostResult {
        /// Host name.
        host: String,
        /// Plugin-convention return code.
        return_code: i32,
        /// Raw plugin output.
        output: String,
        /// When the external checker ran, epoch seconds.
        timestamp: UnixTs,
    },
    /// Externally produced service check result.
    PassiveServiceResult {
        /// Host name.
        host: String,
        /// Service description.
        service: String,
        /// Plugin-convention return code.
        return_code: i32,
        /// Raw plugin output.
        output: String,
        /// When the external checker ran, epoch seconds.
        timestamp: UnixTs,
    },
    /// Stop the daemon.
    Shutdown,
}

/// Run the daemon in the foreground with no external command source.
pub fn run_daemon(config: EngineConfig, objects: ObjectArena) -> Result<()> {
    // Sender dropped immediately; the loop swaps a disconnected receiver for
    // `never`.
    let (_tx, rx) = crossbeam_channel::unbounded();
    run_daemon_with_commands(config, objects, &rx)
}

/// Run the daemon in the foreground, accepting external commands on
/// `external_rx`.
pub fn run_daemon_with_commands(
    config: EngineConfig,
    objects: ObjectArena,
    external_rx: &Receiver<ExternalCommand>,
) -> Result<()> {
    let (worker_tx, worker_rx) = crossbeam_channel::unbounded();
    let mut pools = WorkerPools::new(
        Box::new(ProcessSpawner {
            max_jobs: config.worker_max_jobs,
        }),
        worker_tx,
    );
    pools.spawn_default(config.worker_count)?;
    for pool in &config.specialized_workers {
        pools.add_specialized(&pool.command, pool.count)?;
    }

    let mut engine = Engine::new(config, objects, pools)?;
    engine.init_scheduling();

    let flags = SignalFlags::install()?;
    tracing::info!("daemon started");

    loop {
        match run_event_loop(&mut engine, &worker_rx, external_rx, &flags) {
            LoopExit::Restart => {
                // Object and config reload would need a rebuilt arena;
                // accept the signal but keep the running configuration.
                tracing::warn!(
                    "SIGHUP received; live configuration reload is not supported, continuing"
                );
            }
            LoopExit::Shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            LoopExit::QueueEmpty => {
                tracing::info!("timer queue empty; nothing left to monitor");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}

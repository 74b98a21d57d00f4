//! The main event loop.
//!
//! One control thread multiplexes three inputs: the timer queue, worker
//! reply frames, and externally submitted commands. Blocking happens inside
//! a crossbeam `select` whose timeout is the time until the earliest timer,
//! clamped to keep signal-flag polling responsive. Channel readiness ends an
//! iteration without firing a timer, so result ingestion always wins over
//! scheduling when both are ready.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, never, select};

use crate::daemon::ExternalCommand;
use crate::daemon::signals::SignalFlags;
use crate::engine::Engine;
use crate::scheduler::Disposition;
use crate::workers::WorkerEvent;

/// Upper bound on one select wait. Keeps signal response latency bounded
/// even when the next timer is far away.
const MAX_POLL: Duration = Duration::from_millis(1500);

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Nothing left in the timer queue.
    QueueEmpty,
    /// A shutdown signal or external shutdown command arrived.
    Shutdown,
    /// SIGHUP arrived.
    Restart,
}

/// Run the loop until it has a reason to stop. The engine is left intact;
/// the caller decides whether to drain it.
pub fn run_event_loop(
    engine: &mut Engine,
    worker_rx: &Receiver<WorkerEvent>,
    external_rx: &Receiver<ExternalCommand>,
    flags: &SignalFlags,
) -> LoopExit {
    // Disconnected channels are swapped for `never` so a dead sender cannot
    // spin the loop.
    let mut worker_rx = worker_rx.clone();
    let mut external_rx = external_rx.clone();

    loop {
        if flags.shutdown_requested() {
            return LoopExit::Shutdown;
        }
        if flags.take_restart() {
            return LoopExit::Restart;
        }

        let Some((_, fire_at)) = engine.queue.peek() else {
            return LoopExit::QueueEmpty;
        };
        let timeout = fire_at
            .saturating_duration_since(Instant::now())
            .min(MAX_POLL);

        select! {
            recv(worker_rx) -> msg => match msg {
                Ok(event) => engine.handle_worker_event(event),
                Err(_) => {
                    tracing::debug!("worker event channel closed");
                    worker_rx = never();
                }
            },
            recv(external_rx) -> msg => match msg {
                Ok(cmd) => {
                    if apply_external_command(engine, cmd) {
                        return LoopExit::Shutdown;
                    }
                }
                Err(_) => {
                    external_rx = never();
                }
            },
            default(timeout) => {
                // The wait may have been clamped; only fire a timer that has
                // really elapsed.
                let now = Instant::now();
                if let Some((payload, fire_at)) = engine.queue.pop_due(now) {
                    let latency_s = now.duration_since(fire_at).as_secs_f64();
                    engine.dispatch_event(payload, Disposition::Timed { latency_s });
                }
            }
        }
    }
}

/// Apply one external command. Returns true when the loop should stop.
fn apply_external_command(engine: &mut Engine, cmd: ExternalCommand) -> bool {
    match cmd {
        ExternalCommand::PassiveHostResult {
            host,
            return_code,
            output,
            timestamp,
        } => {
            if let Err(e) =
                engine.process_passive_host_result(&host, return_code, &output, timestamp)
            {
                tracing::warn!(host = %host, error = %e, "passive host result rejected");
            }
            false
        }
        ExternalCommand::PassiveServiceResult {
            host,
            service,
            return_code,
            output,
            timestamp,
        } => {
            if let Err(e) = engine
                .process_passive_service_result(&host, &service, return_code, &output, timestamp)
            {
                tracing::warn!(host = %host, service = %service, error = %e, "passive service result rejected");
            }
            false
        }
        ExternalCommand::Shutdown => true,
    }
}

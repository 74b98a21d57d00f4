//! Process signal handling.
//!
//! Handlers only flip atomic flags; the event loop polls them once per
//! iteration, so all real work happens on the control thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;

use crate::core::errors::{FmError, Result};

/// Shutdown/restart flags shared with the signal handlers.
#[derive(Clone)]
pub struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalFlags {
    /// Flags with no handlers attached. Tests flip them directly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            restart: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register SIGTERM/SIGINT as shutdown and SIGHUP as restart.
    pub fn install() -> Result<Self> {
        let flags = Self::new();
        for (sig, target) in [
            (SIGTERM, &flags.shutdown),
            (SIGINT, &flags.shutdown),
            (SIGHUP, &flags.restart),
        ] {
            flag::register(sig, Arc::clone(target)).map_err(|e| FmError::Runtime {
                details: format!("signal handler registration failed: {e}"),
            })?;
        }
        Ok(flags)
    }

    /// Whether a shutdown signal has arrived.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Consume a pending restart request.
    #[must_use]
    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown from code (tests, external commands).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Request restart from code.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Relaxed);
    }
}

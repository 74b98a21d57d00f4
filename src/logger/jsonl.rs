//! Append-only JSONL writer for engine events.
//!
//! A write failure degrades the log to a no-op after one warning; monitoring
//! must keep running when its own disk is the thing that is broken.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::core::errors::{FmError, Result};

/// One event-log line.
#[derive(Debug, Serialize)]
pub struct LogRecord<'a> {
    /// RFC 3339 timestamp.
    pub ts: String,
    /// Record kind, e.g. `"HOST ALERT"`.
    pub kind: &'a str,
    /// Host name.
    pub host: &'a str,
    /// Service description, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<&'a str>,
    /// State name, e.g. `"DOWN"`.
    pub state: &'a str,
    /// `"SOFT"` or `"HARD"`, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_type: Option<&'a str>,
    /// Attempt number, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Short plugin output.
    pub output: &'a str,
}

impl<'a> LogRecord<'a> {
    /// Record stamped with the current time.
    #[must_use]
    pub fn now(kind: &'a str, host: &'a str, state: &'a str, output: &'a str) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            kind,
            host,
            service: None,
            state,
            state_type: None,
            attempt: None,
            output,
        }
    }
}

/// Append-only JSONL event log.
pub struct EventLog {
    file: Option<File>,
    degraded: bool,
}

impl EventLog {
    /// Open (or create) the log at `path` in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FmError::io(path, e))?;
        Ok(Self {
            file: Some(file),
            degraded: false,
        })
    }

    /// Log sink that drops everything.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            file: None,
            degraded: false,
        }
    }

    /// Append one record. Never fails; a broken log degrades to a no-op.
    pub fn write(&mut self, record: &LogRecord<'_>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if self.degraded {
            return;
        }
        let outcome = serde_json::to_string(record)
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(file, "{line}"));
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "event log write failed; disabling event log");
            self.degraded = true;
        }
    }
}

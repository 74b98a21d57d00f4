//! FM-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, FmError>;

/// Top-level error type for fleetmon.
#[derive(Debug, Error)]
pub enum FmError {
    #[error("[FM-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[FM-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[FM-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[FM-1101] unknown object reference: {kind} {name}")]
    UnknownObject { kind: &'static str, name: String },

    #[error("[FM-2001] check not viable for {object}: {reason}")]
    CheckNotViable { object: String, reason: String },

    #[error("[FM-2002] no check command defined for {object}")]
    NoCheckCommand { object: String },

    #[error("[FM-2003] macro expansion failure in '{template}': {details}")]
    MacroExpansion { template: String, details: String },

    #[error("[FM-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[FM-3001] worker pool saturated ({pool})")]
    WorkerPoolSaturated { pool: String },

    #[error("[FM-3002] worker dispatch failure on {worker}: {details}")]
    WorkerDispatch { worker: String, details: String },

    #[error("[FM-3003] worker spawn failure: {details}")]
    WorkerSpawn { details: String },

    #[error("[FM-3004] malformed worker frame: {details}")]
    FrameDecode { details: String },

    #[error("[FM-3101] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[FM-3102] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[FM-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl FmError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "FM-1001",
            Self::MissingConfig { .. } => "FM-1002",
            Self::ConfigParse { .. } => "FM-1003",
            Self::UnknownObject { .. } => "FM-1101",
            Self::CheckNotViable { .. } => "FM-2001",
            Self::NoCheckCommand { .. } => "FM-2002",
            Self::MacroExpansion { .. } => "FM-2003",
            Self::Serialization { .. } => "FM-2101",
            Self::WorkerPoolSaturated { .. } => "FM-3001",
            Self::WorkerDispatch { .. } => "FM-3002",
            Self::WorkerSpawn { .. } => "FM-3003",
            Self::FrameDecode { .. } => "FM-3004",
            Self::Io { .. } => "FM-3101",
            Self::ChannelClosed { .. } => "FM-3102",
            Self::Runtime { .. } => "FM-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CheckNotViable { .. }
                | Self::WorkerPoolSaturated { .. }
                | Self::WorkerDispatch { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for FmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for FmError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

//! Core primitives shared across the engine: error types and id sequences.

pub mod errors;
pub mod ids;

/// Wall-clock timestamp in whole seconds since the Unix epoch.
pub type UnixTs = i64;

//! JSONL event log: alerts, state flaps, and passive check records, one JSON
//! object per line, with graceful degradation when the log cannot be written.

pub mod jsonl;

pub use jsonl::{EventLog, LogRecord};

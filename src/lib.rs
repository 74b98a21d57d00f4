//! fleetmon — a monitoring daemon's core execution engine.
//!
//! Periodically verifies the health of many hosts and services by invoking
//! external check commands, interprets their results through soft/hard state
//! machines, and keeps itself honest with freshness and orphan sweeps.
//!
//! The pipeline: a binary-heap timed-event queue drives a single-threaded
//! event loop; due checks are dispatched to pools of out-of-process workers;
//! replies come back over channels and flow through the host and service
//! state machines, which handle reachability, dependencies, flap detection,
//! and rescheduling.

pub mod broker;
pub mod checks;
#[cfg(feature = "cli")]
pub mod cli_app;
pub mod config;
pub mod core;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod engine;
pub mod logger;
pub mod objects;
pub mod scheduler;
pub mod workers;

#[cfg(test)]
mod state_machine_tests;

//! Timed-event scheduling: the binary-heap timer queue and the event
//! vocabulary the engine dispatches on.

pub mod queue;

pub use queue::{EventHandle, TimerQueue};

use crate::objects::{HostId, ServiceId};

/// What a queued timer means when it fires.
///
/// A closed enum instead of callback pointers: the engine owns all event
/// semantics, and tests can pattern-match scheduled work directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    /// Scheduled active check of a host.
    HostCheck(HostId),
    /// Scheduled active check of a service.
    ServiceCheck(ServiceId),
    /// Recurring host freshness sweep.
    HostFreshnessSweep,
    /// Recurring service freshness sweep.
    ServiceFreshnessSweep,
    /// Recurring orphaned-check sweep (hosts and services).
    OrphanSweep,
}

/// How an event left the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// The event's fire time elapsed; `latency_s` is how far past the
    /// scheduled time dispatch actually happened.
    Timed {
        /// Seconds between scheduled fire time and actual dispatch.
        latency_s: f64,
    },
    /// The event was removed before firing (rescheduling or shutdown).
    Aborted,
}

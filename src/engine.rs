//! The engine: single owner of the object arena, the timer queue, the worker
//! pools, and the check state machines.
//!
//! Everything here runs on one control thread. Worker reader threads and
//! external submitters only hand messages over channels; they never touch
//! engine state.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::broker::{EventBroker, EngineHooks, NoopBroker, NoopHooks};
use crate::checks::{CheckOptions, CheckResult, CheckTarget};
use crate::config::EngineConfig;
use crate::core::UnixTs;
use crate::core::errors::{FmError, Result};
use crate::core::ids::IdSequence;
use crate::logger::EventLog;
use crate::objects::{HostId, ObjectArena, ServiceId};
use crate::scheduler::{Disposition, EventHandle, EventPayload, TimerQueue};
use crate::workers::protocol::{JobReply, Registration, kind, key};
use crate::workers::{JobCallback, WorkerEvent, WorkerPools};

enum Clock {
    System,
    Fixed(UnixTs),
}

/// The monitoring engine.
pub struct Engine {
    /// Global configuration.
    pub config: EngineConfig,
    /// Monitored objects.
    pub objects: ObjectArena,
    /// Timed-event queue.
    pub queue: TimerQueue<EventPayload>,
    /// Check execution pools.
    pub workers: WorkerPools,
    /// Observation/veto seam.
    pub broker: Box<dyn EventBroker>,
    /// Notification/downtime/status seam.
    pub hooks: Box<dyn EngineHooks>,
    /// JSONL event log.
    pub event_log: EventLog,
    pub(crate) event_ids: IdSequence,
    pub(crate) problem_ids: IdSequence,
    pub(crate) running_host_checks: u32,
    pub(crate) running_service_checks: u32,
    pub(crate) program_start: UnixTs,
    clock: Clock,
}

impl Engine {
    /// Build an engine. The event log opens lazily from the config path;
    /// broker and hooks default to no-ops.
    pub fn new(config: EngineConfig, objects: ObjectArena, workers: WorkerPools) -> Result<Self> {
        let event_log = match &config.event_log_path {
            Some(path) => EventLog::open(path)?,
            None => EventLog::disabled(),
        };
        let mut engine = Self {
            config,
            objects,
            queue: TimerQueue::new(),
            workers,
            broker: Box::new(NoopBroker),
            hooks: Box::new(NoopHooks),
            event_log,
            event_ids: IdSequence::new(),
            problem_ids: IdSequence::new(),
            running_host_checks: 0,
            running_service_checks: 0,
            program_start: 0,
            clock: Clock::System,
        };
        engine.program_start = engine.now();
        Ok(engine)
    }

    /// Current wall-clock time in epoch seconds.
    #[must_use]
    pub fn now(&self) -> UnixTs {
        match self.clock {
            Clock::System => chrono::Utc::now().timestamp(),
            Clock::Fixed(t) => t,
        }
    }

    /// Pin the wall clock for deterministic scenarios.
    pub fn set_fixed_time(&mut self, t: UnixTs) {
        self.clock = Clock::Fixed(t);
    }

    /// Advance a pinned clock; no-op on the system clock.
    pub fn advance_time(&mut self, secs: i64) {
        if let Clock::Fixed(t) = self.clock {
            self.clock = Clock::Fixed(t + secs);
        }
    }

    /// Schedule `payload` to fire `delay_s` seconds from now.
    pub(crate) fn schedule_in(&mut self, delay_s: u64, payload: EventPayload) -> EventHandle {
        self.queue
            .schedule_at(Instant::now() + Duration::from_secs(delay_s), payload)
    }

    /// Remove a queued event and fire it with the Aborted disposition.
    pub(crate) fn abort_event(&mut self, handle: EventHandle) {
        if let Some(payload) = self.queue.remove(handle) {
            self.dispatch_event(payload, Disposition::Aborted);
        }
    }

    /// Fire one event.
    pub fn dispatch_event(&mut self, payload: EventPayload, disposition: Disposition) {
        match payload {
            EventPayload::HostCheck(id) => self.handle_host_check_event(id, disposition),
            EventPayload::ServiceCheck(id) => self.handle_service_check_event(id, disposition),
            EventPayload::HostFreshnessSweep => {
                if matches!(disposition, Disposition::Timed { .. }) {
                    self.check_host_freshness();
                    let interval = self.config.host_freshness_check_interval_s;
                    self.schedule_in(interval, EventPayload::HostFreshnessSweep);
                }
            }
            EventPayload::ServiceFreshnessSweep => {
                if matches!(disposition, Disposition::Timed { .. }) {
                    self.check_service_freshness();
                    let interval = self.config.service_freshness_check_interval_s;
                    self.schedule_in(interval, EventPayload::ServiceFreshnessSweep);
                }
            }
            EventPayload::OrphanSweep => {
                if matches!(disposition, Disposition::Timed { .. }) {
                    if self.config.check_orphaned_hosts {
                        self.check_orphaned_hosts();
                    }
                    if self.config.check_orphaned_services {
                        self.check_orphaned_services();
                    }
                    let interval = self.config.orphan_check_interval_s;
                    self.schedule_in(interval, EventPayload::OrphanSweep);
                }
            }
        }
    }

    /// Spread first checks across one check interval and start the recurring
    /// sweeps.
    pub fn init_scheduling(&mut self) {
        let mut rng = rand::rng();

        for i in 0..self.objects.hosts.len() {
            let id = HostId(u32::try_from(i).unwrap_or(u32::MAX));
            let (schedulable, interval) = {
                let h = self.objects.host(id);
                (
                    h.checks_enabled && h.check_command.is_some() && h.check_interval_s > 0,
                    h.check_interval_s,
                )
            };
            if schedulable {
                let delay = rng.random_range(0..interval.max(1));
                #[allow(clippy::cast_possible_wrap)]
                self.schedule_next_host_check(id, delay as i64, CheckOptions::NONE);
            }
        }
        for i in 0..self.objects.services.len() {
            let id = ServiceId(u32::try_from(i).unwrap_or(u32::MAX));
            let (schedulable, interval) = {
                let s = self.objects.service(id);
                (
                    s.checks_enabled && s.check_command.is_some() && s.check_interval_s > 0,
                    s.check_interval_s,
                )
            };
            if schedulable {
                let delay = rng.random_range(0..interval.max(1));
                #[allow(clippy::cast_possible_wrap)]
                self.schedule_next_service_check(id, delay as i64, CheckOptions::NONE);
            }
        }

        if self.config.check_host_freshness {
            let interval = self.config.host_freshness_check_interval_s;
            self.schedule_in(interval, EventPayload::HostFreshnessSweep);
        }
        if self.config.check_service_freshness {
            let interval = self.config.service_freshness_check_interval_s;
            self.schedule_in(interval, EventPayload::ServiceFreshnessSweep);
        }
        if self.config.check_orphaned_hosts || self.config.check_orphaned_services {
            let interval = self.config.orphan_check_interval_s;
            self.schedule_in(interval, EventPayload::OrphanSweep);
        }
        tracing::info!(
            hosts = self.objects.hosts.len(),
            services = self.objects.services.len(),
            queued = self.queue.len(),
            "initial scheduling complete"
        );
    }

    /// Handle one message from the worker reader threads.
    pub fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Frame { worker, frame } => {
                if frame.get(key::KIND) == Some(kind::REGISTER) {
                    match Registration::from_frame(&frame) {
                        Ok(reg) => self.workers.apply_registration(worker, &reg),
                        Err(e) => tracing::warn!(error = %e, "bad registration frame"),
                    }
                    return;
                }
                let reply = match JobReply::from_frame(&frame) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed worker frame dropped");
                        return;
                    }
                };
                let Some(job) = self.workers.take_job(worker, reply.job_id) else {
                    tracing::warn!(job_id = reply.job_id, "reply for unknown job dropped");
                    return;
                };
                match job.callback {
                    JobCallback::Host { host, result } => {
                        let cr = merge_reply(result, &reply);
                        if let Err(e) = self.handle_async_host_check_result(host, cr) {
                            tracing::warn!(error = %e, "host result processing failed");
                        }
                    }
                    JobCallback::Service { service, result } => {
                        let cr = merge_reply(result, &reply);
                        if let Err(e) = self.handle_async_service_check_result(service, cr) {
                            tracing::warn!(error = %e, "service result processing failed");
                        }
                    }
                }
            }
            WorkerEvent::Disconnected { worker } => {
                let orphaned = self.workers.handle_disconnect(worker);
                for job in orphaned {
                    if let Err(e) = self
                        .workers
                        .run_job(&job.command, job.timeout_s, job.callback)
                    {
                        // The orphan sweep recovers the object later.
                        tracing::warn!(error = %e, command = %job.command, "job resubmission failed");
                    }
                }
            }
        }
    }

    /// Route a finished check result into the right state machine.
    pub fn process_check_result(&mut self, target: CheckTarget, result: CheckResult) -> Result<()> {
        match target {
            CheckTarget::Host(id) => self.handle_async_host_check_result(id, result),
            CheckTarget::Service(id) => self.handle_async_service_check_result(id, result),
        }
    }

    /// Ingest an externally submitted host result.
    pub fn process_passive_host_result(
        &mut self,
        host_name: &str,
        return_code: i32,
        output: &str,
        timestamp: UnixTs,
    ) -> Result<()> {
        let id = self
            .objects
            .host_by_name(host_name)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "host",
                name: host_name.to_string(),
            })?;
        self.handle_async_host_check_result(id, CheckResult::passive(return_code, output, timestamp))
    }

    /// Ingest an externally submitted service result.
    pub fn process_passive_service_result(
        &mut self,
        host_name: &str,
        description: &str,
        return_code: i32,
        output: &str,
        timestamp: UnixTs,
    ) -> Result<()> {
        let id = self
            .objects
            .service_by_name(host_name, description)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "service",
                name: format!("{host_name}/{description}"),
            })?;
        self.handle_async_service_check_result(
            id,
            CheckResult::passive(return_code, output, timestamp),
        )
    }

    /// Drain the queue with Aborted dispositions and tear down the workers.
    pub fn shutdown(&mut self) {
        let mut remaining = Vec::new();
        self.queue.drain_all(|payload| remaining.push(payload));
        for payload in remaining {
            self.dispatch_event(payload, Disposition::Aborted);
        }
        self.workers.shutdown();
        tracing::info!("engine shut down");
    }
}

/// Fold a worker reply into the partially filled result carried by the job.
fn merge_reply(mut cr: CheckResult, reply: &JobReply) -> CheckResult {
    #[allow(clippy::cast_possible_truncation)]
    {
        cr.start_time = reply.start as UnixTs;
        cr.finish_time = reply.stop as UnixTs;
    }
    cr.early_timeout = reply.early_timeout;
    cr.exited_ok = reply.exited_ok && reply.error_msg.is_none();
    cr.return_code = reply.exit_code;
    cr.output = if !reply.outstd.is_empty() {
        reply.outstd.clone()
    } else if !reply.outerr.is_empty() {
        format!("(No output on stdout) stderr: {}", reply.outerr)
    } else if let Some(msg) = &reply.error_msg {
        format!("(Worker error: {msg})")
    } else {
        String::new()
    };
    cr
}

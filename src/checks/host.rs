//! Host check scheduling and the host state machine.
//!
//! Hosts differ from services in two ways that shape everything here: a
//! failed host drags its children into question (reachability), and a host
//! problem propagates immediate checks through the parent/child graph so the
//! DOWN-versus-UNREACHABLE verdict settles before anyone is notified.

use crate::broker::{BrokerVerdict, CheckPhase, NotificationReason, StateChangeEvent};
use crate::checks::{self, flapping, CheckOptions, CheckResult, CheckType};
use crate::core::errors::{FmError, Result};
use crate::core::UnixTs;
use crate::engine::Engine;
use crate::logger::LogRecord;
use crate::objects::command::{expand_macros, split_check_reference, MacroContext};
use crate::objects::{Acknowledgement, DependencyKind, HostId, HostState, StateType};
use crate::scheduler::{Disposition, EventPayload};
use crate::workers::JobCallback;

/// Slack added to the orphan window on top of timeout and reaper cadence.
pub(crate) const ORPHAN_SLACK_S: i64 = 600;

const fn host_state_code(state: HostState) -> u8 {
    match state {
        HostState::Up => 0,
        HostState::Down => 1,
        HostState::Unreachable => 2,
    }
}

fn not_viable(object: &str, reason: &str) -> FmError {
    FmError::CheckNotViable {
        object: object.to_string(),
        reason: reason.to_string(),
    }
}

impl Engine {
    /// Schedule the next active check of a host `delay_s` seconds from now.
    ///
    /// An already-queued check that would fire sooner wins unless the new
    /// request is forced; otherwise the old event is destroyed and replaced.
    pub fn schedule_next_host_check(&mut self, id: HostId, delay_s: i64, options: CheckOptions) {
        let now = self.now();
        let proposed = now + delay_s.max(0);

        {
            let rt = &self.objects.host(id).rt;
            if rt.next_check_event.is_some()
                && rt.next_check < proposed
                && !options.contains(CheckOptions::FORCE_EXECUTION)
            {
                return;
            }
        }

        if let Some(handle) = self.objects.host_mut(id).rt.next_check_event.take() {
            self.queue.remove(handle);
        }

        let delay = u64::try_from(delay_s).unwrap_or(0);
        let handle = self.schedule_in(delay, EventPayload::HostCheck(id));
        let host = self.objects.host_mut(id);
        host.rt.check_options = options;
        host.rt.next_check = proposed;
        host.rt.next_check_event = Some(handle);
        self.hooks.update_host_status(self.objects.host(id));
    }

    /// React to a host check timer leaving the queue.
    pub(crate) fn handle_host_check_event(&mut self, id: HostId, disposition: Disposition) {
        let Disposition::Timed { latency_s } = disposition else {
            self.objects.host_mut(id).rt.next_check_event = None;
            return;
        };

        let (options, check_interval, retry_interval) = {
            let host = self.objects.host_mut(id);
            host.rt.next_check_event = None;
            let options = host.rt.check_options;
            host.rt.check_options = CheckOptions::NONE;
            (options, host.check_interval_s, host.retry_interval_s)
        };

        // Keep the cadence alive before anything can go wrong: if this run
        // never starts, the host must not fall off the schedule.
        if check_interval != 0 {
            self.schedule_next_host_check(
                id,
                i64::try_from(check_interval).unwrap_or(i64::MAX),
                CheckOptions::NONE,
            );
        }

        if !options.contains(CheckOptions::FORCE_EXECUTION) && !self.config.execute_host_checks {
            return;
        }

        if let Err(e) = self.run_async_host_check(id, options, latency_s) {
            tracing::debug!(
                host = %self.objects.host(id).name,
                error = %e,
                "host check did not start"
            );
            if retry_interval != 0 {
                self.schedule_next_host_check(
                    id,
                    i64::try_from(retry_interval).unwrap_or(i64::MAX),
                    CheckOptions::NONE,
                );
            }
        }
    }

    /// Start an asynchronous host check, or fail with the reason it cannot
    /// run. A forced check skips every viability gate.
    pub fn run_async_host_check(
        &mut self,
        id: HostId,
        options: CheckOptions,
        latency: f64,
    ) -> Result<()> {
        let now = self.now();

        if !options.contains(CheckOptions::FORCE_EXECUTION) {
            let host = self.objects.host(id);
            if host.rt.is_executing {
                return Err(not_viable(&host.name, "a check is already in flight"));
            }
            let horizon = i64::try_from(self.config.cached_host_check_horizon_s).unwrap_or(0);
            if host.rt.last_check <= now && host.rt.last_check + horizon > now {
                return Err(not_viable(
                    &host.name,
                    "a recent result is inside the cached-check horizon",
                ));
            }
            if !host.checks_enabled {
                return Err(not_viable(&host.name, "active checks are disabled"));
            }
            if !self.objects.period_allows(host.check_period, now) {
                return Err(not_viable(&host.name, "outside the check period"));
            }
            if !self.host_dependencies_ok(id, DependencyKind::Execution) {
                return Err(not_viable(&host.name, "an execution dependency failed"));
            }
        }

        match self.broker.host_check(CheckPhase::Precheck, self.objects.host(id)) {
            BrokerVerdict::Continue => {}
            BrokerVerdict::Cancel => {
                return Err(not_viable(
                    &self.objects.host(id).name,
                    "vetoed by the broker",
                ));
            }
            BrokerVerdict::Override {
                return_code,
                output,
            } => {
                let mut cr = CheckResult::new(CheckType::Active, options);
                cr.scheduled = true;
                cr.latency = latency;
                cr.start_time = now;
                cr.finish_time = now;
                cr.return_code = return_code;
                cr.output = output;
                return self.handle_async_host_check_result(id, cr);
            }
        }

        // The attempt number belongs to the check being started, not to the
        // result that comes back.
        self.adjust_host_check_attempt(id, true);

        let Some(reference) = self.objects.host(id).check_command.clone() else {
            // Passive-only host hit by a forced check: short-circuit a
            // synthetic result so the caller still sees a state update.
            let mut cr = CheckResult::new(CheckType::Active, options);
            cr.scheduled = true;
            cr.latency = latency;
            cr.start_time = now;
            cr.finish_time = now;
            return self.handle_async_host_check_result(id, cr);
        };

        let (cmd_name, args) = split_check_reference(&reference);
        let command_line = {
            let command =
                self.objects
                    .command_by_name(cmd_name)
                    .ok_or_else(|| FmError::UnknownObject {
                        kind: "command",
                        name: cmd_name.to_string(),
                    })?;
            let host = self.objects.host(id);
            let ctx = MacroContext {
                host_name: &host.name,
                host_address: &host.address,
                service_description: None,
                args: &args,
                custom: &host.custom_vars,
            };
            expand_macros(&command.line, &ctx)?
        };

        {
            let host = self.objects.host_mut(id);
            host.rt.is_executing = true;
            host.rt.latency = latency;
        }
        self.running_host_checks += 1;

        match self.broker.host_check(CheckPhase::Initiate, self.objects.host(id)) {
            BrokerVerdict::Continue => {}
            BrokerVerdict::Cancel => {
                self.objects.host_mut(id).rt.is_executing = false;
                self.running_host_checks = self.running_host_checks.saturating_sub(1);
                return Err(not_viable(
                    &self.objects.host(id).name,
                    "vetoed by the broker at initiation",
                ));
            }
            BrokerVerdict::Override {
                return_code,
                output,
            } => {
                self.objects.host_mut(id).rt.is_executing = false;
                self.running_host_checks = self.running_host_checks.saturating_sub(1);
                let mut cr = CheckResult::new(CheckType::Active, options);
                cr.scheduled = true;
                cr.latency = latency;
                cr.start_time = now;
                cr.finish_time = now;
                cr.return_code = return_code;
                cr.output = output;
                return self.handle_async_host_check_result(id, cr);
            }
        }

        let mut cr = CheckResult::new(CheckType::Active, options);
        cr.scheduled = true;
        cr.latency = latency;
        cr.start_time = now;

        let dispatched = self.workers.run_job(
            &command_line,
            self.config.host_check_timeout_s,
            JobCallback::Host { host: id, result: cr },
        );
        if let Err(e) = dispatched {
            let host = self.objects.host_mut(id);
            host.rt.is_executing = false;
            self.running_host_checks = self.running_host_checks.saturating_sub(1);
            return Err(e);
        }
        Ok(())
    }

    /// Ingest a finished host check result, active or passive, and drive the
    /// state machine with it.
    pub fn handle_async_host_check_result(&mut self, id: HostId, cr: CheckResult) -> Result<()> {
        let now = self.now();
        let active = cr.check_type == CheckType::Active;

        if active {
            self.running_host_checks = self.running_host_checks.saturating_sub(1);
        } else {
            let host = self.objects.host(id);
            if !self.config.accept_passive_host_checks {
                return Err(not_viable(
                    &host.name,
                    "passive host results are disabled globally",
                ));
            }
            if !host.accept_passive_checks {
                return Err(not_viable(
                    &host.name,
                    "this host does not accept passive results",
                ));
            }
        }

        if cr.options.contains(CheckOptions::FRESHNESS_CHECK) {
            self.objects.host_mut(id).rt.is_being_freshened = false;
            // Another result may have landed while the forced re-check was in
            // flight; a fresh host discards the late answer.
            if self.is_host_result_fresh(id, now, false) {
                self.objects.host_mut(id).rt.is_executing = false;
                return Ok(());
            }
        }

        {
            let host = self.objects.host_mut(id);
            host.rt.check_type = cr.check_type;
            host.rt.latency = cr.latency;
            #[allow(clippy::cast_precision_loss)]
            {
                host.rt.execution_time = ((cr.finish_time - cr.start_time) as f64).max(0.0);
            }
            host.rt.has_been_checked = true;
            if active {
                host.rt.is_executing = false;
            }
            host.rt.last_check = cr.start_time;

            host.last_state = host.current_state;
            if host.rt.state_type == StateType::Hard {
                host.last_hard_state = host.current_state;
            }
        }

        let mut parsed = checks::parse_check_output(&cr.output);
        if parsed.short.is_empty() {
            parsed.short = "(No output returned from host check)".to_string();
        }

        let mut rc = cr.return_code;
        if active {
            let host = self.objects.host(id);
            if host.check_command.is_none() {
                parsed.short = "(Host assumed to be UP)".to_string();
                parsed.long.clear();
                parsed.perf.clear();
                rc = 0;
            } else if cr.early_timeout {
                parsed.short = format!(
                    "(Host check timed out after {:.2} seconds)",
                    host.rt.execution_time
                );
                parsed.long.clear();
                parsed.perf.clear();
                rc = 3;
            } else if !cr.exited_ok {
                parsed.short = "(Host check did not exit properly)".to_string();
                parsed.long.clear();
                parsed.perf.clear();
                rc = 2;
            } else if !(0..=3).contains(&rc) {
                parsed.short = format!("(Return code of {rc} is out of bounds)");
                parsed.long.clear();
                parsed.perf.clear();
                rc = 2;
            }
        }

        {
            let host = self.objects.host_mut(id);
            host.rt.plugin_output = parsed.short;
            host.rt.long_plugin_output = parsed.long;
            host.rt.perf_data = parsed.perf;
        }

        let new_state = if active {
            // Host plugins follow service conventions; a WARNING still means
            // the host answered, unless aggressive checking is on.
            if rc == 1 && !self.config.use_aggressive_host_checking {
                rc = 0;
            }
            if rc == 0 {
                HostState::Up
            } else {
                HostState::Down
            }
        } else {
            // Passive submitters report the final host state directly.
            match rc {
                0 => HostState::Up,
                2 => HostState::Unreachable,
                _ => HostState::Down,
            }
        };

        self.process_host_check_result(id, new_state);

        let _ = self
            .broker
            .host_check(CheckPhase::Processed, self.objects.host(id));
        Ok(())
    }

    /// Apply a classified result to the host's soft/hard machine, propagate
    /// checks through the topology, and schedule the retry cadence.
    fn process_host_check_result(&mut self, id: HostId, new_state: HostState) {
        let passive_soft = self.config.passive_host_checks_are_soft;
        let is_passive = self.objects.host(id).rt.check_type == CheckType::Passive;

        // Active checks bump their attempt before dispatch; passive results
        // entering the soft/hard machine bump it here.
        if is_passive && passive_soft {
            self.adjust_host_check_attempt(id, false);
        }

        if is_passive && self.config.log_passive_checks {
            let host = self.objects.host(id);
            let rec = LogRecord::now(
                "PASSIVE HOST CHECK",
                &host.name,
                new_state.as_str(),
                &host.rt.plugin_output,
            );
            self.event_log.write(&rec);
        }

        let was_up = self.objects.host(id).current_state == HostState::Up;
        let mut propagate: Vec<HostId> = Vec::new();
        let mut predictive: Vec<HostId> = Vec::new();

        if was_up {
            if new_state == HostState::Up {
                // Steady state.
                let host = self.objects.host_mut(id);
                host.current_state = HostState::Up;
                host.rt.state_type = StateType::Hard;
            } else {
                // Fresh problem.
                {
                    let host = self.objects.host_mut(id);
                    if !is_passive || passive_soft {
                        host.rt.state_type = StateType::Soft;
                    } else {
                        host.rt.state_type = StateType::Hard;
                        host.rt.current_attempt = 1;
                    }
                    host.current_state = new_state;
                }
                if !is_passive {
                    let reach = self.determine_host_reachability(id);
                    self.objects.host_mut(id).current_state = reach;
                }

                // A parent may have gone down and blocked the route; checking
                // parents now lets the DOWN/UNREACHABLE verdict settle early.
                // Children get checked because this host may now be blocking
                // their route.
                let host = self.objects.host(id);
                for &p in &host.parents {
                    if self.objects.host(p).current_state == HostState::Up {
                        propagate.push(p);
                    }
                }
                for &c in &host.children {
                    if self.objects.host(c).current_state != HostState::Unreachable {
                        propagate.push(c);
                    }
                }

                // One attempt before the problem goes hard, probe dependency
                // masters so the dependency verdicts are current when it
                // matters.
                if self.config.enable_predictive_host_dependency_checks
                    && host.rt.current_attempt + 1 == host.max_attempts
                {
                    for &di in host.exec_deps.iter().chain(host.notify_deps.iter()) {
                        predictive.push(self.objects.host_deps[di].master);
                    }
                }
            }
        } else if new_state == HostState::Up {
            // Recovery.
            {
                let host = self.objects.host_mut(id);
                host.current_state = HostState::Up;
                host.rt.state_type = if host.rt.state_type == StateType::Hard
                    || (is_passive && !passive_soft)
                {
                    StateType::Hard
                } else {
                    StateType::Soft
                };
            }
            // A recovery often means a parent recovered too, and children
            // stuck in UNREACHABLE may now resolve to UP or DOWN.
            let host = self.objects.host(id);
            for &n in host.parents.iter().chain(host.children.iter()) {
                if self.objects.host(n).current_state != HostState::Up {
                    propagate.push(n);
                }
            }
        } else {
            // Still a problem.
            {
                let host = self.objects.host_mut(id);
                if is_passive && !passive_soft {
                    host.rt.state_type = StateType::Hard;
                    host.rt.current_attempt = 1;
                } else if host.rt.current_attempt == host.max_attempts
                    || host.rt.current_attempt == 1
                {
                    // Maxed out on retries, or the problem was already hard
                    // before this result.
                    host.rt.state_type = StateType::Hard;
                } else {
                    host.rt.state_type = StateType::Soft;
                }
                host.current_state = new_state;
            }
            if !is_passive {
                let reach = self.determine_host_reachability(id);
                self.objects.host_mut(id).current_state = reach;
            }
        }

        for target in propagate {
            self.schedule_next_host_check(target, 0, CheckOptions::NONE);
        }
        for master in predictive {
            self.schedule_next_host_check(master, 0, CheckOptions::DEPENDENCY_CHECK);
        }

        self.handle_host_state(id);
        self.check_host_flapping(id);

        // A soft problem keeps re-checking on the retry cadence.
        let (soft_problem, retry) = {
            let host = self.objects.host(id);
            (
                host.current_state.is_problem() && host.rt.state_type == StateType::Soft,
                host.retry_interval_s,
            )
        };
        if soft_problem && retry != 0 {
            self.schedule_next_host_check(
                id,
                i64::try_from(retry).unwrap_or(i64::MAX),
                CheckOptions::NONE,
            );
        }

        self.hooks.update_host_status(self.objects.host(id));
    }

    /// Move the attempt counter for a check that is about to run (active) or
    /// a passive result entering the soft/hard machine.
    fn adjust_host_check_attempt(&mut self, id: HostId, is_active: bool) {
        let host = self.objects.host_mut(id);
        if host.rt.state_type == StateType::Hard {
            host.rt.current_attempt = 1;
        } else if is_active && host.current_state == HostState::Up {
            // Soft recovery in progress; the next check starts a new count.
            host.rt.current_attempt = 1;
        } else if host.rt.current_attempt < host.max_attempts {
            host.rt.current_attempt += 1;
        }
    }

    /// Record state-change bookkeeping, alerts, and notification triggers
    /// after the current/last states have been settled.
    fn handle_host_state(&mut self, id: HostId) {
        let now = self.now();

        {
            let host = self.objects.host_mut(id);
            match host.last_state {
                HostState::Up => host.last_time_up = now,
                HostState::Down => host.last_time_down = now,
                HostState::Unreachable => host.last_time_unreachable = now,
            }
        }

        let (state_change, mut hard_state_change) = {
            let host = self.objects.host(id);
            (
                host.last_state != host.current_state
                    || (host.current_state == HostState::Up
                        && host.rt.state_type == StateType::Soft),
                host.rt.current_attempt >= host.max_attempts
                    && host.last_hard_state != host.current_state,
            )
        };

        if state_change || hard_state_change {
            let host = self.objects.host_mut(id);
            host.rt.no_more_notifications = false;
            let clear_ack = match host.rt.acknowledgement {
                Acknowledgement::Normal => state_change || !hard_state_change,
                Acknowledgement::Sticky => host.current_state == HostState::Up,
                Acknowledgement::None => false,
            };
            if clear_ack {
                host.rt.acknowledgement = Acknowledgement::None;
            }
        }

        // A hard-state mismatch counts as a hard change even when the attempt
        // counter has not maxed out (passive hard results, policy resets).
        {
            let host = self.objects.host(id);
            if host.last_hard_state != host.current_state {
                hard_state_change = true;
            }
        }

        if state_change || hard_state_change {
            {
                let event_id = self.event_ids.next_id();
                let host = self.objects.host_mut(id);
                host.rt.last_state_change = now;
                if host.rt.state_type == StateType::Hard {
                    host.rt.last_hard_state_change = now;
                }
                host.rt.last_event_id = host.rt.current_event_id;
                host.rt.current_event_id = event_id;
            }
            if self.objects.host(id).last_state == HostState::Up {
                let problem_id = self.problem_ids.next_id();
                self.objects.host_mut(id).rt.current_problem_id = problem_id;
            }
            if self.objects.host(id).current_state == HostState::Up {
                let host = self.objects.host_mut(id);
                host.rt.last_problem_id = host.rt.current_problem_id;
                host.rt.current_problem_id = 0;
            }

            self.log_host_alert(id);

            {
                let host = self.objects.host(id);
                let event = StateChangeEvent {
                    host: &host.name,
                    service: None,
                    old_state: host_state_code(host.last_state),
                    new_state: host_state_code(host.current_state),
                    state_type: host.rt.state_type,
                    attempt: host.rt.current_attempt,
                };
                self.broker.state_change(&event);
            }

            // Flexible downtimes may start on soft states.
            self.hooks.pending_flex_host_downtime(self.objects.host(id));

            if self.objects.host(id).rt.state_type == StateType::Hard {
                self.hooks
                    .notify_host(self.objects.host(id), NotificationReason::Normal);
                self.objects.host_mut(id).rt.current_notification_number += 1;
            }

            if self.objects.host(id).current_state == HostState::Up {
                let host = self.objects.host_mut(id);
                host.rt.current_attempt = 1;
                host.rt.current_notification_number = 0;
            }
        } else {
            let (hard_problem, soft) = {
                let host = self.objects.host(id);
                (
                    host.current_state.is_problem() && host.rt.state_type == StateType::Hard,
                    host.rt.state_type == StateType::Soft,
                )
            };
            if hard_problem {
                self.hooks
                    .notify_host(self.objects.host(id), NotificationReason::Normal);
                self.objects.host_mut(id).rt.current_notification_number += 1;
            }
            if soft {
                // Soft retries are logged so a problem's whole confirmation
                // arc is visible.
                self.log_host_alert(id);
            }
        }
    }

    fn log_host_alert(&mut self, id: HostId) {
        let host = &self.objects.hosts[id.index()];
        let mut rec = LogRecord::now(
            "HOST ALERT",
            &host.name,
            host.current_state.as_str(),
            &host.rt.plugin_output,
        );
        rec.state_type = Some(host.rt.state_type.as_str());
        rec.attempt = Some(host.rt.current_attempt);
        self.event_log.write(&rec);
    }

    /// Whether every dependency of `kind` lets this host proceed.
    #[must_use]
    pub fn host_dependencies_ok(&self, id: HostId, kind: DependencyKind) -> bool {
        let now = self.now();
        let host = self.objects.host(id);
        let deps = match kind {
            DependencyKind::Execution => &host.exec_deps,
            DependencyKind::Notification => &host.notify_deps,
        };
        for &di in deps {
            let dep = &self.objects.host_deps[di];
            // Outside its window a dependency never fails anything.
            if !self.objects.period_allows(dep.period, now) {
                continue;
            }
            let master = self.objects.host(dep.master);
            if !master.rt.has_been_checked && dep.failure_mask.matches_pending() {
                return false;
            }
            let state = if master.rt.state_type == StateType::Soft
                && !self.config.soft_state_dependencies
            {
                master.last_hard_state
            } else {
                master.current_state
            };
            if dep.failure_mask.matches_host(state) {
                return false;
            }
            if dep.inherits_parent && !self.host_dependencies_ok(dep.master, kind) {
                return false;
            }
        }
        true
    }

    /// Tell DOWN and UNREACHABLE apart: a failed host with at least one UP
    /// parent (or no parents at all) is DOWN; with every parent failed it is
    /// UNREACHABLE.
    #[must_use]
    pub fn determine_host_reachability(&self, id: HostId) -> HostState {
        let host = self.objects.host(id);
        if host.current_state == HostState::Up {
            return HostState::Up;
        }
        if host.parents.is_empty() {
            return HostState::Down;
        }
        if host
            .parents
            .iter()
            .any(|&p| self.objects.host(p).current_state == HostState::Up)
        {
            return HostState::Down;
        }
        HostState::Unreachable
    }

    /// Recurring sweep: force a re-check of every host whose last result has
    /// gone stale.
    pub(crate) fn check_host_freshness(&mut self) {
        let now = self.now();
        let mut stale: Vec<HostId> = Vec::new();

        for i in 0..self.objects.hosts.len() {
            let id = HostId(u32::try_from(i).unwrap_or(u32::MAX));
            let host = self.objects.host(id);
            if !host.check_freshness {
                continue;
            }
            if !host.checks_enabled && !host.accept_passive_checks {
                continue;
            }
            // In-flight checks are the orphan sweep's problem, and a host
            // already being freshened must not queue a second forced check.
            if host.rt.is_executing || host.rt.is_being_freshened {
                continue;
            }
            if !self.objects.period_allows(host.check_period, now) {
                continue;
            }
            if !self.is_host_result_fresh(id, now, true) {
                stale.push(id);
            }
        }

        for id in stale {
            self.objects.host_mut(id).rt.is_being_freshened = true;
            self.schedule_next_host_check(
                id,
                0,
                CheckOptions::FORCE_EXECUTION | CheckOptions::FRESHNESS_CHECK,
            );
        }
    }

    /// Whether the host's last result is recent enough. With no explicit
    /// threshold one is derived from the current check cadence plus latency
    /// and configured slack.
    #[must_use]
    pub fn is_host_result_fresh(&self, id: HostId, current_time: UnixTs, log_stale: bool) -> bool {
        let host = self.objects.host(id);

        #[allow(clippy::cast_possible_truncation)]
        let threshold: i64 = if host.freshness_threshold_s == 0 {
            let interval = if host.rt.state_type == StateType::Hard
                || host.current_state == HostState::Up
            {
                host.check_interval_s
            } else {
                host.retry_interval_s
            };
            i64::try_from(interval + self.config.additional_freshness_latency_s)
                .unwrap_or(i64::MAX)
                .saturating_add(host.rt.latency as i64)
        } else {
            i64::try_from(host.freshness_threshold_s).unwrap_or(i64::MAX)
        };

        let expiration = if !host.rt.has_been_checked {
            // Nothing has ever come in; the clock starts at engine start.
            self.program_start.saturating_add(threshold)
        } else if host.checks_enabled
            && self.program_start > host.rt.last_check
            && host.freshness_threshold_s == 0
        {
            // Give actively checked hosts a full derived threshold after a
            // start instead of declaring pre-start results stale at once.
            self.program_start.saturating_add(threshold)
        } else {
            host.rt.last_check.saturating_add(threshold)
        };

        if expiration < current_time {
            if log_stale {
                tracing::warn!(
                    host = %host.name,
                    stale_s = current_time - expiration,
                    threshold_s = threshold,
                    "host check results are stale; forcing an immediate check"
                );
            }
            return false;
        }
        true
    }

    /// Recurring sweep: recover hosts whose in-flight check never reported
    /// back (dead worker, lost reply).
    pub(crate) fn check_orphaned_hosts(&mut self) {
        let now = self.now();
        let window = i64::try_from(
            self.config.host_check_timeout_s + self.config.check_reaper_interval_s,
        )
        .unwrap_or(i64::MAX)
        .saturating_add(ORPHAN_SLACK_S);

        let mut orphaned: Vec<HostId> = Vec::new();
        for i in 0..self.objects.hosts.len() {
            let id = HostId(u32::try_from(i).unwrap_or(u32::MAX));
            let host = self.objects.host(id);
            // On-demand checks without a schedule are not covered.
            if host.rt.next_check == 0 || !host.rt.is_executing {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let expected = host
                .rt
                .next_check
                .saturating_add(host.rt.latency as i64)
                .saturating_add(window);
            if expected < now {
                orphaned.push(id);
            }
        }

        for id in orphaned {
            tracing::warn!(
                host = %self.objects.host(id).name,
                "host check looks orphaned; scheduling an immediate re-check"
            );
            self.running_host_checks = self.running_host_checks.saturating_sub(1);
            self.objects.host_mut(id).rt.is_executing = false;
            self.schedule_next_host_check(id, 0, CheckOptions::ORPHAN_CHECK);
        }
    }

    /// Sample the current state into the flap window and flip the flapping
    /// flag across the hysteresis thresholds.
    pub(crate) fn check_host_flapping(&mut self, id: HostId) {
        {
            let host = self.objects.host_mut(id);
            let code = host_state_code(host.current_state);
            host.rt.flap.record(code);
        }
        if !self.config.enable_flap_detection || !self.objects.host(id).flap_detection_enabled {
            return;
        }

        let (pct, was_flapping) = {
            let host = self.objects.host(id);
            (host.rt.flap.percent_state_change(), host.rt.is_flapping)
        };
        let now_flapping = flapping::evaluate(
            pct,
            was_flapping,
            self.config.low_flap_threshold_pct,
            self.config.high_flap_threshold_pct,
        );
        if now_flapping == was_flapping {
            return;
        }

        self.objects.host_mut(id).rt.is_flapping = now_flapping;
        let host = &self.objects.hosts[id.index()];
        tracing::info!(host = %host.name, pct, flapping = now_flapping, "host flap state changed");
        let reason = if now_flapping {
            NotificationReason::FlappingStart
        } else {
            NotificationReason::FlappingStop
        };
        self.hooks.notify_host(host, reason);
        let rec = LogRecord::now(
            "HOST FLAPPING ALERT",
            &host.name,
            host.current_state.as_str(),
            if now_flapping {
                "flapping started"
            } else {
                "flapping stopped"
            },
        );
        self.event_log.write(&rec);
    }
}

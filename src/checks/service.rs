//! Service check scheduling and the service state machine.
//!
//! A service result never stands alone: every non-OK result consults the
//! owning host's state, because a service on a dead host must converge to a
//! hard problem immediately (and silently) instead of burning retries, and
//! must come back as a hard recovery once the route returns.

use crate::broker::{BrokerVerdict, CheckPhase, NotificationReason, StateChangeEvent};
use crate::checks::{self, flapping, CheckOptions, CheckResult, CheckType};
use crate::core::errors::{FmError, Result};
use crate::core::UnixTs;
use crate::engine::Engine;
use crate::logger::LogRecord;
use crate::objects::command::{expand_macros, split_check_reference, MacroContext};
use crate::objects::{
    Acknowledgement, DependencyKind, HostState, ServiceId, ServiceState, StateType,
};
use crate::scheduler::{Disposition, EventPayload};
use crate::workers::JobCallback;

use super::host::ORPHAN_SLACK_S;

/// A host with no check due within this window gets one queued when a
/// service on it reports OK before the host was ever checked.
const FIRST_HOST_CHECK_WINDOW_S: i64 = 300;

const fn service_state_code(state: ServiceState) -> u8 {
    match state {
        ServiceState::Ok => 0,
        ServiceState::Warning => 1,
        ServiceState::Critical => 2,
        ServiceState::Unknown => 3,
    }
}

fn not_viable(object: &str, reason: &str) -> FmError {
    FmError::CheckNotViable {
        object: object.to_string(),
        reason: reason.to_string(),
    }
}

impl Engine {
    /// Schedule the next active check of a service `delay_s` seconds from
    /// now.
    ///
    /// An already-queued check that would fire sooner wins, unless the new
    /// request is forced or explicitly allows postponing (the retry cadence
    /// uses that to push a too-eager check back to the retry interval).
    pub fn schedule_next_service_check(
        &mut self,
        id: ServiceId,
        delay_s: i64,
        options: CheckOptions,
    ) {
        let now = self.now();
        let proposed = now + delay_s.max(0);

        {
            let rt = &self.objects.service(id).rt;
            if rt.next_check_event.is_some()
                && rt.next_check < proposed
                && !options.contains(CheckOptions::FORCE_EXECUTION)
                && !options.contains(CheckOptions::ALLOW_POSTPONE)
            {
                return;
            }
        }

        if let Some(handle) = self.objects.service_mut(id).rt.next_check_event.take() {
            self.queue.remove(handle);
        }

        let delay = u64::try_from(delay_s).unwrap_or(0);
        let handle = self.schedule_in(delay, EventPayload::ServiceCheck(id));
        let svc = self.objects.service_mut(id);
        svc.rt.check_options = options;
        svc.rt.next_check = proposed;
        svc.rt.next_check_event = Some(handle);
        self.hooks.update_service_status(self.objects.service(id));
    }

    /// React to a service check timer leaving the queue.
    pub(crate) fn handle_service_check_event(&mut self, id: ServiceId, disposition: Disposition) {
        let Disposition::Timed { latency_s } = disposition else {
            self.objects.service_mut(id).rt.next_check_event = None;
            return;
        };
        let now = self.now();

        let (options, check_interval, retry_interval, executing) = {
            let svc = self.objects.service_mut(id);
            svc.rt.next_check_event = None;
            let options = svc.rt.check_options;
            svc.rt.check_options = CheckOptions::NONE;
            (
                options,
                svc.check_interval_s,
                svc.retry_interval_s,
                svc.rt.is_executing,
            )
        };

        // Reschedule directly; the result handler may replace this with a
        // retry-cadence event later.
        if check_interval != 0 && !executing {
            self.schedule_next_service_check(
                id,
                i64::try_from(check_interval).unwrap_or(i64::MAX),
                CheckOptions::NONE,
            );
        }

        if !options.contains(CheckOptions::FORCE_EXECUTION) {
            // Parallelism cap: push the check to the retry cadence instead
            // of piling more jobs onto saturated workers.
            if self.config.max_parallel_service_checks != 0
                && self.running_service_checks >= self.config.max_parallel_service_checks
            {
                tracing::warn!(
                    limit = self.config.max_parallel_service_checks,
                    service = %self.objects.service(id).description,
                    "max concurrent service checks reached; deferring"
                );
                if retry_interval != 0 && !executing {
                    self.schedule_next_service_check(
                        id,
                        i64::try_from(retry_interval).unwrap_or(i64::MAX),
                        CheckOptions::NONE,
                    );
                }
                return;
            }
            if !self.config.execute_service_checks {
                return;
            }
            let svc = self.objects.service(id);
            let horizon = i64::try_from(self.config.cached_service_check_horizon_s).unwrap_or(0);
            if svc.rt.last_check <= now && svc.rt.last_check + horizon > now {
                return;
            }
            if !svc.checks_enabled {
                return;
            }
            if !self.objects.period_allows(svc.check_period, now) {
                return;
            }
            if !self.service_dependencies_ok(id, DependencyKind::Execution) {
                return;
            }
        }

        if let Err(e) = self.run_async_service_check(id, options, latency_s) {
            tracing::debug!(
                service = %self.objects.service(id).description,
                error = %e,
                "service check did not start"
            );
        }
    }

    /// Start an asynchronous service check.
    pub fn run_async_service_check(
        &mut self,
        id: ServiceId,
        options: CheckOptions,
        latency: f64,
    ) -> Result<()> {
        let now = self.now();
        self.objects.service_mut(id).rt.latency = latency;

        match self
            .broker
            .service_check(CheckPhase::Precheck, self.objects.service(id))
        {
            BrokerVerdict::Continue => {}
            BrokerVerdict::Cancel => {
                return Err(not_viable(
                    &self.objects.service(id).description,
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
                return self.handle_async_service_check_result(id, cr);
            }
        }

        let (reference, host_id) = {
            let svc = self.objects.service(id);
            let Some(reference) = svc.check_command.clone() else {
                return Err(FmError::NoCheckCommand {
                    object: format!("service '{}'", svc.description),
                });
            };
            (reference, svc.host)
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
            let host = self.objects.host(host_id);
            let svc = self.objects.service(id);
            // Host customs and service customs are both in scope for a
            // service command line.
            let custom: Vec<(String, String)> = host
                .custom_vars
                .iter()
                .chain(svc.custom_vars.iter())
                .cloned()
                .collect();
            let ctx = MacroContext {
                host_name: &host.name,
                host_address: &host.address,
                service_description: Some(&svc.description),
                args: &args,
                custom: &custom,
            };
            expand_macros(&command.line, &ctx)?
        };

        self.objects.service_mut(id).rt.is_executing = true;
        self.running_service_checks += 1;

        match self
            .broker
            .service_check(CheckPhase::Initiate, self.objects.service(id))
        {
            BrokerVerdict::Continue => {}
            BrokerVerdict::Cancel => {
                self.objects.service_mut(id).rt.is_executing = false;
                self.running_service_checks = self.running_service_checks.saturating_sub(1);
                return Err(not_viable(
                    &self.objects.service(id).description,
                    "vetoed by the broker at initiation",
                ));
            }
            BrokerVerdict::Override {
                return_code,
                output,
            } => {
                self.objects.service_mut(id).rt.is_executing = false;
                self.running_service_checks = self.running_service_checks.saturating_sub(1);
                let mut cr = CheckResult::new(CheckType::Active, options);
                cr.scheduled = true;
                cr.latency = latency;
                cr.start_time = now;
                cr.finish_time = now;
                cr.return_code = return_code;
                cr.output = output;
                return self.handle_async_service_check_result(id, cr);
            }
        }

        let mut cr = CheckResult::new(CheckType::Active, options);
        cr.scheduled = true;
        cr.latency = latency;
        cr.start_time = now;

        let dispatched = self.workers.run_job(
            &command_line,
            self.config.service_check_timeout_s,
            JobCallback::Service {
                service: id,
                result: cr,
            },
        );
        if let Err(e) = dispatched {
            self.objects.service_mut(id).rt.is_executing = false;
            self.running_service_checks = self.running_service_checks.saturating_sub(1);
            return Err(e);
        }
        Ok(())
    }

    /// Ingest a finished service check result, active or passive, and drive
    /// the state machine with it.
    #[allow(clippy::too_many_lines)]
    pub fn handle_async_service_check_result(
        &mut self,
        id: ServiceId,
        cr: CheckResult,
    ) -> Result<()> {
        let now = self.now();
        let active = cr.check_type == CheckType::Active;
        let host_id = self.objects.service(id).host;

        if active {
            self.running_service_checks = self.running_service_checks.saturating_sub(1);
        } else {
            let svc = self.objects.service(id);
            if !self.config.accept_passive_service_checks {
                return Err(not_viable(
                    &svc.description,
                    "passive service results are disabled globally",
                ));
            }
            if !svc.accept_passive_checks {
                return Err(not_viable(
                    &svc.description,
                    "this service does not accept passive results",
                ));
            }
        }

        if cr.options.contains(CheckOptions::FRESHNESS_CHECK) {
            self.objects.service_mut(id).rt.is_being_freshened = false;
        }
        if active {
            self.objects.service_mut(id).rt.is_executing = false;
        }
        // A passive result may have landed while a forced freshness re-check
        // was in flight; a fresh service discards the late answer.
        if cr.options.contains(CheckOptions::FRESHNESS_CHECK)
            && self.is_service_result_fresh(id, now, false)
        {
            return Ok(());
        }

        {
            let svc = self.objects.service_mut(id);
            #[allow(clippy::cast_precision_loss)]
            {
                svc.rt.execution_time = ((cr.finish_time - cr.start_time) as f64).max(0.0);
            }
            svc.rt.last_check = cr.start_time;
            svc.rt.check_type = cr.check_type;
            svc.rt.latency = cr.latency;
            svc.last_state = svc.current_state;
        }

        // Classify the result.
        {
            let timeout_state = self.config.service_check_timeout_state;
            let svc = self.objects.service_mut(id);
            if cr.early_timeout && active {
                svc.rt.plugin_output = format!(
                    "(Service check timed out after {:.2} seconds)",
                    svc.rt.execution_time
                );
                svc.rt.long_plugin_output.clear();
                svc.rt.perf_data.clear();
                svc.current_state = timeout_state;
            } else if !cr.exited_ok {
                svc.rt.plugin_output = "(Service check did not exit properly)".to_string();
                svc.rt.long_plugin_output.clear();
                svc.rt.perf_data.clear();
                svc.current_state = ServiceState::Critical;
            } else if !(0..=3).contains(&cr.return_code) {
                svc.rt.plugin_output =
                    format!("(Return code of {} is out of bounds)", cr.return_code);
                svc.rt.long_plugin_output.clear();
                svc.rt.perf_data.clear();
                svc.current_state = ServiceState::Critical;
            } else {
                let mut parsed = checks::parse_check_output(&cr.output);
                if parsed.short.is_empty() {
                    parsed.short = "(No output returned from plugin)".to_string();
                }
                svc.rt.plugin_output = parsed.short;
                svc.rt.long_plugin_output = parsed.long;
                svc.rt.perf_data = parsed.perf;
                svc.current_state = ServiceState::from_return_code(cr.return_code);
            }
        }

        {
            let svc = self.objects.service_mut(id);
            let last_check = svc.rt.last_check;
            match svc.last_state {
                ServiceState::Ok => svc.last_time_ok = last_check,
                ServiceState::Warning => svc.last_time_warning = last_check,
                ServiceState::Critical => svc.last_time_critical = last_check,
                ServiceState::Unknown => svc.last_time_unknown = last_check,
            }
        }

        if !active && self.config.log_passive_checks {
            let host = self.objects.host(host_id);
            let svc = self.objects.service(id);
            let mut rec = LogRecord::now(
                "PASSIVE SERVICE CHECK",
                &host.name,
                svc.current_state.as_str(),
                &svc.rt.plugin_output,
            );
            rec.service = Some(&svc.description);
            self.event_log.write(&rec);
        }

        // An OK result on a host that has never been checked: get the host a
        // verdict soon unless one is already imminent.
        let mut first_host_check_initiated = false;
        if self.objects.service(id).current_state == ServiceState::Ok {
            let host = self.objects.host(host_id);
            if !host.rt.has_been_checked
                && (host.rt.next_check == 0 || host.rt.next_check - now > FIRST_HOST_CHECK_WINDOW_S)
            {
                first_host_check_initiated = true;
                self.schedule_next_host_check(host_id, 0, CheckOptions::DEPENDENCY_CHECK);
            }
        }

        // A soft state means this result is a recheck; move the attempt.
        {
            let svc = self.objects.service_mut(id);
            if svc.rt.state_type == StateType::Soft && svc.rt.current_attempt < svc.max_attempts {
                svc.rt.current_attempt += 1;
            }
        }

        let state_change = {
            let svc = self.objects.service(id);
            svc.current_state != svc.last_state
        };
        let mut hard_state_change = {
            let svc = self.objects.service(id);
            // A recovery while the host was known-bad is a hard recovery: the
            // attempt counter was force-reset when the route died, so the
            // normal max-attempts test cannot see it.
            (svc.host_problem_at_last_check && svc.current_state == ServiceState::Ok)
                || (svc.rt.current_attempt >= svc.max_attempts
                    && svc.current_state != svc.last_hard_state)
        };

        if state_change || hard_state_change {
            let svc = self.objects.service_mut(id);
            svc.rt.no_more_notifications = false;
            let clear_ack = match svc.rt.acknowledgement {
                Acknowledgement::Normal => state_change || !hard_state_change,
                Acknowledgement::Sticky => svc.current_state == ServiceState::Ok,
                Acknowledgement::None => false,
            };
            if clear_ack {
                svc.rt.acknowledgement = Acknowledgement::None;
            }
        }

        {
            let svc = self.objects.service_mut(id);
            let last_check = svc.rt.last_check;
            if svc.rt.last_state_change == 0 {
                svc.rt.last_state_change = last_check;
            }
            if svc.rt.last_hard_state_change == 0 {
                svc.rt.last_hard_state_change = last_check;
            }
            if state_change {
                svc.rt.last_state_change = last_check;
            }
            if hard_state_change {
                svc.rt.last_hard_state_change = last_check;
            }
        }

        if state_change {
            let event_id = self.event_ids.next_id();
            {
                let svc = self.objects.service_mut(id);
                svc.rt.last_event_id = svc.rt.current_event_id;
                svc.rt.current_event_id = event_id;
            }
            if self.objects.service(id).last_state == ServiceState::Ok {
                let problem_id = self.problem_ids.next_id();
                self.objects.service_mut(id).rt.current_problem_id = problem_id;
            }
            if self.objects.service(id).current_state == ServiceState::Ok {
                let svc = self.objects.service_mut(id);
                svc.rt.last_problem_id = svc.rt.current_problem_id;
                svc.rt.current_problem_id = 0;
            }
        }

        let mut flapping_check_done = false;

        if self.objects.service(id).current_state == ServiceState::Ok {
            // ---- OK logic ----
            self.objects.service_mut(id).rt.acknowledgement = Acknowledgement::None;

            // The service answered, so the route works; if the host still
            // looks bad, get it re-checked (unless a very recent host result
            // already tells the story).
            if self.objects.host(host_id).current_state != HostState::Up
                && !first_host_check_initiated
            {
                let host = self.objects.host(host_id);
                let horizon = i64::try_from(self.config.cached_host_check_horizon_s).unwrap_or(0);
                let cached_usable = host.rt.has_been_checked
                    && host.rt.last_check <= now
                    && host.rt.last_check + horizon > now;
                if !cached_usable {
                    self.schedule_next_host_check(host_id, 0, CheckOptions::DEPENDENCY_CHECK);
                }
            }

            if hard_state_change {
                self.objects.service_mut(id).rt.state_type = StateType::Hard;
                self.log_service_alert(id);
                self.emit_service_state_change(id);
                self.check_service_flapping(id);
                self.check_host_flapping(host_id);
                flapping_check_done = true;
                self.notify_service(id, NotificationReason::Normal);
            } else if state_change {
                self.objects.service_mut(id).rt.state_type = StateType::Soft;
                self.log_service_alert(id);
                self.emit_service_state_change(id);
            }

            let svc = self.objects.service_mut(id);
            svc.host_problem_at_last_check = false;
            svc.rt.current_attempt = 1;
            svc.rt.state_type = StateType::Hard;
            svc.last_hard_state = ServiceState::Ok;
            svc.rt.current_notification_number = 0;
            svc.rt.acknowledgement = Acknowledgement::None;
        } else {
            // ---- problem logic ----
            // The route verdict is whatever the host state is right now;
            // with max_attempts > 1 an in-flight host re-check lands before
            // the service goes hard.
            let mut route_result = self.objects.host(host_id).current_state;

            if route_result == HostState::Up {
                let host = self.objects.host(host_id);
                let horizon = i64::try_from(self.config.cached_host_check_horizon_s).unwrap_or(0);
                let cached_usable = !self.config.execute_host_checks
                    || (host.rt.last_check <= now && host.rt.last_check + horizon > now);
                let svc_soft = self.objects.service(id).rt.state_type == StateType::Soft;
                if !cached_usable && (state_change || svc_soft) {
                    self.schedule_next_host_check(host_id, 0, CheckOptions::DEPENDENCY_CHECK);
                }
            } else {
                let svc_soft = self.objects.service(id).rt.state_type == StateType::Soft;
                if self.config.execute_host_checks && (state_change || svc_soft) {
                    self.schedule_next_host_check(host_id, 0, CheckOptions::NONE);
                } else {
                    // No host re-check is coming; take the host state at
                    // face value and let contacts hear about the host again.
                    if !self.objects.host(host_id).rt.has_been_checked {
                        let last_check = self.objects.service(id).rt.last_check;
                        let host = self.objects.host_mut(host_id);
                        host.rt.has_been_checked = true;
                        host.rt.last_check = last_check;
                    }
                    route_result = self.objects.host(host_id).current_state;
                    self.hooks
                        .notify_host(self.objects.host(host_id), NotificationReason::Normal);
                }
            }

            if route_result != HostState::Up {
                // The host is the problem; the service converges to hard
                // immediately, without retries and without notifications.
                if self.objects.service(id).last_hard_state
                    != self.objects.service(id).current_state
                {
                    hard_state_change = true;
                    tracing::info!(
                        service = %self.objects.service(id).description,
                        "service switched to a hard problem state because its host is down"
                    );
                }
                let svc = self.objects.service_mut(id);
                let last_check = svc.rt.last_check;
                if state_change || hard_state_change {
                    svc.rt.last_state_change = last_check;
                }
                if hard_state_change {
                    svc.rt.state_type = StateType::Hard;
                }
                svc.host_problem_at_last_check = true;
            } else if self.objects.service(id).host_problem_at_last_check {
                // The host recovered between service checks. Restart the
                // soft confirmation count so the service gets its full run
                // of retries against the working route.
                let svc = self.objects.service_mut(id);
                svc.host_problem_at_last_check = false;
                if svc.rt.state_type == StateType::Soft {
                    svc.rt.current_attempt = 1;
                }
            }

            let (attempt, max_attempts) = {
                let svc = self.objects.service(id);
                (svc.rt.current_attempt, svc.max_attempts)
            };

            if attempt < max_attempts {
                if route_result == HostState::Up {
                    // Keep retrying on the retry cadence.
                    self.objects.service_mut(id).rt.state_type = StateType::Soft;
                    self.log_service_alert(id);
                    self.emit_service_state_change(id);

                    let retry = self.objects.service(id).retry_interval_s;
                    if retry != 0 {
                        // Postponement allowed: the retry cadence overrides
                        // an earlier-scheduled regular check.
                        self.schedule_next_service_check(
                            id,
                            i64::try_from(retry).unwrap_or(i64::MAX),
                            CheckOptions::ALLOW_POSTPONE,
                        );
                    }
                } else if hard_state_change {
                    self.log_service_alert(id);
                    self.emit_service_state_change(id);
                    let svc = self.objects.service_mut(id);
                    svc.rt.last_hard_state_change = svc.rt.last_check;
                    svc.last_hard_state = svc.current_state;
                }

                // One attempt before the problem goes hard, probe dependency
                // masters so the verdicts are current when it matters.
                if self.config.execute_service_checks
                    && self.config.enable_predictive_service_dependency_checks
                    && attempt + 1 == max_attempts
                {
                    let masters: Vec<ServiceId> = {
                        let svc = self.objects.service(id);
                        svc.exec_deps
                            .iter()
                            .chain(svc.notify_deps.iter())
                            .map(|&di| self.objects.service_deps[di].master)
                            .collect()
                    };
                    for master in masters {
                        self.schedule_next_service_check(
                            master,
                            0,
                            CheckOptions::DEPENDENCY_CHECK,
                        );
                    }
                }
            } else {
                // Out of retries: the problem is hard now.
                self.objects.service_mut(id).rt.state_type = StateType::Hard;

                let volatile = self.objects.service(id).is_volatile;
                if hard_state_change {
                    self.log_service_alert(id);
                } else if volatile {
                    // Volatile services re-log every hard problem result.
                    self.log_service_alert(id);
                }

                if hard_state_change || state_change {
                    self.hooks
                        .pending_flex_service_downtime(self.objects.service(id));
                }

                // Sample flap state before notifying, so contacts are not
                // paged for a service that just started flapping.
                self.check_service_flapping(id);
                self.check_host_flapping(host_id);
                flapping_check_done = true;

                self.notify_service(id, NotificationReason::Normal);

                if hard_state_change || volatile {
                    self.emit_service_state_change(id);
                }

                let svc = self.objects.service_mut(id);
                svc.last_hard_state = svc.current_state;
            }
        }

        let _ = self
            .broker
            .service_check(CheckPhase::Processed, self.objects.service(id));

        self.objects.service_mut(id).rt.has_been_checked = true;

        // Whatever happened above, the service must still have a next check.
        {
            let svc = self.objects.service(id);
            if svc.rt.next_check_event.is_none() && svc.check_interval_s != 0 {
                let interval = i64::try_from(svc.check_interval_s).unwrap_or(i64::MAX);
                self.schedule_next_service_check(id, interval, CheckOptions::NONE);
            }
        }

        self.hooks.update_service_status(self.objects.service(id));

        if !flapping_check_done {
            self.check_service_flapping(id);
            self.check_host_flapping(host_id);
        }
        Ok(())
    }

    fn notify_service(&mut self, id: ServiceId, reason: NotificationReason) {
        let host_id = self.objects.service(id).host;
        self.hooks.notify_service(
            self.objects.service(id),
            self.objects.host(host_id),
            reason,
        );
        self.objects.service_mut(id).rt.current_notification_number += 1;
    }

    fn emit_service_state_change(&mut self, id: ServiceId) {
        let host_id = self.objects.service(id).host;
        let host = self.objects.host(host_id);
        let svc = self.objects.service(id);
        let event = StateChangeEvent {
            host: &host.name,
            service: Some(&svc.description),
            old_state: service_state_code(svc.last_state),
            new_state: service_state_code(svc.current_state),
            state_type: svc.rt.state_type,
            attempt: svc.rt.current_attempt,
        };
        self.broker.state_change(&event);
    }

    fn log_service_alert(&mut self, id: ServiceId) {
        let svc = &self.objects.services[id.index()];
        let host = &self.objects.hosts[svc.host.index()];
        let mut rec = LogRecord::now(
            "SERVICE ALERT",
            &host.name,
            svc.current_state.as_str(),
            &svc.rt.plugin_output,
        );
        rec.service = Some(&svc.description);
        rec.state_type = Some(svc.rt.state_type.as_str());
        rec.attempt = Some(svc.rt.current_attempt);
        self.event_log.write(&rec);
    }

    /// Whether every dependency of `kind` lets this service proceed.
    #[must_use]
    pub fn service_dependencies_ok(&self, id: ServiceId, kind: DependencyKind) -> bool {
        let now = self.now();
        let svc = self.objects.service(id);
        let deps = match kind {
            DependencyKind::Execution => &svc.exec_deps,
            DependencyKind::Notification => &svc.notify_deps,
        };
        for &di in deps {
            let dep = &self.objects.service_deps[di];
            // Outside its window a dependency never fails anything.
            if !self.objects.period_allows(dep.period, now) {
                continue;
            }
            let master = self.objects.service(dep.master);
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
            if dep.failure_mask.matches_service(state) {
                return false;
            }
            if dep.inherits_parent && !self.service_dependencies_ok(dep.master, kind) {
                return false;
            }
        }
        true
    }

    /// Recurring sweep: force a re-check of every service whose last result
    /// has gone stale.
    pub(crate) fn check_service_freshness(&mut self) {
        let now = self.now();
        let mut stale: Vec<ServiceId> = Vec::new();

        for i in 0..self.objects.services.len() {
            let id = ServiceId(u32::try_from(i).unwrap_or(u32::MAX));
            let svc = self.objects.service(id);
            if !svc.check_freshness {
                continue;
            }
            if svc.rt.is_executing || svc.rt.is_being_freshened {
                continue;
            }
            if !svc.checks_enabled && !svc.accept_passive_checks {
                continue;
            }
            if !self.objects.period_allows(svc.check_period, now) {
                continue;
            }
            // With no interval and no explicit threshold there is nothing to
            // derive a staleness window from.
            if svc.check_interval_s == 0 && svc.freshness_threshold_s == 0 {
                continue;
            }
            if !self.is_service_result_fresh(id, now, true) {
                stale.push(id);
            }
        }

        for id in stale {
            self.objects.service_mut(id).rt.is_being_freshened = true;
            self.schedule_next_service_check(
                id,
                0,
                CheckOptions::FORCE_EXECUTION | CheckOptions::FRESHNESS_CHECK,
            );
        }
    }

    /// Whether the service's last result is recent enough. With no explicit
    /// threshold one is derived from the current check cadence plus latency
    /// and configured slack.
    #[must_use]
    pub fn is_service_result_fresh(
        &self,
        id: ServiceId,
        current_time: UnixTs,
        log_stale: bool,
    ) -> bool {
        let svc = self.objects.service(id);

        #[allow(clippy::cast_possible_truncation)]
        let threshold: i64 = if svc.freshness_threshold_s == 0 {
            let interval = if svc.rt.state_type == StateType::Hard
                || svc.current_state == ServiceState::Ok
            {
                svc.check_interval_s
            } else {
                svc.retry_interval_s
            };
            i64::try_from(interval + self.config.additional_freshness_latency_s)
                .unwrap_or(i64::MAX)
                .saturating_add(svc.rt.latency as i64)
        } else {
            i64::try_from(svc.freshness_threshold_s).unwrap_or(i64::MAX)
        };

        let expiration = if !svc.rt.has_been_checked {
            self.program_start.saturating_add(threshold)
        } else if svc.checks_enabled
            && self.program_start > svc.rt.last_check
            && svc.freshness_threshold_s == 0
        {
            self.program_start.saturating_add(threshold)
        } else {
            svc.rt.last_check.saturating_add(threshold)
        };

        if expiration < current_time {
            if log_stale {
                tracing::warn!(
                    service = %svc.description,
                    stale_s = current_time - expiration,
                    threshold_s = threshold,
                    "service check results are stale; forcing an immediate check"
                );
            }
            return false;
        }
        true
    }

    /// Recurring sweep: recover services whose in-flight check never
    /// reported back.
    pub(crate) fn check_orphaned_services(&mut self) {
        let now = self.now();
        let window = i64::try_from(
            self.config.service_check_timeout_s + self.config.check_reaper_interval_s,
        )
        .unwrap_or(i64::MAX)
        .saturating_add(ORPHAN_SLACK_S);

        let mut orphaned: Vec<ServiceId> = Vec::new();
        for i in 0..self.objects.services.len() {
            let id = ServiceId(u32::try_from(i).unwrap_or(u32::MAX));
            let svc = self.objects.service(id);
            if !svc.rt.is_executing {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let expected = svc
                .rt
                .next_check
                .saturating_add(svc.rt.latency as i64)
                .saturating_add(window);
            if expected < now {
                orphaned.push(id);
            }
        }

        for id in orphaned {
            tracing::warn!(
                service = %self.objects.service(id).description,
                "service check looks orphaned; scheduling an immediate re-check"
            );
            self.running_service_checks = self.running_service_checks.saturating_sub(1);
            self.objects.service_mut(id).rt.is_executing = false;
            self.schedule_next_service_check(id, 0, CheckOptions::ORPHAN_CHECK);
        }
    }

    /// Sample the current state into the flap window and flip the flapping
    /// flag across the hysteresis thresholds.
    fn check_service_flapping(&mut self, id: ServiceId) {
        {
            let svc = self.objects.service_mut(id);
            let code = service_state_code(svc.current_state);
            svc.rt.flap.record(code);
        }
        if !self.config.enable_flap_detection
            || !self.objects.service(id).flap_detection_enabled
        {
            return;
        }

        let (pct, was_flapping) = {
            let svc = self.objects.service(id);
            (svc.rt.flap.percent_state_change(), svc.rt.is_flapping)
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

        self.objects.service_mut(id).rt.is_flapping = now_flapping;
        let host_id = self.objects.service(id).host;
        let svc = &self.objects.services[id.index()];
        let host = &self.objects.hosts[host_id.index()];
        tracing::info!(
            service = %svc.description,
            host = %host.name,
            pct,
            flapping = now_flapping,
            "service flap state changed"
        );
        let reason = if now_flapping {
            NotificationReason::FlappingStart
        } else {
            NotificationReason::FlappingStop
        };
        self.hooks.notify_service(svc, host, reason);
        let mut rec = LogRecord::now(
            "SERVICE FLAPPING ALERT",
            &host.name,
            svc.current_state.as_str(),
            if now_flapping {
                "flapping started"
            } else {
                "flapping stopped"
            },
        );
        rec.service = Some(&svc.description);
        self.event_log.write(&rec);
    }
}

//! The monitored object model: hosts, services, dependencies, timeperiods,
//! and the arena that owns them.
//!
//! Relationship lists (parents, children, dependencies) hold arena ids, never
//! references, so the graph can be cyclic in shape without being cyclic in
//! ownership. All runtime check state lives directly on the objects; the
//! engine is the single writer.

pub mod command;
pub mod timeperiod;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::checks::flapping::FlapTracker;
use crate::checks::{CheckOptions, CheckType};
use crate::core::UnixTs;
use crate::core::errors::{FmError, Result};
use crate::scheduler::EventHandle;
pub use timeperiod::{TimeRange, TimeRule, Timeperiod, TimeperiodId};

/// Index of a host in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(pub(crate) u32);

/// Index of a service in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub(crate) u32);

impl HostId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl ServiceId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Host check verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostState {
    /// Host answered its check.
    #[default]
    Up,
    /// Host failed its check and at least one parent (or no parent) is up.
    Down,
    /// Host failed its check and every path to it is down.
    Unreachable,
}

impl HostState {
    /// Display name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unreachable => "UNREACHABLE",
        }
    }

    /// Anything other than UP is a problem state.
    #[must_use]
    pub const fn is_problem(self) -> bool {
        !matches!(self, Self::Up)
    }
}

/// Service check verdicts, ordered by plugin return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Return code 0.
    #[default]
    Ok,
    /// Return code 1.
    Warning,
    /// Return code 2.
    Critical,
    /// Return code 3 (and anything unparseable).
    Unknown,
}

impl ServiceState {
    /// Map a plugin return code already validated to be in `0..=3`.
    #[must_use]
    pub const fn from_return_code(rc: i32) -> Self {
        match rc {
            0 => Self::Ok,
            1 => Self::Warning,
            2 => Self::Critical,
            _ => Self::Unknown,
        }
    }

    /// Display name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Anything other than OK is a problem state.
    #[must_use]
    pub const fn is_problem(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// Whether the current state is still accumulating attempts or settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateType {
    /// Problem (or recovery) seen, retries still pending.
    Soft,
    /// Verdict confirmed by max_attempts results (or by policy).
    #[default]
    Hard,
}

impl StateType {
    /// Display name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "SOFT",
            Self::Hard => "HARD",
        }
    }
}

/// Acknowledgement attached to a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acknowledgement {
    /// No acknowledgement.
    #[default]
    None,
    /// Cleared when the state changes at all.
    Normal,
    /// Cleared only on recovery.
    Sticky,
}

/// Set of states a dependency treats as failure, plus the pseudo-state
/// "pending" for never-checked masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateMask(u16);

impl StateMask {
    const UP: u16 = 1;
    const DOWN: u16 = 1 << 1;
    const UNREACHABLE: u16 = 1 << 2;
    const OK: u16 = 1 << 3;
    const WARNING: u16 = 1 << 4;
    const CRITICAL: u16 = 1 << 5;
    const UNKNOWN: u16 = 1 << 6;
    const PENDING: u16 = 1 << 7;

    /// Empty mask (nothing matches).
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether `state` is in the mask.
    #[must_use]
    pub const fn matches_host(self, state: HostState) -> bool {
        let bit = match state {
            HostState::Up => Self::UP,
            HostState::Down => Self::DOWN,
            HostState::Unreachable => Self::UNREACHABLE,
        };
        self.0 & bit != 0
    }

    /// Whether `state` is in the mask.
    #[must_use]
    pub const fn matches_service(self, state: ServiceState) -> bool {
        let bit = match state {
            ServiceState::Ok => Self::OK,
            ServiceState::Warning => Self::WARNING,
            ServiceState::Critical => Self::CRITICAL,
            ServiceState::Unknown => Self::UNKNOWN,
        };
        self.0 & bit != 0
    }

    /// Whether the pseudo-state "pending" (never checked) is in the mask.
    #[must_use]
    pub const fn matches_pending(self) -> bool {
        self.0 & Self::PENDING != 0
    }

    /// Parse tokens like `["down", "unreachable", "pending"]`.
    pub fn parse(tokens: &[String]) -> Result<Self> {
        let mut mask = 0u16;
        for t in tokens {
            mask |= match t.to_ascii_lowercase().as_str() {
                "up" => Self::UP,
                "down" => Self::DOWN,
                "unreachable" => Self::UNREACHABLE,
                "ok" => Self::OK,
                "warning" => Self::WARNING,
                "critical" => Self::CRITICAL,
                "unknown" => Self::UNKNOWN,
                "pending" => Self::PENDING,
                other => {
                    return Err(FmError::InvalidConfig {
                        details: format!("unknown dependency failure state '{other}'"),
                    });
                }
            };
        }
        Ok(Self(mask))
    }
}

/// Execution dependencies gate checks; notification dependencies are carried
/// for the hooks layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Gates check execution.
    Execution,
    /// Gates notifications (consumed by the hooks implementation).
    Notification,
}

/// "Dependent may not run while master is in a masked state."
#[derive(Debug, Clone)]
pub struct HostDependency {
    /// The gated host.
    pub dependent: HostId,
    /// The host whose state gates it.
    pub master: HostId,
    /// Execution or notification.
    pub kind: DependencyKind,
    /// Master states that fail the dependency.
    pub failure_mask: StateMask,
    /// Also evaluate the master's own dependencies.
    pub inherits_parent: bool,
    /// Outside this period the dependency is treated as passing.
    pub period: Option<TimeperiodId>,
}

/// Service counterpart of [`HostDependency`].
#[derive(Debug, Clone)]
pub struct ServiceDependency {
    /// The gated service.
    pub dependent: ServiceId,
    /// The service whose state gates it.
    pub master: ServiceId,
    /// Execution or notification.
    pub kind: DependencyKind,
    /// Master states that fail the dependency.
    pub failure_mask: StateMask,
    /// Also evaluate the master's own dependencies.
    pub inherits_parent: bool,
    /// Outside this period the dependency is treated as passing.
    pub period: Option<TimeperiodId>,
}

/// Runtime bookkeeping shared by hosts and services.
///
/// Everything here is engine-owned mutable state; configuration lives on the
/// containing object.
#[derive(Debug, Clone, Default)]
pub struct CheckRuntime {
    /// Most recent hard-or-soft verdict's type.
    pub state_type: StateType,
    /// 1-based attempt counter, capped at max_attempts.
    pub current_attempt: u32,
    /// False until the first result of any kind arrives.
    pub has_been_checked: bool,
    /// An active check is in flight.
    pub is_executing: bool,
    /// A forced freshness re-check has been queued and not yet answered.
    pub is_being_freshened: bool,
    /// Origin of the last result.
    pub check_type: CheckType,
    /// Seconds between scheduled and actual start of the last check.
    pub latency: f64,
    /// Wall-clock duration of the last check.
    pub execution_time: f64,
    /// First line of the last output.
    pub plugin_output: String,
    /// Lines after the first.
    pub long_plugin_output: String,
    /// Performance data after `|`.
    pub perf_data: String,
    /// Start time of the last result.
    pub last_check: UnixTs,
    /// Wall-clock time the next active check is aimed at.
    pub next_check: UnixTs,
    /// Queue handle of the pending check event, if one is scheduled.
    pub next_check_event: Option<EventHandle>,
    /// Options the pending check will run with.
    pub check_options: CheckOptions,
    /// Last soft or hard state change.
    pub last_state_change: UnixTs,
    /// Last hard state change.
    pub last_hard_state_change: UnixTs,
    /// Current acknowledgement, if the object is a problem.
    pub acknowledgement: Acknowledgement,
    /// Event id of the current state episode.
    pub current_event_id: u64,
    /// Event id of the previous episode.
    pub last_event_id: u64,
    /// Problem id of the open problem (0 when none).
    pub current_problem_id: u64,
    /// Problem id of the last closed problem.
    pub last_problem_id: u64,
    /// Notifications sent for the open problem.
    pub current_notification_number: u32,
    /// Escalation exhausted; hooks stop notifying.
    pub no_more_notifications: bool,
    /// Flap-detection sample window.
    pub flap: FlapTracker,
    /// Currently considered flapping.
    pub is_flapping: bool,
}

/// A monitored host.
#[derive(Debug, Clone)]
pub struct Host {
    /// Unique name.
    pub name: String,
    /// Address handed to `$HOSTADDRESS$` (name used when empty).
    pub address: String,
    /// `name!arg!arg` check reference; `None` means passive-only.
    pub check_command: Option<String>,
    /// Active checks only run inside this period.
    pub check_period: Option<TimeperiodId>,
    /// Hosts between this one and the monitoring server.
    pub parents: Vec<HostId>,
    /// Reverse of `parents`, built by the arena.
    pub children: Vec<HostId>,
    /// Results needed to confirm a hard state (>= 1).
    pub max_attempts: u32,
    /// Seconds between checks in a steady state.
    pub check_interval_s: u64,
    /// Seconds between checks while a soft problem is being confirmed.
    pub retry_interval_s: u64,
    /// Active checks enabled for this host.
    pub checks_enabled: bool,
    /// Passive results accepted for this host.
    pub accept_passive_checks: bool,
    /// Include this host in freshness sweeps.
    pub check_freshness: bool,
    /// Explicit freshness threshold; 0 derives one from the intervals.
    pub freshness_threshold_s: u64,
    /// Flap detection enabled for this host.
    pub flap_detection_enabled: bool,
    /// Custom `$_HOST...$` variables.
    pub custom_vars: Vec<(String, String)>,
    /// Indices into the arena's host dependency table (execution).
    pub exec_deps: Vec<usize>,
    /// Indices into the arena's host dependency table (notification).
    pub notify_deps: Vec<usize>,
    /// Current state.
    pub current_state: HostState,
    /// State before the last result.
    pub last_state: HostState,
    /// Last confirmed hard state.
    pub last_hard_state: HostState,
    /// Shared runtime bookkeeping.
    pub rt: CheckRuntime,
    /// Last time a result left the host UP.
    pub last_time_up: UnixTs,
    /// Last time a result left the host DOWN.
    pub last_time_down: UnixTs,
    /// Last time a result left the host UNREACHABLE.
    pub last_time_unreachable: UnixTs,
}

impl Host {
    /// New host with library defaults; fleet loading overrides fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: String::new(),
            check_command: None,
            check_period: None,
            parents: Vec::new(),
            children: Vec::new(),
            max_attempts: 3,
            check_interval_s: 300,
            retry_interval_s: 60,
            checks_enabled: true,
            accept_passive_checks: true,
            check_freshness: false,
            freshness_threshold_s: 0,
            flap_detection_enabled: true,
            custom_vars: Vec::new(),
            exec_deps: Vec::new(),
            notify_deps: Vec::new(),
            current_state: HostState::Up,
            last_state: HostState::Up,
            last_hard_state: HostState::Up,
            rt: CheckRuntime {
                current_attempt: 1,
                ..CheckRuntime::default()
            },
            last_time_up: 0,
            last_time_down: 0,
            last_time_unreachable: 0,
        }
    }

    /// Retry interval while confirming a soft problem, check interval
    /// otherwise.
    #[must_use]
    pub const fn check_window_s(&self) -> u64 {
        if self.current_state.is_problem() && matches!(self.rt.state_type, StateType::Soft) {
            self.retry_interval_s
        } else {
            self.check_interval_s
        }
    }
}

/// A monitored service on a host.
#[derive(Debug, Clone)]
pub struct Service {
    /// Owning host.
    pub host: HostId,
    /// Unique per host.
    pub description: String,
    /// `name!arg!arg` check reference; `None` means passive-only.
    pub check_command: Option<String>,
    /// Active checks only run inside this period.
    pub check_period: Option<TimeperiodId>,
    /// Results needed to confirm a hard state (>= 1).
    pub max_attempts: u32,
    /// Seconds between checks in a steady state.
    pub check_interval_s: u64,
    /// Seconds between checks while a soft problem is being confirmed.
    pub retry_interval_s: u64,
    /// Active checks enabled for this service.
    pub checks_enabled: bool,
    /// Passive results accepted for this service.
    pub accept_passive_checks: bool,
    /// Include this service in freshness sweeps.
    pub check_freshness: bool,
    /// Explicit freshness threshold; 0 derives one from the intervals.
    pub freshness_threshold_s: u64,
    /// Re-log and re-notify every hard problem result, not just changes.
    pub is_volatile: bool,
    /// Flap detection enabled for this service.
    pub flap_detection_enabled: bool,
    /// Custom `$_SERVICE...$` variables.
    pub custom_vars: Vec<(String, String)>,
    /// Indices into the arena's service dependency table (execution).
    pub exec_deps: Vec<usize>,
    /// Indices into the arena's service dependency table (notification).
    pub notify_deps: Vec<usize>,
    /// Current state.
    pub current_state: ServiceState,
    /// State before the last result.
    pub last_state: ServiceState,
    /// Last confirmed hard state.
    pub last_hard_state: ServiceState,
    /// Shared runtime bookkeeping.
    pub rt: CheckRuntime,
    /// The route to the host was known-bad when the last result arrived.
    pub host_problem_at_last_check: bool,
    /// Last time a result left the service OK.
    pub last_time_ok: UnixTs,
    /// Last time a result left the service WARNING.
    pub last_time_warning: UnixTs,
    /// Last time a result left the service CRITICAL.
    pub last_time_critical: UnixTs,
    /// Last time a result left the service UNKNOWN.
    pub last_time_unknown: UnixTs,
}

impl Service {
    /// New service with library defaults; fleet loading overrides fields.
    #[must_use]
    pub fn new(host: HostId, description: impl Into<String>) -> Self {
        Self {
            host,
            description: description.into(),
            check_command: None,
            check_period: None,
            max_attempts: 3,
            check_interval_s: 300,
            retry_interval_s: 60,
            checks_enabled: true,
            accept_passive_checks: true,
            check_freshness: false,
            freshness_threshold_s: 0,
            is_volatile: false,
            flap_detection_enabled: true,
            custom_vars: Vec::new(),
            exec_deps: Vec::new(),
            notify_deps: Vec::new(),
            current_state: ServiceState::Ok,
            last_state: ServiceState::Ok,
            last_hard_state: ServiceState::Ok,
            rt: CheckRuntime {
                current_attempt: 1,
                ..CheckRuntime::default()
            },
            host_problem_at_last_check: false,
            last_time_ok: 0,
            last_time_warning: 0,
            last_time_critical: 0,
            last_time_unknown: 0,
        }
    }

    /// Retry interval while confirming a soft problem, check interval
    /// otherwise.
    #[must_use]
    pub const fn check_window_s(&self) -> u64 {
        if self.current_state.is_problem() && matches!(self.rt.state_type, StateType::Soft) {
            self.retry_interval_s
        } else {
            self.check_interval_s
        }
    }
}

/// A named command line referenced by check references.
#[derive(Debug, Clone)]
pub struct Command {
    /// Name used in `name!arg` references.
    pub name: String,
    /// Template with `$MACRO$` placeholders.
    pub line: String,
}

/// Owns every monitored object; ids are indices into its tables.
#[derive(Debug, Default)]
pub struct ObjectArena {
    /// All hosts.
    pub hosts: Vec<Host>,
    /// All services.
    pub services: Vec<Service>,
    /// All host dependencies; hosts hold indices into this table.
    pub host_deps: Vec<HostDependency>,
    /// All service dependencies; services hold indices into this table.
    pub service_deps: Vec<ServiceDependency>,
    /// All timeperiods.
    pub timeperiods: Vec<Timeperiod>,
    /// All command definitions.
    pub commands: Vec<Command>,
    host_index: HashMap<String, HostId>,
    service_index: HashMap<(String, String), ServiceId>,
    timeperiod_index: HashMap<String, TimeperiodId>,
    command_index: HashMap<String, usize>,
}

impl ObjectArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a host.
    #[must_use]
    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.index()]
    }

    /// Mutably borrow a host.
    pub fn host_mut(&mut self, id: HostId) -> &mut Host {
        &mut self.hosts[id.index()]
    }

    /// Borrow a service.
    #[must_use]
    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.index()]
    }

    /// Mutably borrow a service.
    pub fn service_mut(&mut self, id: ServiceId) -> &mut Service {
        &mut self.services[id.index()]
    }

    /// Look a host up by name.
    #[must_use]
    pub fn host_by_name(&self, name: &str) -> Option<HostId> {
        self.host_index.get(name).copied()
    }

    /// Look a service up by host name and description.
    #[must_use]
    pub fn service_by_name(&self, host: &str, description: &str) -> Option<ServiceId> {
        self.service_index
            .get(&(host.to_string(), description.to_string()))
            .copied()
    }

    /// Look a timeperiod up by name.
    #[must_use]
    pub fn timeperiod_by_name(&self, name: &str) -> Option<TimeperiodId> {
        self.timeperiod_index.get(name).copied()
    }

    /// Look a command definition up by name.
    #[must_use]
    pub fn command_by_name(&self, name: &str) -> Option<&Command> {
        self.command_index.get(name).map(|&i| &self.commands[i])
    }

    /// `true` when `ts` is inside the period, or when no period is set.
    #[must_use]
    pub fn period_allows(&self, period: Option<TimeperiodId>, ts: UnixTs) -> bool {
        period.is_none_or(|id| self.timeperiods[id.index()].contains(ts))
    }

    /// Add a timeperiod; names must be unique.
    pub fn add_timeperiod(&mut self, tp: Timeperiod) -> Result<TimeperiodId> {
        if self.timeperiod_index.contains_key(&tp.name) {
            return Err(FmError::InvalidConfig {
                details: format!("duplicate timeperiod '{}'", tp.name),
            });
        }
        let id = TimeperiodId(u32::try_from(self.timeperiods.len()).unwrap_or(u32::MAX));
        self.timeperiod_index.insert(tp.name.clone(), id);
        self.timeperiods.push(tp);
        Ok(id)
    }

    /// Add a command definition; names must be unique.
    pub fn add_command(&mut self, cmd: Command) -> Result<()> {
        if self.command_index.contains_key(&cmd.name) {
            return Err(FmError::InvalidConfig {
                details: format!("duplicate command '{}'", cmd.name),
            });
        }
        self.command_index.insert(cmd.name.clone(), self.commands.len());
        self.commands.push(cmd);
        Ok(())
    }

    /// Add a host; names must be unique. Parent/child links are wired by
    /// [`Self::link_host_parents`] once all hosts exist.
    pub fn add_host(&mut self, host: Host) -> Result<HostId> {
        if self.host_index.contains_key(&host.name) {
            return Err(FmError::InvalidConfig {
                details: format!("duplicate host '{}'", host.name),
            });
        }
        let id = HostId(u32::try_from(self.hosts.len()).unwrap_or(u32::MAX));
        self.host_index.insert(host.name.clone(), id);
        self.hosts.push(host);
        Ok(id)
    }

    /// Add a service; (host, description) must be unique.
    pub fn add_service(&mut self, service: Service) -> Result<ServiceId> {
        let host_name = self.host(service.host).name.clone();
        let key = (host_name, service.description.clone());
        if self.service_index.contains_key(&key) {
            return Err(FmError::InvalidConfig {
                details: format!("duplicate service '{}' on host '{}'", key.1, key.0),
            });
        }
        let id = ServiceId(u32::try_from(self.services.len()).unwrap_or(u32::MAX));
        self.service_index.insert(key, id);
        self.services.push(service);
        Ok(id)
    }

    /// Set a host's parents and maintain the reverse child links.
    pub fn link_host_parents(&mut self, id: HostId, parents: Vec<HostId>) {
        for &p in &parents {
            self.hosts[p.index()].children.push(id);
        }
        self.hosts[id.index()].parents = parents;
    }

    /// Add a host dependency and index it on the dependent host.
    pub fn add_host_dependency(&mut self, dep: HostDependency) {
        let idx = self.host_deps.len();
        let dependent = dep.dependent;
        let kind = dep.kind;
        self.host_deps.push(dep);
        match kind {
            DependencyKind::Execution => self.hosts[dependent.index()].exec_deps.push(idx),
            DependencyKind::Notification => self.hosts[dependent.index()].notify_deps.push(idx),
        }
    }

    /// Add a service dependency and index it on the dependent service.
    pub fn add_service_dependency(&mut self, dep: ServiceDependency) {
        let idx = self.service_deps.len();
        let dependent = dep.dependent;
        let kind = dep.kind;
        self.service_deps.push(dep);
        match kind {
            DependencyKind::Execution => self.services[dependent.index()].exec_deps.push(idx),
            DependencyKind::Notification => {
                self.services[dependent.index()].notify_deps.push(idx);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fleet file loading
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_check_interval() -> u64 {
    300
}
fn default_retry_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeperiodDef {
    name: String,
    /// "always" (default) or "never"; ignored when weekday ranges are given.
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    monday: Vec<String>,
    #[serde(default)]
    tuesday: Vec<String>,
    #[serde(default)]
    wednesday: Vec<String>,
    #[serde(default)]
    thursday: Vec<String>,
    #[serde(default)]
    friday: Vec<String>,
    #[serde(default)]
    saturday: Vec<String>,
    #[serde(default)]
    sunday: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandDef {
    name: String,
    line: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostDef {
    name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    check_command: Option<String>,
    #[serde(default)]
    check_period: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_check_interval")]
    check_interval_s: u64,
    #[serde(default = "default_retry_interval")]
    retry_interval_s: u64,
    #[serde(default = "default_true")]
    checks_enabled: bool,
    #[serde(default = "default_true")]
    accept_passive_checks: bool,
    #[serde(default)]
    check_freshness: bool,
    #[serde(default)]
    freshness_threshold_s: u64,
    #[serde(default = "default_true")]
    flap_detection: bool,
    #[serde(default)]
    custom_vars: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceDef {
    host: String,
    description: String,
    #[serde(default)]
    check_command: Option<String>,
    #[serde(default)]
    check_period: Option<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_check_interval")]
    check_interval_s: u64,
    #[serde(default = "default_retry_interval")]
    retry_interval_s: u64,
    #[serde(default = "default_true")]
    checks_enabled: bool,
    #[serde(default = "default_true")]
    accept_passive_checks: bool,
    #[serde(default)]
    check_freshness: bool,
    #[serde(default)]
    freshness_threshold_s: u64,
    #[serde(default)]
    is_volatile: bool,
    #[serde(default = "default_true")]
    flap_detection: bool,
    #[serde(default)]
    custom_vars: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostDependencyDef {
    dependent: String,
    master: String,
    #[serde(default)]
    kind: Option<String>,
    failure_states: Vec<String>,
    #[serde(default)]
    inherits_parent: bool,
    #[serde(default)]
    period: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceDependencyDef {
    dependent_host: String,
    dependent_service: String,
    master_host: String,
    master_service: String,
    #[serde(default)]
    kind: Option<String>,
    failure_states: Vec<String>,
    #[serde(default)]
    inherits_parent: bool,
    #[serde(default)]
    period: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FleetFile {
    #[serde(default)]
    timeperiods: Vec<TimeperiodDef>,
    #[serde(default)]
    commands: Vec<CommandDef>,
    #[serde(default)]
    hosts: Vec<HostDef>,
    #[serde(default)]
    services: Vec<ServiceDef>,
    #[serde(default)]
    host_dependencies: Vec<HostDependencyDef>,
    #[serde(default)]
    service_dependencies: Vec<ServiceDependencyDef>,
}

fn parse_kind(kind: Option<&str>) -> Result<DependencyKind> {
    match kind {
        None | Some("execution") => Ok(DependencyKind::Execution),
        Some("notification") => Ok(DependencyKind::Notification),
        Some(other) => Err(FmError::InvalidConfig {
            details: format!("unknown dependency kind '{other}'"),
        }),
    }
}

/// Load a fleet definition from TOML text.
pub fn load_fleet_str(text: &str) -> Result<ObjectArena> {
    let file: FleetFile = toml::from_str(text)?;
    build_arena(file)
}

/// Load a fleet definition from a TOML file.
pub fn load_fleet(path: &Path) -> Result<ObjectArena> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FmError::MissingConfig {
                path: path.to_path_buf(),
            }
        } else {
            FmError::io(path, e)
        }
    })?;
    load_fleet_str(&text)
}

fn build_arena(file: FleetFile) -> Result<ObjectArena> {
    let mut arena = ObjectArena::new();

    for def in file.timeperiods {
        let day_defs = [
            &def.monday,
            &def.tuesday,
            &def.wednesday,
            &def.thursday,
            &def.friday,
            &def.saturday,
            &def.sunday,
        ];
        let has_ranges = day_defs.iter().any(|d| !d.is_empty());
        let rule = if has_ranges {
            let mut days: [Vec<TimeRange>; 7] = Default::default();
            for (out, ranges) in days.iter_mut().zip(day_defs) {
                for r in ranges {
                    out.push(timeperiod::parse_time_range(r)?);
                }
            }
            TimeRule::Weekly(days)
        } else {
            match def.rule.as_deref() {
                None | Some("always") => TimeRule::Always,
                Some("never") => TimeRule::Never,
                Some(other) => {
                    return Err(FmError::InvalidConfig {
                        details: format!("unknown timeperiod rule '{other}'"),
                    });
                }
            }
        };
        arena.add_timeperiod(Timeperiod {
            name: def.name,
            rule,
        })?;
    }

    for def in file.commands {
        arena.add_command(Command {
            name: def.name,
            line: def.line,
        })?;
    }

    let resolve_period = |arena: &ObjectArena, name: Option<&str>| -> Result<Option<TimeperiodId>> {
        name.map(|n| {
            arena.timeperiod_by_name(n).ok_or_else(|| FmError::UnknownObject {
                kind: "timeperiod",
                name: n.to_string(),
            })
        })
        .transpose()
    };

    let mut parent_names: Vec<(HostId, Vec<String>)> = Vec::new();
    for def in file.hosts {
        let period = resolve_period(&arena, def.check_period.as_deref())?;
        let mut host = Host::new(def.name);
        host.address = def.address;
        host.check_command = def.check_command;
        host.check_period = period;
        host.max_attempts = def.max_attempts.max(1);
        host.check_interval_s = def.check_interval_s;
        host.retry_interval_s = def.retry_interval_s;
        host.checks_enabled = def.checks_enabled;
        host.accept_passive_checks = def.accept_passive_checks;
        host.check_freshness = def.check_freshness;
        host.freshness_threshold_s = def.freshness_threshold_s;
        host.flap_detection_enabled = def.flap_detection;
        host.custom_vars = def.custom_vars.into_iter().collect();
        let id = arena.add_host(host)?;
        if !def.parents.is_empty() {
            parent_names.push((id, def.parents));
        }
    }
    for (id, names) in parent_names {
        let mut parents = Vec::with_capacity(names.len());
        for n in names {
            let pid = arena.host_by_name(&n).ok_or_else(|| FmError::UnknownObject {
                kind: "host",
                name: n,
            })?;
            parents.push(pid);
        }
        arena.link_host_parents(id, parents);
    }

    for def in file.services {
        let host = arena
            .host_by_name(&def.host)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "host",
                name: def.host.clone(),
            })?;
        let period = resolve_period(&arena, def.check_period.as_deref())?;
        let mut svc = Service::new(host, def.description);
        svc.check_command = def.check_command;
        svc.check_period = period;
        svc.max_attempts = def.max_attempts.max(1);
        svc.check_interval_s = def.check_interval_s;
        svc.retry_interval_s = def.retry_interval_s;
        svc.checks_enabled = def.checks_enabled;
        svc.accept_passive_checks = def.accept_passive_checks;
        svc.check_freshness = def.check_freshness;
        svc.freshness_threshold_s = def.freshness_threshold_s;
        svc.is_volatile = def.is_volatile;
        svc.flap_detection_enabled = def.flap_detection;
        svc.custom_vars = def.custom_vars.into_iter().collect();
        arena.add_service(svc)?;
    }

    for def in file.host_dependencies {
        let dependent = arena
            .host_by_name(&def.dependent)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "host",
                name: def.dependent.clone(),
            })?;
        let master = arena
            .host_by_name(&def.master)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "host",
                name: def.master.clone(),
            })?;
        let dep = HostDependency {
            dependent,
            master,
            kind: parse_kind(def.kind.as_deref())?,
            failure_mask: StateMask::parse(&def.failure_states)?,
            inherits_parent: def.inherits_parent,
            period: resolve_period(&arena, def.period.as_deref())?,
        };
        arena.add_host_dependency(dep);
    }

    for def in file.service_dependencies {
        let dependent = arena
            .service_by_name(&def.dependent_host, &def.dependent_service)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "service",
                name: format!("{}/{}", def.dependent_host, def.dependent_service),
            })?;
        let master = arena
            .service_by_name(&def.master_host, &def.master_service)
            .ok_or_else(|| FmError::UnknownObject {
                kind: "service",
                name: format!("{}/{}", def.master_host, def.master_service),
            })?;
        let dep = ServiceDependency {
            dependent,
            master,
            kind: parse_kind(def.kind.as_deref())?,
            failure_mask: StateMask::parse(&def.failure_states)?,
            inherits_parent: def.inherits_parent,
            period: resolve_period(&arena, def.period.as_deref())?,
        };
        arena.add_service_dependency(dep);
    }

    Ok(arena)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"
        [[timeperiods]]
        name = "24x7"

        [[commands]]
        name = "check_ping"
        line = "/usr/lib/monitoring/check_ping -H $HOSTADDRESS$ -w $ARG1$ -c $ARG2$"

        [[hosts]]
        name = "gw"
        address = "10.0.0.1"
        check_command = "check_ping!100,20%!500,60%"

        [[hosts]]
        name = "web01"
        address = "10.0.1.10"
        check_command = "check_ping!100,20%!500,60%"
        parents = ["gw"]

        [[services]]
        host = "web01"
        description = "HTTP"
        check_command = "check_ping!1!2"
        max_attempts = 4

        [[host_dependencies]]
        dependent = "web01"
        master = "gw"
        failure_states = ["down", "unreachable"]
    "#;

    #[test]
    fn fleet_loads_and_links() {
        let arena = load_fleet_str(FLEET).unwrap();
        let gw = arena.host_by_name("gw").unwrap();
        let web = arena.host_by_name("web01").unwrap();
        assert_eq!(arena.host(web).parents, vec![gw]);
        assert_eq!(arena.host(gw).children, vec![web]);

        let svc = arena.service_by_name("web01", "HTTP").unwrap();
        assert_eq!(arena.service(svc).max_attempts, 4);

        assert_eq!(arena.host(web).exec_deps.len(), 1);
        let dep = &arena.host_deps[arena.host(web).exec_deps[0]];
        assert!(dep.failure_mask.matches_host(HostState::Down));
        assert!(dep.failure_mask.matches_host(HostState::Unreachable));
        assert!(!dep.failure_mask.matches_host(HostState::Up));
    }

    #[test]
    fn unknown_parent_is_an_error() {
        let bad = r#"
            [[hosts]]
            name = "a"
            parents = ["nope"]
        "#;
        let err = load_fleet_str(bad).unwrap_err();
        assert_eq!(err.code(), "FM-1101");
    }

    #[test]
    fn duplicate_host_is_an_error() {
        let bad = r#"
            [[hosts]]
            name = "a"
            [[hosts]]
            name = "a"
        "#;
        assert_eq!(load_fleet_str(bad).unwrap_err().code(), "FM-1001");
    }
}

//! Check execution vocabulary: result records, option flags, and plugin
//! output parsing. The host and service state machines live in the
//! submodules as `Engine` impl blocks.

pub mod flapping;
pub mod host;
pub mod service;

use std::ops::{BitOr, BitOrAssign};

use crate::core::UnixTs;
use crate::objects::{HostId, ServiceId};

/// Origin of a check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckType {
    /// The engine scheduled and executed the check.
    #[default]
    Active,
    /// The result was submitted from outside.
    Passive,
}

/// Bit flags attached to a scheduled check and carried through its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CheckOptions(u32);

impl CheckOptions {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Bypass the viability gate.
    pub const FORCE_EXECUTION: Self = Self(1);
    /// The check was provoked by the freshness sweep.
    pub const FRESHNESS_CHECK: Self = Self(1 << 1);
    /// The check was provoked by the orphan sweep.
    pub const ORPHAN_CHECK: Self = Self(1 << 2);
    /// The check was provoked on behalf of a dependent object.
    pub const DEPENDENCY_CHECK: Self = Self(1 << 3);
    /// Rescheduling may move the next check later, not only earlier.
    pub const ALLOW_POSTPONE: Self = Self(1 << 4);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CheckOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CheckOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What a check result is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTarget {
    /// A host result.
    Host(HostId),
    /// A service result.
    Service(ServiceId),
}

/// One raw check result, before the state machine interprets it.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Active or passive.
    pub check_type: CheckType,
    /// Options of the check that produced this result.
    pub options: CheckOptions,
    /// The check came off the timer queue (as opposed to on-demand).
    pub scheduled: bool,
    /// Seconds between scheduled and actual start.
    pub latency: f64,
    /// When execution started.
    pub start_time: UnixTs,
    /// When execution finished.
    pub finish_time: UnixTs,
    /// The check was killed at its deadline.
    pub early_timeout: bool,
    /// The process exited normally (not signalled).
    pub exited_ok: bool,
    /// Raw process return code.
    pub return_code: i32,
    /// Raw combined plugin output.
    pub output: String,
}

impl CheckResult {
    /// Result skeleton with the field defaults every producer starts from.
    #[must_use]
    pub fn new(check_type: CheckType, options: CheckOptions) -> Self {
        Self {
            check_type,
            options,
            scheduled: false,
            latency: 0.0,
            start_time: 0,
            finish_time: 0,
            early_timeout: false,
            exited_ok: true,
            return_code: 0,
            output: String::new(),
        }
    }

    /// Convenience constructor for externally submitted results.
    #[must_use]
    pub fn passive(return_code: i32, output: impl Into<String>, timestamp: UnixTs) -> Self {
        Self {
            start_time: timestamp,
            finish_time: timestamp,
            return_code,
            output: output.into(),
            ..Self::new(CheckType::Passive, CheckOptions::NONE)
        }
    }
}

/// Plugin output split into its three conventional parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    /// First line before any `|`, semicolons replaced with colons.
    pub short: String,
    /// Lines after the first, up to a line containing `|`.
    pub long: String,
    /// Everything after the first `|`, joined across lines with spaces.
    pub perf: String,
}

/// Split raw plugin output into short output, long output, and perf data.
///
/// The first line is split on its first `|`; later lines belong to the long
/// output until one of them contains a `|`, after which everything (including
/// the remainder of that line) is perf data. Perf fragments from multiple
/// lines are joined with single spaces.
#[must_use]
pub fn parse_check_output(raw: &str) -> ParsedOutput {
    let mut short = String::new();
    let mut long_lines: Vec<&str> = Vec::new();
    let mut perf_parts: Vec<String> = Vec::new();
    let mut in_perf = false;

    for (i, line) in raw.lines().enumerate() {
        if i == 0 {
            match line.split_once('|') {
                Some((s, p)) => {
                    short = s.trim_end().to_string();
                    let p = p.trim();
                    if !p.is_empty() {
                        perf_parts.push(p.to_string());
                    }
                    in_perf = true;
                }
                None => short = line.trim_end().to_string(),
            }
        } else if in_perf {
            let p = line.trim();
            if !p.is_empty() {
                perf_parts.push(p.to_string());
            }
        } else {
            match line.split_once('|') {
                Some((l, p)) => {
                    let l = l.trim_end();
                    if !l.is_empty() {
                        long_lines.push(l);
                    }
                    let p = p.trim();
                    if !p.is_empty() {
                        perf_parts.push(p.to_string());
                    }
                    in_perf = true;
                }
                None => long_lines.push(line.trim_end()),
            }
        }
    }

    ParsedOutput {
        short: short.replace(';', ":"),
        long: long_lines.join("\n"),
        perf: perf_parts.join(" "),
    }
}

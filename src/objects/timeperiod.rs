//! Timeperiods: when checks are allowed to run.
//!
//! Weekly ranges are evaluated in UTC. `contains` is the only operation the
//! engine consumes.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::core::UnixTs;
use crate::core::errors::{FmError, Result};

/// Index of a timeperiod in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeperiodId(pub(crate) u32);

impl TimeperiodId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Half-open range of seconds within a day: `[start_s, end_s)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Seconds since midnight, inclusive.
    pub start_s: u32,
    /// Seconds since midnight, exclusive.
    pub end_s: u32,
}

/// The rule a timeperiod evaluates.
#[derive(Debug, Clone)]
pub enum TimeRule {
    /// Every instant is inside the period.
    Always,
    /// No instant is inside the period.
    Never,
    /// Per-weekday ranges, Monday first.
    Weekly([Vec<TimeRange>; 7]),
}

/// Named window of validity for checks and dependencies.
#[derive(Debug, Clone)]
pub struct Timeperiod {
    /// Unique name, referenced from hosts/services/dependencies.
    pub name: String,
    /// The evaluated rule.
    pub rule: TimeRule,
}

impl Timeperiod {
    /// Whether `ts` falls inside the period.
    #[must_use]
    pub fn contains(&self, ts: UnixTs) -> bool {
        match &self.rule {
            TimeRule::Always => true,
            TimeRule::Never => false,
            TimeRule::Weekly(days) => {
                let Some(dt) = DateTime::<Utc>::from_timestamp(ts, 0) else {
                    return false;
                };
                let day = dt.weekday().num_days_from_monday() as usize;
                let secs = dt.num_seconds_from_midnight();
                days[day]
                    .iter()
                    .any(|r| secs >= r.start_s && secs < r.end_s)
            }
        }
    }
}

/// Parse a `"HH:MM-HH:MM"` range. `24:00` is accepted as end-of-day.
pub fn parse_time_range(s: &str) -> Result<TimeRange> {
    let err = || FmError::InvalidConfig {
        details: format!("bad time range '{s}', expected HH:MM-HH:MM"),
    };
    let (start, end) = s.split_once('-').ok_or_else(err)?;
    let parse_hm = |part: &str| -> Result<u32> {
        let (h, m) = part.trim().split_once(':').ok_or_else(err)?;
        let h: u32 = h.parse().map_err(|_| err())?;
        let m: u32 = m.parse().map_err(|_| err())?;
        if h > 24 || m > 59 || (h == 24 && m != 0) {
            return Err(err());
        }
        Ok(h * 3600 + m * 60)
    };
    let range = TimeRange {
        start_s: parse_hm(start)?,
        end_s: parse_hm(end)?,
    };
    if range.end_s <= range.start_s {
        return Err(err());
    }
    Ok(range)
}

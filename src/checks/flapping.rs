//! Flap detection: a 21-sample state-history window scored by weighted
//! percent state change, with separate start/stop thresholds for hysteresis.

/// Samples kept per object.
pub const FLAP_HISTORY_SIZE: usize = 21;

/// Weight of the oldest transition; each newer one adds [`WEIGHT_STEP`] so
/// the newest weighs [`WEIGHT_TOP`] and a full window sums to exactly 100%.
const WEIGHT_BASE: f64 = 0.8;
const WEIGHT_TOP: f64 = 1.2;
const WEIGHT_STEP: f64 = (WEIGHT_TOP - WEIGHT_BASE) / (FLAP_HISTORY_SIZE as f64 - 2.0);

/// Rolling state-history window for one object.
///
/// States are stored as raw codes (host or service, the tracker does not
/// care); only transitions between adjacent samples matter.
#[derive(Debug, Clone)]
pub struct FlapTracker {
    history: [u8; FLAP_HISTORY_SIZE],
    len: usize,
    head: usize,
}

impl Default for FlapTracker {
    fn default() -> Self {
        Self {
            history: [0; FLAP_HISTORY_SIZE],
            len: 0,
            head: 0,
        }
    }
}

impl FlapTracker {
    /// Record a state sample.
    pub fn record(&mut self, state: u8) {
        self.history[self.head] = state;
        self.head = (self.head + 1) % FLAP_HISTORY_SIZE;
        if self.len < FLAP_HISTORY_SIZE {
            self.len += 1;
        }
    }

    /// Weighted percent state change over the window, 0.0 to 100.0.
    ///
    /// Recent transitions count more than old ones: weights run linearly
    /// from 0.8 at the oldest transition to 1.2 at the newest, so a full
    /// window of transitions scores 100%.
    #[must_use]
    pub fn percent_state_change(&self) -> f64 {
        if self.len < 2 {
            return 0.0;
        }
        let start = (self.head + FLAP_HISTORY_SIZE - self.len) % FLAP_HISTORY_SIZE;
        let mut curved = 0.0;
        let mut prev = self.history[start];
        for i in 1..self.len {
            let cur = self.history[(start + i) % FLAP_HISTORY_SIZE];
            if cur != prev {
                #[allow(clippy::cast_precision_loss)]
                let weight = WEIGHT_BASE + WEIGHT_STEP * (i - 1) as f64;
                curved += weight;
            }
            prev = cur;
        }
        curved * 100.0 / (FLAP_HISTORY_SIZE - 1) as f64
    }
}

/// Apply start/stop hysteresis. Returns the new flapping flag.
#[must_use]
pub fn evaluate(
    percent_change: f64,
    currently_flapping: bool,
    low_threshold_pct: f64,
    high_threshold_pct: f64,
) -> bool {
    if currently_flapping {
        percent_change > low_threshold_pct
    } else {
        percent_change > high_threshold_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_scores_zero() {
        let mut t = FlapTracker::default();
        for _ in 0..30 {
            t.record(0);
        }
        assert!(t.percent_state_change().abs() < f64::EPSILON);
    }

    #[test]
    fn full_alternation_scores_one_hundred() {
        let mut t = FlapTracker::default();
        for i in 0..FLAP_HISTORY_SIZE {
            t.record(u8::from(i % 2 == 0));
        }
        let pct = t.percent_state_change();
        assert!((pct - 100.0).abs() < 1e-9, "pct = {pct}");
    }

    #[test]
    fn recent_transitions_weigh_more_than_old_ones() {
        // One transition at the oldest edge of the window.
        let mut old = FlapTracker::default();
        old.record(1);
        for _ in 1..FLAP_HISTORY_SIZE {
            old.record(0);
        }
        // One transition at the newest edge.
        let mut new = FlapTracker::default();
        for _ in 1..FLAP_HISTORY_SIZE {
            new.record(0);
        }
        new.record(1);
        assert!(new.percent_state_change() > old.percent_state_change());
    }

    #[test]
    fn hysteresis_holds_between_thresholds() {
        // Below high: does not start.
        assert!(!evaluate(25.0, false, 20.0, 30.0));
        // Above high: starts.
        assert!(evaluate(31.0, false, 20.0, 30.0));
        // Between thresholds while flapping: keeps flapping.
        assert!(evaluate(25.0, true, 20.0, 30.0));
        // Below low: stops.
        assert!(!evaluate(19.0, true, 20.0, 30.0));
    }
}

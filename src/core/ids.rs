//! Monotonic sequence generators for event and problem ids.
//!
//! The engine hands out a fresh event id for every genuine state change and a
//! fresh problem id at the start of every problem episode. The generators are
//! plain values owned by the engine so tests can construct them at any
//! starting point and assert exact ids.

/// A monotonically increasing u64 sequence starting at 1.
#[derive(Debug, Clone)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    /// Sequence whose first issued id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Sequence whose first issued id is `next`.
    #[must_use]
    pub const fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Issue the next id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    /// The id the next call to [`Self::next_id`] will return.
    #[must_use]
    pub const fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

//! Array-backed binary min-heap of timed events.
//!
//! Each scheduled event lives in a slot; the heap orders slot indices by fire
//! time and every entry records its own heap position so removal from the
//! middle is O(log n): swap the last element into the hole and sift it both
//! directions. Handles carry a generation counter so a handle to an event
//! that already fired (or was removed) is simply ignored.

use std::time::Instant;

/// Opaque reference to a scheduled event.
///
/// Stale handles (the event fired, was removed, or the slot was reused) are
/// rejected by every operation; holding one is always safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    slot: u32,
    generation: u32,
}

struct Entry<T> {
    fire_at: Instant,
    /// Index of this entry inside `heap`. Invariant: for every live slot `s`,
    /// `heap[slots[s].entry.pos] == s`.
    pos: usize,
    payload: T,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Minimum logical capacity; the queue never shrinks below this.
const MIN_CAPACITY: usize = 8;

/// Binary min-heap timer queue keyed by monotonic fire time.
pub struct TimerQueue<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    heap: Vec<u32>,
    capacity: usize,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    /// Empty queue with the minimum capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heap: Vec::with_capacity(MIN_CAPACITY),
            capacity: MIN_CAPACITY,
        }
    }

    /// Number of scheduled events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Current logical capacity (grows by doubling, shrinks with hysteresis).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Schedule `payload` to fire at `fire_at`.
    pub fn schedule_at(&mut self, fire_at: Instant, payload: T) -> EventHandle {
        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot {
                generation: 0,
                entry: None,
            });
            u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX)
        });
        let pos = self.heap.len();
        self.slots[slot as usize].entry = Some(Entry {
            fire_at,
            pos,
            payload,
        });
        self.heap.push(slot);
        self.sift_up(pos);
        self.rebalance_capacity();
        EventHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// The earliest scheduled event, if any.
    #[must_use]
    pub fn peek(&self) -> Option<(EventHandle, Instant)> {
        let slot = *self.heap.first()?;
        let s = &self.slots[slot as usize];
        let entry = s.entry.as_ref()?;
        Some((
            EventHandle {
                slot,
                generation: s.generation,
            },
            entry.fire_at,
        ))
    }

    /// Fire time of a scheduled event; `None` for stale handles.
    #[must_use]
    pub fn fire_time(&self, handle: EventHandle) -> Option<Instant> {
        let s = self.slots.get(handle.slot as usize)?;
        if s.generation != handle.generation {
            return None;
        }
        s.entry.as_ref().map(|e| e.fire_at)
    }

    /// Remove a scheduled event, returning its payload. Stale handles return
    /// `None`.
    pub fn remove(&mut self, handle: EventHandle) -> Option<T> {
        let s = self.slots.get(handle.slot as usize)?;
        if s.generation != handle.generation || s.entry.is_none() {
            return None;
        }
        Some(self.remove_slot(handle.slot))
    }

    /// Remove and return the earliest event if its fire time has elapsed.
    pub fn pop_due(&mut self, now: Instant) -> Option<(T, Instant)> {
        let (handle, fire_at) = self.peek()?;
        if fire_at > now {
            return None;
        }
        let payload = self.remove_slot(handle.slot);
        Some((payload, fire_at))
    }

    /// Remove every remaining event, invoking `f` on each payload in fire
    /// order. Used by shutdown to fire Aborted dispositions.
    pub fn drain_all(&mut self, mut f: impl FnMut(T)) {
        while let Some(&slot) = self.heap.first() {
            f(self.remove_slot(slot));
        }
    }

    fn remove_slot(&mut self, slot: u32) -> T {
        let entry = self.slots[slot as usize]
            .entry
            .take()
            .unwrap_or_else(|| unreachable!("remove_slot called on empty slot"));
        let pos = entry.pos;
        self.slots[slot as usize].generation = self.slots[slot as usize].generation.wrapping_add(1);
        self.free.push(slot);

        let last = self.heap.pop().unwrap_or_else(|| unreachable!());
        if pos < self.heap.len() {
            self.heap[pos] = last;
            self.entry_mut(last).pos = pos;
            self.sift_up(pos);
            self.sift_down(pos);
        }
        self.rebalance_capacity();
        entry.payload
    }

    fn entry_mut(&mut self, slot: u32) -> &mut Entry<T> {
        self.slots[slot as usize]
            .entry
            .as_mut()
            .unwrap_or_else(|| unreachable!("heap references empty slot"))
    }

    fn fire_at_of(&self, slot: u32) -> Instant {
        self.slots[slot as usize]
            .entry
            .as_ref()
            .map_or_else(|| unreachable!("heap references empty slot"), |e| e.fire_at)
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.fire_at_of(self.heap[pos]) >= self.fire_at_of(self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.heap.len()
                && self.fire_at_of(self.heap[right]) < self.fire_at_of(self.heap[left])
            {
                smallest = right;
            }
            if self.fire_at_of(self.heap[pos]) <= self.fire_at_of(self.heap[smallest]) {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let sa = self.heap[a];
        let sb = self.heap[b];
        self.entry_mut(sa).pos = a;
        self.entry_mut(sb).pos = b;
    }

    /// Grow by doubling when full; shrink by halving only while capacity is
    /// at least three times the live count. The asymmetry keeps bursty
    /// schedule/cancel churn from thrashing the allocation.
    fn rebalance_capacity(&mut self) {
        let need = self.heap.len().max(1);
        let mut cap = self.capacity.max(1);
        while cap < need {
            cap *= 2;
        }
        while cap / 2 >= MIN_CAPACITY && cap >= need.saturating_mul(3) {
            cap /= 2;
        }
        let cap = cap.max(MIN_CAPACITY);
        if cap > self.capacity {
            self.heap.reserve(cap - self.heap.len());
        } else if cap < self.capacity {
            self.heap.shrink_to(cap);
        }
        self.capacity = cap;
    }

    /// Verify the heap ordering and position backpointers. Test support.
    #[doc(hidden)]
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        for (pos, &slot) in self.heap.iter().enumerate() {
            let Some(entry) = self.slots[slot as usize].entry.as_ref() else {
                return false;
            };
            if entry.pos != pos {
                return false;
            }
            if pos > 0 {
                let parent = (pos - 1) / 2;
                if self.fire_at_of(self.heap[parent]) > entry.fire_at {
                    return false;
                }
            }
        }
        let live = self
            .slots
            .iter()
            .filter(|s| s.entry.is_some())
            .count();
        live == self.heap.len()
    }
}

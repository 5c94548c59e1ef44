//! Deadline min-heap
//!
//! Binary min-heap of `(due_ms, token)` entries keyed by absolute due time
//! on a millisecond clock. Tokens are small dense integers (fiber slab
//! indices), so the heap keeps a token-indexed position table and can
//! remove any entry in O(log n) when a fiber wakes through another path.
//!
//! An entry added with a negative duration carries the [`NEVER`] due time:
//! it occupies a slot and can be removed, but never expires.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Due time of entries that never expire
pub const NEVER: u64 = u64::MAX;

const NO_POS: u32 = u32::MAX;

/// Millisecond time source
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Monotonic clock measured from its own creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    due: u64,
    token: usize,
}

/// Min-heap of deadlines
pub struct TimerHeap<C: Clock = MonotonicClock> {
    heap: Vec<Entry>,
    /// `pos[token]` is the entry's heap index, or `NO_POS`
    pos: Vec<u32>,
    clock: C,
}

impl TimerHeap<MonotonicClock> {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }
}

impl Default for TimerHeap<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> TimerHeap<C> {
    pub fn with_clock(clock: C) -> Self {
        TimerHeap {
            heap: Vec::new(),
            pos: Vec::new(),
            clock,
        }
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn contains(&self, token: usize) -> bool {
        self.pos.get(token).is_some_and(|&p| p != NO_POS)
    }

    /// Due time of `token`, if present
    pub fn due_of(&self, token: usize) -> Option<u64> {
        let p = *self.pos.get(token)?;
        (p != NO_POS).then(|| self.heap[p as usize].due)
    }

    /// Arm `token` to expire `duration_ms` from now; negative means never.
    ///
    /// Re-adding a token that is already present replaces its deadline.
    pub fn add_item(&mut self, token: usize, duration_ms: i64) {
        self.remove_item(token);

        let due = if duration_ms < 0 {
            NEVER
        } else {
            // Keep finite deadlines distinguishable from NEVER
            self.now_ms()
                .saturating_add(duration_ms as u64)
                .min(NEVER - 1)
        };

        if self.pos.len() <= token {
            self.pos.resize(token + 1, NO_POS);
        }
        let at = self.heap.len();
        self.heap.push(Entry { due, token });
        self.pos[token] = at as u32;
        self.sift_up(at);
    }

    /// Remove `token` before it expires. Returns false if it was absent.
    pub fn remove_item(&mut self, token: usize) -> bool {
        let Some(&p) = self.pos.get(token) else {
            return false;
        };
        if p == NO_POS {
            return false;
        }
        self.remove_at(p as usize);
        true
    }

    /// Pop due entries in ascending due order into `out`, at most `capacity`.
    ///
    /// Returns how many were popped; call again while it returns `capacity`.
    pub fn remove_due_items(&mut self, out: &mut Vec<usize>, capacity: usize) -> usize {
        let now = self.now_ms();
        let mut count = 0;
        while count < capacity {
            match self.heap.first() {
                Some(top) if top.due != NEVER && top.due <= now => {
                    let token = top.token;
                    self.remove_at(0);
                    out.push(token);
                    count += 1;
                }
                _ => break,
            }
        }
        count
    }

    /// Milliseconds until the earliest finite deadline; -1 when there is none
    pub fn calculate_timeout(&self) -> i32 {
        match self.heap.first() {
            None => -1,
            Some(top) if top.due == NEVER => -1,
            Some(top) => {
                let left = top.due.saturating_sub(self.now_ms());
                left.min(i32::MAX as u64) as i32
            }
        }
    }

    fn remove_at(&mut self, at: usize) {
        let removed = self.heap.swap_remove(at);
        self.pos[removed.token] = NO_POS;
        if at < self.heap.len() {
            self.pos[self.heap[at].token] = at as u32;
            // The moved-in entry may belong above or below `at`
            if !self.sift_up(at) {
                self.sift_down(at);
            }
        }
    }

    /// Returns true if the entry moved
    fn sift_up(&mut self, mut at: usize) -> bool {
        let start = at;
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[parent].due <= self.heap[at].due {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
        at != start
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * at + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.heap[right].due < self.heap[left].due {
                right
            } else {
                left
            };
            if self.heap[at].due <= self.heap[child].due {
                break;
            }
            self.swap(at, child);
            at = child;
        }
    }

    #[inline]
    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos[self.heap[a].token] = a as u32;
        self.pos[self.heap[b].token] = b as u32;
    }
}

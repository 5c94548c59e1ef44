//! Slab allocator for fixed-size records
//!
//! Hands out stable `usize` indices for fiber records and I/O watchers.
//! Storage grows a chunk at a time and never shrinks; freed indices go on a
//! LIFO free stack so the most recently released (cache-warm) slot is the
//! next one reused.

use crate::list::{Link, LinkArena, Linked};

/// Default number of slots reserved per growth step
pub const DEFAULT_CHUNK: usize = 64;

/// Typed slab of `T` addressed by index
pub struct Slab<T> {
    /// Slot storage, `None` when vacant
    entries: Vec<Option<T>>,

    /// LIFO stack of vacant indices below `entries.len()`
    free: Vec<u32>,

    /// Slots added per growth step
    chunk: usize,

    /// Number of occupied slots
    len: usize,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self::with_chunk(DEFAULT_CHUNK)
    }

    /// Create a slab growing `chunk` slots at a time
    pub fn with_chunk(chunk: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            chunk: chunk.max(1),
            len: 0,
        }
    }

    /// Store `value`, returning its index
    ///
    /// Prefers the most recently freed slot; falls back to a fresh one,
    /// growing storage by one chunk when full.
    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            let idx = idx as usize;
            debug_assert!(self.entries[idx].is_none());
            self.entries[idx] = Some(value);
            return idx;
        }

        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve_exact(self.chunk);
            self.free.reserve(self.chunk);
        }
        self.entries.push(Some(value));
        self.entries.len() - 1
    }

    /// Take the value at `idx` out, freeing the slot
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.entries.get_mut(idx)?.take()?;
        self.free.push(idx as u32);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.entries.get_mut(idx).and_then(Option::as_mut)
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.get(idx).is_some()
    }

    /// Number of occupied slots
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::ops::Index<usize> for Slab<T> {
    type Output = T;

    #[track_caller]
    fn index(&self, idx: usize) -> &T {
        match self.get(idx) {
            Some(v) => v,
            None => panic!("vacant slab index {}", idx),
        }
    }
}

impl<T> core::ops::IndexMut<usize> for Slab<T> {
    #[track_caller]
    fn index_mut(&mut self, idx: usize) -> &mut T {
        match self.get_mut(idx) {
            Some(v) => v,
            None => panic!("vacant slab index {}", idx),
        }
    }
}

impl<T: Linked> LinkArena for Slab<T> {
    #[inline]
    fn link(&self, idx: usize) -> &Link {
        self[idx].link()
    }

    #[inline]
    fn link_mut(&mut self, idx: usize) -> &mut Link {
        self[idx].link_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sequential() {
        let mut slab = Slab::new();
        assert_eq!(slab.insert("a"), 0);
        assert_eq!(slab.insert("b"), 1);
        assert_eq!(slab.insert("c"), 2);
        assert_eq!(slab.len(), 3);
        assert_eq!(slab[1], "b");
    }

    #[test]
    fn test_remove_reuse_lifo() {
        let mut slab = Slab::new();
        let a = slab.insert(10);
        let b = slab.insert(20);
        let _c = slab.insert(30);

        assert_eq!(slab.remove(a), Some(10));
        assert_eq!(slab.remove(b), Some(20));
        assert_eq!(slab.len(), 1);

        // Most recently freed comes back first
        assert_eq!(slab.insert(40), b);
        assert_eq!(slab.insert(50), a);
        // Free stack exhausted, so the next slot is fresh
        assert_eq!(slab.insert(60), 3);
    }

    #[test]
    fn test_double_remove() {
        let mut slab = Slab::new();
        let a = slab.insert(1);
        assert_eq!(slab.remove(a), Some(1));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.remove(99), None);
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_chunked_growth() {
        let mut slab = Slab::with_chunk(8);
        for i in 0..20u8 {
            assert_eq!(slab.insert(i), i as usize);
        }
        assert_eq!(slab.len(), 20);
        assert_eq!(slab[19], 19);
    }

    #[test]
    #[should_panic(expected = "vacant slab index")]
    fn test_index_vacant_panics() {
        let slab: Slab<u32> = Slab::new();
        let _ = slab[0];
    }
}

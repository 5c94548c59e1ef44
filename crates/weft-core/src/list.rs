//! Intrusive index-linked FIFO queues
//!
//! A record embeds one [`Link`] per queue family it can belong to and lives
//! in an arena (normally a [`Slab`](crate::slab::Slab)). A [`List`] is only
//! head/tail/len; all link surgery goes through the arena, so insert, remove
//! and splice stay O(1) without any record addresses being held.
//!
//! A link can be on at most one list at a time. Putting a record on a
//! second list while it is still queued is a logic error and panics.

const NIL: u32 = u32::MAX;

/// Embedded queue linkage
#[derive(Debug, Clone, Copy)]
pub struct Link {
    prev: u32,
    next: u32,
    queued: bool,
}

impl Link {
    pub const fn new() -> Self {
        Link {
            prev: NIL,
            next: NIL,
            queued: false,
        }
    }

    /// True while the record sits on some list
    #[inline]
    pub const fn is_queued(&self) -> bool {
        self.queued
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Record type with an embedded link
pub trait Linked {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// Index-addressed storage of linked records
pub trait LinkArena {
    fn link(&self, idx: usize) -> &Link;
    fn link_mut(&mut self, idx: usize) -> &mut Link;
}

#[inline]
fn to_idx(raw: u32) -> Option<usize> {
    if raw == NIL {
        None
    } else {
        Some(raw as usize)
    }
}

/// FIFO queue of arena indices
#[derive(Debug, Clone, Copy)]
pub struct List {
    head: u32,
    tail: u32,
    len: usize,
}

impl List {
    pub const fn new() -> Self {
        List {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        to_idx(self.head)
    }

    /// Append `idx` at the tail
    pub fn push_back<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: usize) {
        let old_tail = self.tail;
        {
            let link = arena.link_mut(idx);
            assert!(!link.queued, "record {} is already queued", idx);
            link.prev = old_tail;
            link.next = NIL;
            link.queued = true;
        }
        match to_idx(old_tail) {
            Some(t) => arena.link_mut(t).next = idx as u32,
            None => self.head = idx as u32,
        }
        self.tail = idx as u32;
        self.len += 1;
    }

    /// Insert `idx` at the head
    pub fn push_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: usize) {
        let old_head = self.head;
        {
            let link = arena.link_mut(idx);
            assert!(!link.queued, "record {} is already queued", idx);
            link.prev = NIL;
            link.next = old_head;
            link.queued = true;
        }
        match to_idx(old_head) {
            Some(h) => arena.link_mut(h).prev = idx as u32,
            None => self.tail = idx as u32,
        }
        self.head = idx as u32;
        self.len += 1;
    }

    /// Detach and return the head
    pub fn pop_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A) -> Option<usize> {
        let idx = self.front()?;
        self.remove(arena, idx);
        Some(idx)
    }

    /// Detach `idx`, which must be on this list
    pub fn remove<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: usize) {
        let (prev, next) = {
            let link = arena.link_mut(idx);
            debug_assert!(link.queued, "record {} is not queued", idx);
            let pn = (link.prev, link.next);
            *link = Link::new();
            pn
        };
        match to_idx(prev) {
            Some(p) => arena.link_mut(p).next = next,
            None => self.head = next,
        }
        match to_idx(next) {
            Some(n) => arena.link_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Move every element of `other` onto the tail of `self`, leaving `other` empty
    pub fn append<A: LinkArena + ?Sized>(&mut self, arena: &mut A, other: &mut List) {
        let Some(other_head) = other.front() else {
            return;
        };
        match to_idx(self.tail) {
            Some(t) => {
                arena.link_mut(t).next = other.head;
                arena.link_mut(other_head).prev = self.tail;
            }
            None => self.head = other.head,
        }
        self.tail = other.tail;
        self.len += other.len;
        *other = List::new();
    }

    /// Walk the list front to back
    pub fn iter<'a, A: LinkArena + ?Sized>(&self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            arena,
            cursor: self.head,
        }
    }

    /// Collect the indices front to back
    pub fn to_vec<A: LinkArena + ?Sized>(&self, arena: &A) -> Vec<usize> {
        self.iter(arena).collect()
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, A: LinkArena + ?Sized> {
    arena: &'a A,
    cursor: u32,
}

impl<'a, A: LinkArena + ?Sized> Iterator for Iter<'a, A> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = to_idx(self.cursor)?;
        self.cursor = self.arena.link(idx).next;
        Some(idx)
    }
}

//! Fiber identifier type

use core::fmt;

/// Identifier of a fiber record
///
/// The low half indexes the scheduler's fiber slab; the high half is a
/// generation counter bumped every time the record is handed to a new
/// closure. A stale id (held past the fiber's death) therefore never
/// matches the record's current generation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Build an id from a slab index and generation
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        FiberId(((generation as u64) << 32) | index as u64)
    }

    /// Slab index of the fiber record
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    /// Generation of the fiber record when this id was issued
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({}#{})", self.index(), self.generation())
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

//! Fiber stack regions
//!
//! One mapping per fiber holds both the stack and the fiber's saved
//! machine context:
//!
//! ```text
//! low                                                   high
//! +-------------+---------------------------+-----------+
//! | guard page  | stack (grows down)     <- | SavedRegs |
//! | PROT_NONE   |                           |           |
//! +-------------+---------------------------+-----------+
//! ```
//!
//! Regions are recycled through [`StackPool`], which keeps a bounded LIFO
//! cache of released mappings.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix::{map_region, page_size, unmap_region};
    }
}

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use weft_core::{kdebug, kerror, MemoryError, SchedResult};

use crate::arch::SavedRegs;

/// A mapped stack region with its context header
pub struct StackRegion {
    base: NonNull<u8>,
    size: usize,
}

impl StackRegion {
    /// Map a region of at least `size` bytes (rounded up to pages)
    pub fn new(size: usize) -> SchedResult<StackRegion> {
        let page = page_size();
        let size = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::InvalidSize(size))?;
        // Guard page, context header, and at least one usable page
        if size < 3 * page {
            return Err(MemoryError::InvalidSize(size).into());
        }
        let base = map_region(size, page)?;
        Ok(StackRegion { base, size })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Lowest address of the mapping (the guard page)
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Saved-context header at the top of the region
    #[inline]
    pub fn regs_ptr(&self) -> *mut SavedRegs {
        let end = self.base.as_ptr() as usize + self.size;
        let at = (end - size_of::<SavedRegs>()) & !(align_of::<SavedRegs>().max(16) - 1);
        at as *mut SavedRegs
    }

    /// Initial stack pointer, just below the header
    #[inline]
    pub fn stack_top(&self) -> *mut u8 {
        (self.regs_ptr() as usize & !0xF) as *mut u8
    }

    /// Bytes of stack between the guard page and the header
    #[inline]
    pub fn usable(&self) -> usize {
        self.stack_top() as usize - (self.base.as_ptr() as usize + page_size())
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        if let Err(errno) = unmap_region(self.base, self.size) {
            kerror!("munmap of stack region {:p} failed: {}", self.base, errno);
        }
    }
}

impl std::fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// Source of fixed-size stack regions
pub struct StackPool {
    region_size: usize,
    cache: Vec<StackRegion>,
    cache_limit: usize,
    mapped: usize,
}

impl StackPool {
    pub fn new(region_size: usize, cache_limit: usize) -> Self {
        StackPool {
            region_size,
            cache: Vec::with_capacity(cache_limit),
            cache_limit,
            mapped: 0,
        }
    }

    /// Take a cached region, or map a new one
    pub fn acquire(&mut self) -> SchedResult<StackRegion> {
        if let Some(region) = self.cache.pop() {
            return Ok(region);
        }
        let region = StackRegion::new(self.region_size)?;
        self.mapped += 1;
        kdebug!("mapped stack region {:p} ({} bytes)", region.base(), region.size());
        Ok(region)
    }

    /// Return a region; kept for reuse while the cache has room
    pub fn release(&mut self, region: StackRegion) {
        if self.cache.len() < self.cache_limit {
            self.cache.push(region);
        } else {
            self.mapped -= 1;
            drop(region);
        }
    }

    #[inline]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Regions currently mapped, whether cached or in use
    #[inline]
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        let region = StackRegion::new(64 * 1024).unwrap();
        let base = region.base() as usize;
        let top = region.stack_top() as usize;
        let regs = region.regs_ptr() as usize;

        assert_eq!(region.size(), 64 * 1024);
        assert_eq!(top % 16, 0);
        assert!(top <= regs);
        assert!(regs + size_of::<SavedRegs>() <= base + region.size());
        assert!(region.usable() > 64 * 1024 - 2 * page_size());
    }

    #[test]
    fn test_region_rounds_to_pages() {
        let page = page_size();
        let region = StackRegion::new(5 * page + 1).unwrap();
        assert_eq!(region.size(), 6 * page);
    }

    #[test]
    fn test_region_too_small() {
        assert!(StackRegion::new(page_size()).is_err());
    }

    #[test]
    fn test_stack_is_writable() {
        let region = StackRegion::new(32 * 1024).unwrap();
        let top = region.stack_top();
        unsafe {
            let low = region.base().add(page_size());
            low.write(0xAB);
            top.sub(1).write(0xCD);
            region.regs_ptr().write(SavedRegs::default());
            assert_eq!(low.read(), 0xAB);
        }
    }

    #[test]
    fn test_pool_reuses_lifo() {
        let mut pool = StackPool::new(32 * 1024, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.mapped(), 3);

        let (a_base, b_base) = (a.base(), b.base());
        pool.release(a);
        pool.release(b);
        pool.release(c); // over the cache limit, unmapped
        assert_eq!(pool.cached(), 2);
        assert_eq!(pool.mapped(), 2);

        assert_eq!(pool.acquire().unwrap().base(), b_base);
        assert_eq!(pool.acquire().unwrap().base(), a_base);
    }
}

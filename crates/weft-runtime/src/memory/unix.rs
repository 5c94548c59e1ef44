//! Unix memory mapping for stack regions

use std::ptr::NonNull;
use std::sync::OnceLock;

use nix::errno::Errno;
use weft_core::{kerror, MemoryError, SchedResult};

pub(super) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Map `size` bytes read/write and turn the lowest `guard` bytes into a
/// no-access guard page.
pub(super) fn map_region(size: usize, guard: usize) -> SchedResult<NonNull<u8>> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        kerror!("mmap of {} bytes failed: {}", size, Errno::last());
        return Err(MemoryError::AllocationFailed.into());
    }

    // Stack overflow runs into this page and faults
    let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
    if ret != 0 {
        let errno = Errno::last();
        unsafe { libc::munmap(base, size) };
        kerror!("mprotect of guard page failed: {}", errno);
        return Err(MemoryError::ProtectionFailed.into());
    }

    NonNull::new(base as *mut u8).ok_or_else(|| MemoryError::AllocationFailed.into())
}

pub(super) fn unmap_region(base: NonNull<u8>, size: usize) -> Result<(), Errno> {
    let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };
    Errno::result(ret).map(drop)
}

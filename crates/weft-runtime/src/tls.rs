//! Thread-local handle to the running scheduler
//!
//! Set for exactly the duration of [`Scheduler::run`] by an [`Entered`]
//! guard, so free functions called from fiber code can reach the scheduler
//! without it being passed down explicitly. Outside a run the slot is null.

use std::cell::Cell;
use std::ptr;

use weft_core::kfatal;

use crate::scheduler::Scheduler;

thread_local! {
    static CURRENT: Cell<*const Scheduler> = const { Cell::new(ptr::null()) };
}

/// Restores the previous scheduler pointer on drop
pub(crate) struct Entered {
    prev: *const Scheduler,
}

/// Make `sched` the current scheduler until the guard drops
pub(crate) fn enter(sched: &Scheduler) -> Entered {
    let prev = CURRENT.with(|c| c.replace(sched as *const Scheduler));
    Entered { prev }
}

impl Drop for Entered {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

/// Run `f` with the scheduler running on this thread, if any
#[inline]
pub fn with_current<R>(f: impl FnOnce(&Scheduler) -> R) -> Option<R> {
    let sched = CURRENT.with(|c| c.get());
    if sched.is_null() {
        return None;
    }
    // The pointer is published only while `run` borrows the scheduler
    Some(f(unsafe { &*sched }))
}

/// Like [`with_current`], but aborts when no scheduler is running
#[inline]
pub fn expect_current<R>(what: &str, f: impl FnOnce(&Scheduler) -> R) -> R {
    match with_current(f) {
        Some(r) => r,
        None => kfatal!("{} called outside a running scheduler", what),
    }
}

/// Check if a scheduler is running on this thread
#[inline]
pub fn in_scheduler() -> bool {
    CURRENT.with(|c| !c.get().is_null())
}

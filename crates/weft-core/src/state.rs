//! Fiber state and I/O event types

/// State of a fiber
///
/// Exactly one state describes a live fiber at any instant. The queue a
/// fiber sits on follows from its state: `Ready` fibers are on the ready
/// queue, `Dead` ones on the dead queue, `AwaitingIo` ones on a watcher's
/// awaiter queue, `Sleeping` ones only in the timer heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Dispatched, never executed
    Fresh,

    /// Queued on the ready queue after having run
    Ready,

    /// Owns the control thread
    Running,

    /// Queued on a watcher, possibly also holding a deadline
    AwaitingIo,

    /// Only in the timer heap
    Sleeping,

    /// Off every scheduler queue; someone else must call resume
    Suspended,

    /// Finished, queued for destruction or reuse
    Dead,
}

impl FiberState {
    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, FiberState::Dead)
    }
}

/// Readiness direction a fiber can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoEvent {
    Readability = 0,
    Writability = 1,
}

impl IoEvent {
    /// Both directions, in awaiter-queue order
    pub const ALL: [IoEvent; 2] = [IoEvent::Readability, IoEvent::Writability];

    /// Index of this direction's awaiter queue
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Interest bit in the OS-level event mask
    #[inline]
    pub const fn flag(self) -> u32 {
        match self {
            IoEvent::Readability => libc::EPOLLIN as u32,
            IoEvent::Writability => libc::EPOLLOUT as u32,
        }
    }
}

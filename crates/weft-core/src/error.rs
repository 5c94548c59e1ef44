//! Error types for the weft scheduler

use core::fmt;
use std::io;

use crate::id::FiberId;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// A deadline elapsed before the awaited event (ETIME)
    TimedOut,

    /// The awaited descriptor was unwatched while the fiber waited (EBADF)
    DescriptorClosed,

    /// The descriptor reported an error or hangup condition (EPIPE)
    Hangup,

    /// Any other OS error number delivered through a resume status
    Os(i32),

    /// Descriptor is already registered with the multiplexer
    AlreadyWatched(i32),

    /// Descriptor is not registered with the multiplexer
    NotWatched(i32),

    /// Fiber id refers to a record that has since been reused or freed
    StaleFiber(FiberId),

    /// Invalid fiber state for the operation
    InvalidState,

    /// Configuration rejected by validation
    InvalidConfig(String),

    /// Memory allocation/mapping failed
    Memory(MemoryError),

    /// Worker thread error
    Worker(WorkerError),
}

impl SchedError {
    /// Decode a negative resume status into an error.
    ///
    /// Returns `None` for non-negative statuses (fresh start or success).
    pub fn from_status(status: i32) -> Option<SchedError> {
        if status >= 0 {
            return None;
        }
        Some(match -status {
            libc::ETIME => SchedError::TimedOut,
            libc::EBADF => SchedError::DescriptorClosed,
            libc::EPIPE => SchedError::Hangup,
            errno => SchedError::Os(errno),
        })
    }

    /// OS error number carried by this error
    pub fn errno(&self) -> i32 {
        match self {
            SchedError::TimedOut => libc::ETIME,
            SchedError::DescriptorClosed => libc::EBADF,
            SchedError::Hangup => libc::EPIPE,
            SchedError::Os(errno) => *errno,
            SchedError::AlreadyWatched(_) => libc::EEXIST,
            SchedError::NotWatched(_) => libc::EBADF,
            SchedError::StaleFiber(_) => libc::ESRCH,
            SchedError::InvalidState | SchedError::InvalidConfig(_) => libc::EINVAL,
            SchedError::Memory(_) => libc::ENOMEM,
            SchedError::Worker(_) => libc::EAGAIN,
        }
    }

    /// Resume status delivering this error to a suspended fiber
    #[inline]
    pub fn to_status(&self) -> i32 {
        -self.errno()
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::TimedOut => write!(f, "operation timed out"),
            SchedError::DescriptorClosed => write!(f, "descriptor closed while waiting"),
            SchedError::Hangup => write!(f, "descriptor hung up"),
            SchedError::Os(errno) => write!(f, "os error {}", errno),
            SchedError::AlreadyWatched(fd) => write!(f, "fd {} is already watched", fd),
            SchedError::NotWatched(fd) => write!(f, "fd {} is not watched", fd),
            SchedError::StaleFiber(id) => write!(f, "fiber {} no longer exists", id),
            SchedError::InvalidState => write!(f, "invalid fiber state"),
            SchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
            SchedError::Worker(e) => write!(f, "worker error: {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<SchedError> for io::Error {
    fn from(e: SchedError) -> Self {
        match e {
            SchedError::TimedOut
            | SchedError::DescriptorClosed
            | SchedError::Hangup
            | SchedError::Os(_) => io::Error::from_raw_os_error(e.errno()),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed
    ProtectionFailed,

    /// Requested region size is unusable
    InvalidSize(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize(size) => write!(f, "invalid region size {}", size),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,

    /// Notification descriptor setup failed
    NotifierFailed,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::NotifierFailed => write!(f, "notification descriptor setup failed"),
        }
    }
}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::Worker(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", SchedError::TimedOut), "operation timed out");

        let e = SchedError::Memory(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: memory allocation failed");
    }

    #[test]
    fn test_error_conversion() {
        let sched_err: SchedError = WorkerError::SpawnFailed.into();
        assert!(matches!(sched_err, SchedError::Worker(WorkerError::SpawnFailed)));
    }

    #[test]
    fn test_status_decoding() {
        assert_eq!(SchedError::from_status(0), None);
        assert_eq!(SchedError::from_status(1), None);
        assert_eq!(SchedError::from_status(-libc::ETIME), Some(SchedError::TimedOut));
        assert_eq!(
            SchedError::from_status(-libc::EBADF),
            Some(SchedError::DescriptorClosed)
        );
        assert_eq!(
            SchedError::from_status(-libc::ECONNRESET),
            Some(SchedError::Os(libc::ECONNRESET))
        );
    }

    #[test]
    fn test_status_roundtrip() {
        for e in [SchedError::TimedOut, SchedError::DescriptorClosed, SchedError::Hangup] {
            assert_eq!(SchedError::from_status(e.to_status()), Some(e));
        }
    }

    #[test]
    fn test_into_io_error() {
        let io: io::Error = SchedError::TimedOut.into();
        assert_eq!(io.raw_os_error(), Some(libc::ETIME));

        let io: io::Error = SchedError::NotWatched(7).into();
        assert_eq!(io.kind(), io::ErrorKind::Other);
        assert!(io.to_string().contains("fd 7"));
    }
}

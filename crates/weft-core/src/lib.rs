//! # weft-core
//!
//! Platform-agnostic building blocks of the weft fiber scheduler.
//!
//! Nothing here touches machine context or the OS readiness API; those
//! live in `weft-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier (slab index + generation)
//! - `state` - Fiber state and I/O direction enums
//! - `slab` - Slab allocator for fiber records and watchers
//! - `list` - Intrusive index-linked FIFO queues
//! - `timer` - Deadline min-heap and clocks
//! - `error` - Error types and resume-status decoding
//! - `kprint` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod slab;
pub mod list;
pub mod timer;
pub mod error;
pub mod kprint;
pub mod env;

pub use id::FiberId;
pub use state::{FiberState, IoEvent};
pub use slab::Slab;
pub use list::{Link, LinkArena, Linked, List};
pub use timer::{Clock, ManualClock, MonotonicClock, TimerHeap, NEVER};
pub use error::{MemoryError, SchedError, SchedResult, WorkerError};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_size, env_is_set};

/// Resume status codes delivered to a suspended fiber
pub mod status {
    /// Fiber has not started yet
    pub const FRESH: i32 = 0;

    /// Resumed without error; negative values carry `-errno`
    pub const OK: i32 = 1;
}

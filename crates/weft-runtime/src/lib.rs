//! # weft-runtime
//!
//! Linux runtime of the weft fiber scheduler.
//!
//! This crate provides:
//! - Stack regions with guard pages (mmap)
//! - Context switching (architecture-specific assembly)
//! - epoll-based readiness multiplexing
//! - The single-threaded run loop and fiber lifecycle
//! - A worker-thread bridge for blocking work

pub mod config;
pub mod memory;
pub mod arch;
pub mod poll;
pub mod scheduler;
pub mod bridge;
pub mod tls;

// Re-exports
pub use config::SchedulerConfig;
pub use scheduler::{FiberExit, Scheduler};
pub use bridge::{AsyncBridge, EventFd, Task};
pub use poll::IoPoll;
pub use memory::{StackPool, StackRegion};
pub use tls::{in_scheduler, with_current};

#[cfg(not(target_os = "linux"))]
compile_error!("weft-runtime requires Linux (epoll, eventfd)");

//! # weft - cooperative fibers on one thread
//!
//! Many lightweight fibers multiplexed over a single OS thread. A fiber
//! suspends when it would block on I/O, a timer or an explicit yield, and
//! resumes when the awaited condition becomes true.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{call, sleep_ms, yield_now, Runtime, SchedulerConfig};
//!
//! fn main() {
//!     let mut runtime = Runtime::new(SchedulerConfig::default()).unwrap();
//!
//!     runtime.block_on(|| {
//!         call(|| {
//!             sleep_ms(50);
//!             println!("A");
//!         });
//!         call(|| {
//!             yield_now();
//!             println!("B");
//!         });
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        call(), yield_now(), sleep(), weft::io::read()       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │        FIFO ready queue, timer heap, fiber lifecycle        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────────┐
//!    │  IoPoll   │      │  Stacks   │      │  AsyncBridge  │
//!    │  (epoll)  │      │  (mmap)   │      │  (threads)    │
//!    └───────────┘      └───────────┘      └───────────────┘
//! ```
//!
//! Every free function below must be called from inside a fiber of a
//! running [`Runtime`]; called elsewhere they abort the process.

pub mod io;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

// Re-export core types
pub use weft_core::{FiberId, FiberState, IoEvent, MemoryError, SchedError, SchedResult, WorkerError};

// Re-export kprint macros for debug logging
pub use weft_core::{kdebug, kerror, kfatal, kinfo, kprintln, ktrace, kwarn};
pub use weft_core::kprint::{self, init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use weft_core::{env_get, env_get_bool, env_get_opt, env_get_size, env_is_set};

// Re-export runtime types
pub use weft_runtime::{in_scheduler, FiberExit, Scheduler, SchedulerConfig, Task};

use weft_runtime::tls;

/// Owns a scheduler and drives it
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    /// Validate `config` and set up the scheduler
    ///
    /// Nothing runs until [`run`](Self::run) or [`block_on`](Self::block_on).
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        Ok(Self {
            scheduler: Scheduler::new(config)?,
        })
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Queue a fiber to start on the next run
    pub fn call<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        self.scheduler.dispatch(f)
    }

    /// Run until every fiber has finished
    pub fn run(&mut self) {
        self.scheduler.run();
    }

    /// Run `f` as the initial fiber, then every fiber it transitively
    /// starts, and return `f`'s value.
    ///
    /// Returns `None` if `f` ended through [`exit`].
    pub fn block_on<F, T>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        self.scheduler.dispatch(move || {
            let value = f();
            *out.borrow_mut() = Some(value);
        });
        self.scheduler.run();
        let value = slot.borrow_mut().take();
        value
    }
}

#[inline]
fn with_scheduler<R>(what: &str, f: impl FnOnce(&Scheduler) -> R) -> R {
    tls::expect_current(what, f)
}

fn duration_ms(timeout: Option<Duration>) -> i64 {
    match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i64::MAX as u128) as i64,
    }
}

/// Start a new fiber; it runs after the current one suspends
#[inline]
pub fn call<F>(f: F) -> FiberId
where
    F: FnOnce() + 'static,
{
    with_scheduler("call", |s| s.dispatch(f))
}

/// Let every other ready fiber run once
#[inline]
pub fn yield_now() {
    with_scheduler("yield_now", Scheduler::yield_now)
}

/// Suspend the current fiber for `duration`
pub fn sleep(duration: Duration) {
    with_scheduler("sleep", |s| s.sleep(duration_ms(Some(duration))))
}

#[inline]
pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms))
}

/// End the current fiber from any call depth, unwinding its stack
pub fn exit() -> ! {
    with_scheduler("exit", |s| -> () { s.exit_current() });
    unreachable!("exit_current returned")
}

/// Park the current fiber until another fiber calls [`resume`] with its id
pub fn suspend() {
    with_scheduler("suspend", Scheduler::suspend)
}

/// Wake a fiber parked by [`suspend`] (or sleeping)
pub fn resume(id: FiberId) -> SchedResult<()> {
    with_scheduler("resume", |s| s.resume(id))
}

/// Id of the running fiber, or `None` outside a fiber
pub fn current_fiber() -> Option<FiberId> {
    tls::with_current(Scheduler::current_fiber).flatten()
}

/// Check if currently executing within a fiber
#[inline]
pub fn in_fiber() -> bool {
    current_fiber().is_some()
}

/// Run `tasks` in order on a worker thread, suspending until all are done
pub fn await_tasks(tasks: Vec<Task>) {
    with_scheduler("await_tasks", |s| s.await_tasks(tasks))
}

/// Run `f` on a worker thread and return its result
///
/// ```ignore
/// let meta = weft::blocking(|| std::fs::metadata("/etc/hosts"))??;
/// ```
pub fn blocking<F, R>(f: F) -> SchedResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    with_scheduler("blocking", |s| s.blocking(f))
}

//! Scheduler configuration
//!
//! Compile-time defaults come from `build.rs` (see [`defaults`]); runtime
//! overrides come from `WEFT_*` environment variables.
//!
//! # Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (only through `from_env()` / `default()`)
//! 3. `WEFT_CONFIG_RS` file given at build time
//! 4. Library defaults
//!
//! ```rust,ignore
//! use weft_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .async_workers(8)
//!     .stack_size(512 * 1024);
//! config.validate()?;
//! ```

pub mod defaults;

use weft_core::env::{env_get, env_get_bool, env_get_size};
use weft_core::{kinfo, SchedError, SchedResult};

/// Smallest usable fiber stack
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Scheduler configuration with builder pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Bytes per fiber stack region, guard page included
    pub stack_size: usize,
    /// Event buffer size for one readiness wait
    pub max_events: usize,
    /// Most timer expiries handled per run-loop iteration
    pub timer_batch: usize,
    /// Worker threads of the async bridge
    pub async_workers: usize,
    /// Growth step of the watcher slab
    pub watcher_chunk: usize,
    /// Released stack regions kept mapped for reuse
    pub stack_cache: usize,
    /// Trace every run-loop iteration
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `WEFT_STACK_SIZE` - bytes, accepts k/m suffix
    /// - `WEFT_MAX_EVENTS`
    /// - `WEFT_TIMER_BATCH`
    /// - `WEFT_ASYNC_WORKERS`
    /// - `WEFT_WATCHER_CHUNK`
    /// - `WEFT_STACK_CACHE`
    /// - `WEFT_DEBUG` - 0/1
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get_size("WEFT_STACK_SIZE", defaults::STACK_SIZE),
            max_events: env_get("WEFT_MAX_EVENTS", defaults::MAX_EVENTS),
            timer_batch: env_get("WEFT_TIMER_BATCH", defaults::TIMER_BATCH),
            async_workers: env_get("WEFT_ASYNC_WORKERS", defaults::ASYNC_WORKERS),
            watcher_chunk: env_get("WEFT_WATCHER_CHUNK", defaults::WATCHER_CHUNK),
            stack_cache: env_get("WEFT_STACK_CACHE", defaults::STACK_CACHE),
            debug_logging: env_get_bool("WEFT_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Compile-time defaults only, ignoring the environment
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            max_events: defaults::MAX_EVENTS,
            timer_batch: defaults::TIMER_BATCH,
            async_workers: defaults::ASYNC_WORKERS,
            watcher_chunk: defaults::WATCHER_CHUNK,
            stack_cache: defaults::STACK_CACHE,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn timer_batch(mut self, n: usize) -> Self {
        self.timer_batch = n;
        self
    }

    pub fn async_workers(mut self, n: usize) -> Self {
        self.async_workers = n;
        self
    }

    pub fn watcher_chunk(mut self, n: usize) -> Self {
        self.watcher_chunk = n;
        self
    }

    pub fn stack_cache(mut self, n: usize) -> Self {
        self.stack_cache = n;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    pub fn validate(&self) -> SchedResult<()> {
        let bad = |msg: &str| Err(SchedError::InvalidConfig(msg.to_string()));
        if self.stack_size < MIN_STACK_SIZE {
            return bad("stack_size must be >= 16KB");
        }
        if self.max_events == 0 {
            return bad("max_events must be > 0");
        }
        if self.max_events > i32::MAX as usize {
            return bad("max_events must fit in an i32");
        }
        if self.timer_batch == 0 {
            return bad("timer_batch must be > 0");
        }
        if self.async_workers == 0 {
            return bad("async_workers must be > 0");
        }
        if self.watcher_chunk == 0 {
            return bad("watcher_chunk must be > 0");
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn log(&self) {
        kinfo!(
            "config: stack_size={} max_events={} timer_batch={} async_workers={} \
             watcher_chunk={} stack_cache={} debug_logging={}",
            self.stack_size,
            self.max_events,
            self.timer_batch,
            self.async_workers,
            self.watcher_chunk,
            self.stack_cache,
            self.debug_logging
        );
    }
}

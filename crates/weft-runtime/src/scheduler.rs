//! Fiber scheduler
//!
//! A single-threaded run loop over fibers that each own an mmap'd stack.
//! Every suspension switches back to the run loop's own context, and the
//! run loop picks the next fiber from the ready queue, so FIFO order is
//! decided in one place.
//!
//! All scheduler state sits behind one `RefCell`. A borrow is never held
//! across a context switch; fiber code re-borrows after it is resumed.
//!
//! A fiber is always in exactly one of:
//! - the ready queue (`Fresh` or `Ready`)
//! - the dead queue (`Dead`)
//! - a watcher's awaiter queue (`AwaitingIo`, plus a timer entry)
//! - the timer heap only (`Sleeping`)
//! - nowhere (`Suspended`, waiting for [`Scheduler::resume`])
//! - running (`Running`, at most one)

use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell, UnsafeCell};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use weft_core::kprint::{self, LogLevel};
use weft_core::list::{Link, Linked, List};
use weft_core::{
    kdebug, kfatal, kwarn, status, FiberId, FiberState, IoEvent, SchedError, SchedResult, Slab,
    TimerHeap, WorkerError,
};

use crate::arch::{self, SavedRegs};
use crate::bridge::{AsyncBridge, Task};
use crate::config::SchedulerConfig;
use crate::memory::{StackPool, StackRegion};
use crate::poll::{IoPoll, Wakeups};
use crate::tls;

/// Unwind payload of [`Scheduler::exit_current`]
///
/// Caught at the top of every fiber; never reported as a panic.
#[derive(Debug)]
pub struct FiberExit;

type Entry = Box<dyn FnOnce() + 'static>;

/// Fiber record
///
/// The saved machine context lives at the top of `stack`, so the record
/// plus one mapping hold everything a fiber needs.
pub(crate) struct Fiber {
    link: Link,
    generation: u32,
    stack: StackRegion,
    entry: Option<Entry>,
    state: FiberState,
    /// 0 fresh, 1 resumed normally, `-errno` resumed with an error
    status: i32,
    awaiting: Option<(RawFd, IoEvent)>,
}

impl Fiber {
    fn new(stack: StackRegion, entry: Entry, generation: u32) -> Self {
        Fiber {
            link: Link::new(),
            generation,
            stack,
            entry: Some(entry),
            state: FiberState::Fresh,
            status: status::FRESH,
            awaiting: None,
        }
    }
}

impl Linked for Fiber {
    fn link(&self) -> &Link {
        &self.link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

struct Inner {
    fibers: Slab<Fiber>,
    /// Generation for the next record created at each slab index
    generations: Vec<u32>,
    ready: List,
    dead: List,
    timer: TimerHeap,
    poll: IoPoll,
    stacks: StackPool,
    current: Option<usize>,
    due: Vec<usize>,
}

impl Inner {
    #[inline]
    fn id_of(&self, idx: usize) -> FiberId {
        FiberId::new(idx as u32, self.fibers[idx].generation)
    }

    /// Slab index of a live fiber
    fn lookup(&self, id: FiberId) -> SchedResult<usize> {
        match self.fibers.get(id.index()) {
            Some(f) if f.generation == id.generation() && !f.state.is_dead() => Ok(id.index()),
            _ => Err(SchedError::StaleFiber(id)),
        }
    }

    /// Queue `idx` at the ready tail with `status`, detached from I/O and timers
    fn wake(&mut self, idx: usize, status: i32) {
        self.timer.remove_item(idx);
        let fiber = &mut self.fibers[idx];
        fiber.awaiting = None;
        fiber.status = status;
        fiber.state = FiberState::Ready;
        self.ready.push_back(&mut self.fibers, idx);
    }

    /// Mark the running fiber as parked in `state` before switching out
    fn park(&mut self, idx: usize, state: FiberState) {
        let fiber = &mut self.fibers[idx];
        fiber.status = status::OK;
        fiber.state = state;
    }
}

/// Single-threaded cooperative fiber scheduler
pub struct Scheduler {
    inner: RefCell<Inner>,
    /// Run-loop context while a fiber executes
    context: UnsafeCell<SavedRegs>,
    config: SchedulerConfig,
    running: Cell<bool>,
    bridge: OnceCell<AsyncBridge>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        config.validate()?;
        if config.debug_logging {
            kprint::raise_log_level(LogLevel::Debug);
            config.log();
        }
        let poll = IoPoll::new(config.max_events, config.watcher_chunk)?;
        Ok(Scheduler {
            inner: RefCell::new(Inner {
                fibers: Slab::new(),
                generations: Vec::new(),
                ready: List::new(),
                dead: List::new(),
                timer: TimerHeap::new(),
                poll,
                stacks: StackPool::new(config.stack_size, config.stack_cache),
                current: None,
                due: Vec::with_capacity(config.timer_batch),
            }),
            context: UnsafeCell::new(SavedRegs::default()),
            config,
            running: Cell::new(false),
            bridge: OnceCell::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Queue `f` to run as a new fiber; nothing executes until the run loop
    /// reaches it.
    ///
    /// A dead fiber's record and stack are reused when one is waiting.
    pub fn dispatch<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        let entry: Entry = Box::new(f);
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let idx = match inner.dead.pop_front(&mut inner.fibers) {
            Some(idx) => {
                let fiber = &mut inner.fibers[idx];
                fiber.generation = fiber.generation.wrapping_add(1);
                fiber.entry = Some(entry);
                fiber.state = FiberState::Fresh;
                fiber.status = status::FRESH;
                fiber.awaiting = None;
                kdebug!("reusing fiber record {}", idx);
                idx
            }
            None => {
                let stack = match inner.stacks.acquire() {
                    Ok(stack) => stack,
                    Err(e) => kfatal!("cannot allocate fiber stack: {}", e),
                };
                let idx = inner.fibers.insert(Fiber::new(stack, entry, 0));
                inner.fibers[idx].generation = inner.generations.get(idx).copied().unwrap_or(0);
                kdebug!("created fiber {}", idx);
                idx
            }
        };
        inner.ready.push_back(&mut inner.fibers, idx);
        inner.id_of(idx)
    }

    /// Run fibers until none remain
    ///
    /// Returns immediately when nothing has been dispatched. Must not be
    /// called from inside a fiber.
    pub fn run(&self) {
        if self.running.get() {
            kfatal!("Scheduler::run called while already running");
        }
        if self.fiber_count() == 0 {
            return;
        }

        let _entered = tls::enter(self);
        self.running.set(true);
        let mut iteration: u64 = 0;

        loop {
            while let Some(idx) = self.pop_ready() {
                self.execute(idx);
            }
            self.reap_dead();
            if self.fiber_count() == 0 {
                break;
            }
            self.poll_io();
            self.expire_timers();

            iteration += 1;
            if self.config.debug_logging {
                let inner = self.inner.borrow();
                kdebug!(
                    "run loop {}: fibers={} ready={} timers={} watchers={}",
                    iteration,
                    inner.fibers.len(),
                    inner.ready.len(),
                    inner.timer.len(),
                    inner.poll.watcher_count()
                );
            }
        }

        self.running.set(false);
        kdebug!("run loop finished after {} iterations", iteration);
    }

    fn pop_ready(&self) -> Option<usize> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ready.pop_front(&mut inner.fibers)
    }

    /// Switch into fiber `idx` and return when it next suspends or dies
    fn execute(&self, idx: usize) {
        let regs = {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(idx);
            let fiber = &mut inner.fibers[idx];
            let regs = fiber.stack.regs_ptr();
            if fiber.state == FiberState::Fresh {
                unsafe {
                    arch::init_context(
                        &mut *regs,
                        fiber.stack.stack_top(),
                        fiber_entry,
                        self as *const Scheduler as usize,
                    );
                }
            }
            fiber.state = FiberState::Running;
            regs
        };
        unsafe { arch::switch_context(self.context.get(), regs) };
        self.inner.borrow_mut().current = None;
    }

    /// Save the running fiber's context and return to the run loop.
    ///
    /// Returns the resume status once something re-queues the fiber.
    fn switch_out(&self, idx: usize) -> i32 {
        let regs = self.inner.borrow().fibers[idx].stack.regs_ptr();
        unsafe { arch::switch_context(regs, self.context.get()) };
        self.inner.borrow().fibers[idx].status
    }

    fn reap_dead(&self) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        while let Some(idx) = inner.dead.pop_front(&mut inner.fibers) {
            let Some(fiber) = inner.fibers.remove(idx) else {
                continue;
            };
            if inner.generations.len() <= idx {
                inner.generations.resize(idx + 1, 0);
            }
            inner.generations[idx] = fiber.generation.wrapping_add(1);
            inner.stacks.release(fiber.stack);
            kdebug!("destroyed fiber {}", idx);
        }
    }

    /// Block in the multiplexer until the next deadline, then queue every
    /// fiber whose descriptor fired.
    fn poll_io(&self) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let mut wakeups = Wakeups::default();
        loop {
            let timeout = inner.timer.calculate_timeout();
            if timeout < 0 && inner.poll.watcher_count() == 0 {
                kwarn!(
                    "{} fiber(s) blocked with no timer or descriptor to wake them",
                    inner.fibers.len()
                );
            }
            if inner.poll.wait_for_events(&mut inner.fibers, timeout, &mut wakeups) {
                break;
            }
        }
        while let Some(idx) = wakeups.ready.pop_front(&mut inner.fibers) {
            inner.wake(idx, status::OK);
        }
        let hangup = SchedError::Hangup.to_status();
        while let Some(idx) = wakeups.hangup.pop_front(&mut inner.fibers) {
            inner.wake(idx, hangup);
        }
    }

    /// Queue overdue fibers at the head of the ready queue, earliest first
    fn expire_timers(&self) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let mut due = std::mem::take(&mut inner.due);
        due.clear();
        inner.timer.remove_due_items(&mut due, self.config.timer_batch);

        for &idx in due.iter().rev() {
            let awaiting = {
                let fiber = &mut inner.fibers[idx];
                fiber.state = FiberState::Ready;
                fiber.awaiting.take()
            };
            if let Some((fd, event)) = awaiting {
                if let Err(e) = inner.poll.remove_event_awaiter(&mut inner.fibers, fd, event, idx) {
                    kfatal!("timed-out fiber {} lost its watcher: {}", idx, e);
                }
                inner.fibers[idx].status = SchedError::TimedOut.to_status();
            }
            inner.ready.push_front(&mut inner.fibers, idx);
        }
        inner.due = due;
    }

    // ------------------------------------------------------------------
    // Current-fiber operations
    // ------------------------------------------------------------------

    fn current_index(&self, what: &str) -> usize {
        let current = self.inner.borrow().current;
        match current {
            Some(idx) => idx,
            None => kfatal!("{} called with no fiber running", what),
        }
    }

    /// Let every other ready fiber run once; a no-op when none is ready
    pub fn yield_now(&self) {
        let idx = self.current_index("yield_now");
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.ready.is_empty() {
                return;
            }
            inner.park(idx, FiberState::Ready);
            inner.ready.push_back(&mut inner.fibers, idx);
        }
        self.switch_out(idx);
    }

    /// Suspend the running fiber for `duration_ms`
    ///
    /// A negative duration sleeps until another fiber calls [`resume`](Self::resume).
    pub fn sleep(&self, duration_ms: i64) {
        let idx = self.current_index("sleep");
        {
            let mut inner = self.inner.borrow_mut();
            inner.timer.add_item(idx, duration_ms);
            inner.park(idx, FiberState::Sleeping);
        }
        self.switch_out(idx);
    }

    /// Suspend until `fd` is ready for `event`, the timeout elapses
    /// (`TimedOut`), or the descriptor is unwatched (`DescriptorClosed`).
    ///
    /// `timeout_ms < 0` waits forever. The descriptor must already be
    /// watched.
    pub fn await_io(&self, fd: RawFd, event: IoEvent, timeout_ms: i64) -> SchedResult<()> {
        let idx = self.current_index("await_io");
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            inner.poll.add_event_awaiter(&mut inner.fibers, fd, event, idx)?;
            inner.timer.add_item(idx, timeout_ms);
            inner.park(idx, FiberState::AwaitingIo);
            inner.fibers[idx].awaiting = Some((fd, event));
        }
        match SchedError::from_status(self.switch_out(idx)) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Park the running fiber off every queue until [`resume`](Self::resume)
    pub fn suspend(&self) {
        let idx = self.current_index("suspend");
        self.inner.borrow_mut().park(idx, FiberState::Suspended);
        self.switch_out(idx);
    }

    /// Re-queue a suspended (or sleeping) fiber at the ready tail
    pub fn resume(&self, id: FiberId) -> SchedResult<()> {
        let mut inner = self.inner.borrow_mut();
        let idx = inner.lookup(id)?;
        if inner.current == Some(idx) {
            return Err(SchedError::InvalidState);
        }
        match inner.fibers[idx].state {
            FiberState::Suspended | FiberState::Sleeping => {}
            _ => return Err(SchedError::InvalidState),
        }
        inner.wake(idx, status::OK);
        Ok(())
    }

    /// Abandon the running fiber's closure from any call depth
    ///
    /// Unwinds the fiber's stack (running destructors) and then kills it.
    pub fn exit_current(&self) -> ! {
        self.current_index("exit_current");
        panic::resume_unwind(Box::new(FiberExit))
    }

    /// Mark the running fiber dead and leave it for good
    ///
    /// Frames still live on the fiber's stack are abandoned without running
    /// their destructors; use [`exit_current`](Self::exit_current) to unwind.
    pub fn kill_current(&self) -> ! {
        let idx = self.current_index("kill_current");
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let fiber = &mut inner.fibers[idx];
            fiber.entry = None;
            fiber.state = FiberState::Dead;
            fiber.status = status::FRESH;
            inner.dead.push_back(&mut inner.fibers, idx);
        }
        self.switch_out(idx);
        kfatal!("dead fiber {} was resumed", idx)
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    /// Register `fd` with the multiplexer; each descriptor has one owner
    pub fn watch_io(&self, fd: RawFd) -> SchedResult<()> {
        self.inner.borrow_mut().poll.create_watcher(fd)
    }

    /// Withdraw `fd`, waking every fiber blocked on it with `DescriptorClosed`
    pub fn unwatch_io(&self, fd: RawFd) -> SchedResult<()> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let mut woken = List::new();
        inner.poll.destroy_watcher(&mut inner.fibers, fd, &mut woken)?;
        let closed = SchedError::DescriptorClosed.to_status();
        while let Some(idx) = woken.pop_front(&mut inner.fibers) {
            inner.wake(idx, closed);
        }
        Ok(())
    }

    #[inline]
    pub fn watcher_exists(&self, fd: RawFd) -> bool {
        self.inner.borrow().poll.watcher_exists(fd)
    }

    /// Number of fibers queued on `fd` for `event`
    pub fn awaiter_count(&self, fd: RawFd, event: IoEvent) -> usize {
        self.inner.borrow().poll.awaiter_count(fd, event)
    }

    // ------------------------------------------------------------------
    // Worker-thread bridge
    // ------------------------------------------------------------------

    pub(crate) fn bridge(&self) -> &AsyncBridge {
        self.bridge.get_or_init(|| match AsyncBridge::new(self.config.async_workers) {
            Ok(bridge) => bridge,
            Err(e) => kfatal!("cannot start async bridge: {}", e),
        })
    }

    /// Run `tasks` in order on a worker thread; the running fiber resumes
    /// after the last one finishes.
    pub fn await_tasks(&self, tasks: Vec<Task>) {
        self.bridge().await_tasks(self, tasks);
    }

    /// Run `f` on a worker thread and return its value
    ///
    /// Fails with `Worker(Panicked)` if `f` panics.
    pub fn blocking<F, R>(&self, f: F) -> SchedResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        self.await_tasks(vec![Box::new(move || {
            let value = f();
            *out.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        })]);
        let value = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        value.ok_or(SchedError::Worker(WorkerError::Panicked))
    }

    /// Jobs submitted to the bridge whose fibers have not resumed yet
    pub fn outstanding_jobs(&self) -> usize {
        self.bridge.get().map_or(0, AsyncBridge::outstanding)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Live fibers, including dead ones not yet reaped
    #[inline]
    pub fn fiber_count(&self) -> usize {
        self.inner.borrow().fibers.len()
    }

    #[inline]
    pub fn ready_len(&self) -> usize {
        self.inner.borrow().ready.len()
    }

    /// Entries in the timer heap, including never-expiring ones
    #[inline]
    pub fn timer_len(&self) -> usize {
        self.inner.borrow().timer.len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Id of the running fiber
    pub fn current_fiber(&self) -> Option<FiberId> {
        let inner = self.inner.borrow();
        inner.current.map(|idx| inner.id_of(idx))
    }

    /// State of fiber `id`, if it is still alive
    pub fn fiber_state(&self, id: FiberId) -> Option<FiberState> {
        let inner = self.inner.borrow();
        let idx = inner.lookup(id).ok()?;
        Some(inner.fibers[idx].state)
    }

    /// Stack regions currently mapped (in use or cached)
    pub fn mapped_stacks(&self) -> usize {
        self.inner.borrow().stacks.mapped()
    }

    /// Run the running fiber's closure and retire the fiber
    fn enter_fiber(&self) -> ! {
        let idx = self.current_index("fiber entry");
        let entry = self.inner.borrow_mut().fibers[idx].entry.take();
        if let Some(entry) = entry {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                if !payload.is::<FiberExit>() {
                    let id = self.inner.borrow().id_of(idx);
                    kfatal!("fiber {} panicked: {}", id, panic_message(payload.as_ref()));
                }
            }
        }
        self.kill_current()
    }
}

/// First frame on every fiber stack
unsafe extern "C" fn fiber_entry(sched: usize) -> ! {
    let sched = &*(sched as *const Scheduler);
    sched.enter_fiber()
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::new().stack_size(64 * 1024)).unwrap()
    }

    fn with<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        tls::expect_current("test", f)
    }

    type Log = Rc<std::cell::RefCell<Vec<String>>>;

    fn log() -> Log {
        Rc::new(std::cell::RefCell::new(Vec::new()))
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_run_without_fibers() {
        let sched = scheduler();
        sched.run();
        assert!(!sched.is_running());
    }

    #[test]
    fn test_fifo_round_robin() {
        let sched = scheduler();
        let seen = log();
        for n in 0..3 {
            let seen = seen.clone();
            sched.dispatch(move || {
                for _ in 0..3 {
                    seen.borrow_mut().push(n.to_string());
                    with(|s| s.yield_now());
                }
            });
        }
        sched.run();
        assert_eq!(seen.borrow().join(""), "012012012");
        assert_eq!(sched.fiber_count(), 0);
    }

    #[test]
    fn test_lone_yield_is_noop() {
        let sched = scheduler();
        let seen = log();
        let s2 = seen.clone();
        sched.dispatch(move || {
            with(|s| {
                assert_eq!(s.ready_len(), 0);
                s.yield_now();
            });
            s2.borrow_mut().push("done".into());
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["done"]);
    }

    #[test]
    fn test_sleep_orders_after_yield() {
        let sched = scheduler();
        let seen = log();
        let a = seen.clone();
        sched.dispatch(move || {
            with(|s| s.sleep(50));
            a.borrow_mut().push("A".into());
        });
        let b = seen.clone();
        sched.dispatch(move || {
            with(|s| s.yield_now());
            b.borrow_mut().push("B".into());
        });
        let start = Instant::now();
        sched.run();
        assert_eq!(*seen.borrow(), vec!["B", "A"]);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_suspend_and_resume() {
        let sched = scheduler();
        let seen = log();
        let a = seen.clone();
        let sleeper = sched.dispatch(move || {
            a.borrow_mut().push("suspend".into());
            with(|s| s.suspend());
            a.borrow_mut().push("resumed".into());
        });
        let b = seen.clone();
        sched.dispatch(move || {
            with(|s| {
                assert_eq!(s.fiber_state(sleeper), Some(FiberState::Suspended));
                b.borrow_mut().push("resume".into());
                s.resume(sleeper).unwrap();
                assert_eq!(s.resume(sleeper), Err(SchedError::InvalidState));
            });
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["suspend", "resume", "resumed"]);
    }

    #[test]
    fn test_resume_self_is_rejected() {
        let sched = scheduler();
        sched.dispatch(|| {
            with(|s| {
                let me = s.current_fiber().unwrap();
                assert_eq!(s.resume(me), Err(SchedError::InvalidState));
            });
        });
        sched.run();
    }

    #[test]
    fn test_resume_wakes_forever_sleeper() {
        let sched = scheduler();
        let seen = log();
        let a = seen.clone();
        let sleeper = sched.dispatch(move || {
            with(|s| s.sleep(-1));
            a.borrow_mut().push("woke".into());
        });
        sched.dispatch(move || {
            with(|s| {
                assert_eq!(s.timer_len(), 1);
                s.resume(sleeper).unwrap();
                assert_eq!(s.timer_len(), 0);
            });
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["woke"]);
    }

    #[test]
    fn test_exit_current_unwinds() {
        struct Flag(Log);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.borrow_mut().push("dropped".into());
            }
        }

        fn deep(depth: u32) {
            if depth == 0 {
                with(|s| s.exit_current());
            }
            deep(depth - 1);
        }

        let sched = scheduler();
        let seen = log();
        let a = seen.clone();
        sched.dispatch(move || {
            let _flag = Flag(a.clone());
            deep(5);
            a.borrow_mut().push("unreachable".into());
        });
        let b = seen.clone();
        sched.dispatch(move || b.borrow_mut().push("next".into()));
        sched.run();
        assert_eq!(*seen.borrow(), vec!["dropped", "next"]);
        assert_eq!(sched.fiber_count(), 0);
    }

    #[test]
    fn test_dead_fiber_is_reused() {
        let sched = scheduler();
        let seen = log();
        let a = seen.clone();
        let first = sched.dispatch(move || a.borrow_mut().push("first".into()));
        let b = seen.clone();
        sched.dispatch(move || {
            with(|s| {
                // `first` is dead but not reaped yet
                assert_eq!(s.fiber_state(first), None);
                let c = b.clone();
                let second = s.dispatch(move || c.borrow_mut().push("second".into()));
                assert_eq!(second.index(), first.index());
                assert_ne!(second, first);
                assert_eq!(s.resume(first), Err(SchedError::StaleFiber(first)));
            });
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
        assert_eq!(sched.mapped_stacks(), 2);
    }

    #[test]
    fn test_generation_survives_reaping() {
        let sched = scheduler();
        let first = sched.dispatch(|| {});
        sched.run();
        let second = sched.dispatch(|| {});
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        sched.run();
    }

    #[test]
    fn test_await_io_times_out() {
        let sched = scheduler();
        let (r, w) = pipe();
        sched.watch_io(r).unwrap();
        let seen = log();
        let a = seen.clone();
        sched.dispatch(move || {
            with(|s| {
                let start = Instant::now();
                let res = s.await_io(r, IoEvent::Readability, 30);
                assert_eq!(res, Err(SchedError::TimedOut));
                assert!(start.elapsed() >= Duration::from_millis(25));
                assert_eq!(s.awaiter_count(r, IoEvent::Readability), 0);
                assert_eq!(s.timer_len(), 0);
            });
            a.borrow_mut().push("timeout".into());
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["timeout"]);
        sched.unwatch_io(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_await_io_ready_before_timeout() {
        let sched = scheduler();
        let (r, w) = pipe();
        sched.watch_io(r).unwrap();
        let seen = log();
        let a = seen.clone();
        sched.dispatch(move || {
            with(|s| {
                assert_eq!(s.await_io(r, IoEvent::Readability, 1000), Ok(()));
                assert_eq!(s.timer_len(), 0);
                // No stale deadline may fire later
                s.sleep(20);
            });
            a.borrow_mut().push("readable".into());
        });
        sched.dispatch(move || {
            with(|s| s.sleep(10));
            let n = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
            assert_eq!(n, 1);
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["readable"]);
        sched.unwatch_io(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_unwatch_wakes_all_awaiters() {
        let sched = scheduler();
        let (r, w) = pipe();
        sched.watch_io(r).unwrap();
        let seen = log();
        for _ in 0..3 {
            let a = seen.clone();
            sched.dispatch(move || {
                let res = with(|s| s.await_io(r, IoEvent::Readability, -1));
                assert_eq!(res, Err(SchedError::DescriptorClosed));
                a.borrow_mut().push("closed".into());
            });
        }
        sched.dispatch(move || {
            with(|s| {
                assert_eq!(s.awaiter_count(r, IoEvent::Readability), 3);
                s.unwatch_io(r).unwrap();
                assert!(!s.watcher_exists(r));
                assert_eq!(s.unwatch_io(r), Err(SchedError::NotWatched(r)));
                s.watch_io(r).unwrap();
            });
        });
        sched.run();
        assert_eq!(seen.borrow().len(), 3);
        assert!(sched.watcher_exists(r));
        sched.unwatch_io(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_hangup_is_reported() {
        let sched = scheduler();
        let (r, w) = pipe();
        sched.watch_io(r).unwrap();
        sched.dispatch(move || {
            let res = with(|s| s.await_io(r, IoEvent::Readability, -1));
            assert_eq!(res, Err(SchedError::Hangup));
        });
        sched.dispatch(move || unsafe {
            libc::close(w);
        });
        sched.run();
        sched.unwatch_io(r).unwrap();
        unsafe { libc::close(r) };
    }

    #[test]
    fn test_await_unwatched_fd() {
        let sched = scheduler();
        sched.dispatch(|| {
            let res = with(|s| s.await_io(12345, IoEvent::Writability, 10));
            assert_eq!(res, Err(SchedError::NotWatched(12345)));
        });
        sched.run();
    }

    #[test]
    fn test_double_watch_rejected() {
        let sched = scheduler();
        let (r, w) = pipe();
        sched.watch_io(r).unwrap();
        assert_eq!(sched.watch_io(r), Err(SchedError::AlreadyWatched(r)));
        sched.unwatch_io(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_many_fibers() {
        let sched = scheduler();
        let count = Rc::new(Cell::new(0));
        for _ in 0..200 {
            let count = count.clone();
            sched.dispatch(move || {
                with(|s| s.yield_now());
                count.set(count.get() + 1);
            });
        }
        sched.run();
        assert_eq!(count.get(), 200);
        assert_eq!(sched.fiber_count(), 0);
    }
}

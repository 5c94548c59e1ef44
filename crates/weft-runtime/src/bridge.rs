//! Worker-thread bridge
//!
//! Lets a fiber hand blocking work to a pool of OS threads without stalling
//! the scheduler thread. The submitting fiber suspends; a worker runs the
//! tasks in order, pushes the fiber's id onto a lock-free completion queue
//! and bumps an eventfd. A drain fiber, alive only while jobs are
//! outstanding, waits on that eventfd and resumes the finished fibers.
//!
//! Workers never touch scheduler state. The only things crossing threads are
//! the job queue (mutex + condvar), the completion queue, and the eventfd.

use std::cell::Cell;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use weft_core::{kdebug, kerror, kfatal, FiberId, IoEvent, SchedResult, WorkerError};

use crate::scheduler::{panic_message, Scheduler};
use crate::tls;

/// A unit of blocking work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Tasks submitted together by one fiber
struct Job {
    fiber: FiberId,
    tasks: Vec<Task>,
}

/// Counting eventfd used to wake the scheduler from worker threads
///
/// Several notifications before a read coalesce into one wakeup.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn create() -> Result<Self, Errno> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(EventFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn notify(&self) -> Result<(), Errno> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            match Errno::last() {
                // Counter saturated: a wakeup is already pending
                Errno::EAGAIN => return Ok(()),
                errno => return Err(errno),
            }
        }
        Ok(())
    }

    /// Reset the counter, returning how many notifications it held
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

struct Pending {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    available: Condvar,
    completed: SegQueue<FiberId>,
    notifier: EventFd,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool of worker threads plus the scheduler-side completion bookkeeping
pub struct AsyncBridge {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// Jobs whose fibers have not been resumed yet
    outstanding: Cell<usize>,
}

impl AsyncBridge {
    /// Start `workers` threads named `weft-worker-N`
    pub fn new(workers: usize) -> SchedResult<Self> {
        let notifier = EventFd::create().map_err(|errno| {
            kerror!("eventfd failed: {}", errno);
            WorkerError::NotifierFailed
        })?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            completed: SegQueue::new(),
            notifier,
        });

        // Threads spawned before a failure are joined by Drop
        let mut bridge = AsyncBridge {
            shared,
            workers: Vec::with_capacity(workers),
            outstanding: Cell::new(0),
        };
        for id in 0..workers {
            let shared = Arc::clone(&bridge.shared);
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{}", id))
                .spawn(move || worker_loop(shared, id))
                .map_err(|e| {
                    kerror!("cannot spawn bridge worker {}: {}", id, e);
                    WorkerError::SpawnFailed
                })?;
            bridge.workers.push(handle);
        }
        kdebug!("async bridge started with {} workers", workers);
        Ok(bridge)
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Descriptor the drain fiber waits on
    #[inline]
    pub fn notify_fd(&self) -> RawFd {
        self.shared.notifier.fd()
    }

    /// Submit `tasks` for the running fiber and suspend it until a worker
    /// has run all of them.
    pub(crate) fn await_tasks(&self, sched: &Scheduler, tasks: Vec<Task>) {
        let Some(fiber) = sched.current_fiber() else {
            kfatal!("await_tasks called with no fiber running");
        };

        self.shared.lock().jobs.push_back(Job { fiber, tasks });
        self.shared.available.notify_one();

        let outstanding = self.outstanding.get();
        self.outstanding.set(outstanding + 1);
        if outstanding == 0 {
            sched.dispatch(|| tls::expect_current("bridge drain", |s| s.bridge().drain(s)));
        }
        sched.suspend();
    }

    /// Body of the drain fiber
    fn drain(&self, sched: &Scheduler) {
        let fd = self.notify_fd();
        if let Err(e) = sched.watch_io(fd) {
            kfatal!("cannot watch bridge eventfd {}: {}", fd, e);
        }
        while self.outstanding.get() > 0 {
            if let Err(e) = sched.await_io(fd, IoEvent::Readability, -1) {
                kfatal!("waiting on bridge eventfd failed: {}", e);
            }
            self.shared.notifier.drain();
            while let Some(fiber) = self.shared.completed.pop() {
                self.outstanding.set(self.outstanding.get() - 1);
                if let Err(e) = sched.resume(fiber) {
                    kerror!("cannot resume fiber {} after bridge job: {}", fiber, e);
                }
            }
        }
        if let Err(e) = sched.unwatch_io(fd) {
            kfatal!("cannot unwatch bridge eventfd {}: {}", fd, e);
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                kerror!("bridge worker exited by panic");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    kdebug!("bridge worker {} started", id);
    loop {
        let job = {
            let mut pending = shared.lock();
            loop {
                if let Some(job) = pending.jobs.pop_front() {
                    break job;
                }
                if pending.shutdown {
                    kdebug!("bridge worker {} exiting", id);
                    return;
                }
                pending = shared
                    .available
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        for (n, task) in job.tasks.into_iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                kerror!(
                    "task {} of fiber {} panicked: {}",
                    n,
                    job.fiber,
                    panic_message(payload.as_ref())
                );
            }
        }

        shared.completed.push(job.fiber);
        if let Err(errno) = shared.notifier.notify() {
            kfatal!("eventfd write failed: {}", errno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use weft_core::{SchedError, WorkerError};

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(
            SchedulerConfig::new()
                .stack_size(64 * 1024)
                .async_workers(workers),
        )
        .unwrap()
    }

    fn with<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        tls::expect_current("test", f)
    }

    #[test]
    fn test_eventfd_coalesces() {
        let efd = EventFd::create().unwrap();
        assert_eq!(efd.drain(), 0);
        efd.notify().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 3);
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_tasks_run_in_order() {
        let sched = scheduler(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();
        sched.dispatch(move || {
            let tasks: Vec<Task> = (0..5)
                .map(|n| {
                    let out = out.clone();
                    Box::new(move || out.lock().unwrap().push(n)) as Task
                })
                .collect();
            with(|s| s.await_tasks(tasks));
            // Every task finished before the fiber resumed
            assert_eq!(out.lock().unwrap().len(), 5);
        });
        sched.run();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sched.outstanding_jobs(), 0);
    }

    #[test]
    fn test_scheduler_keeps_running_during_job() {
        let sched = scheduler(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let a = seen.clone();
        sched.dispatch(move || {
            with(|s| {
                s.await_tasks(vec![Box::new(|| thread::sleep(Duration::from_millis(50)))])
            });
            a.borrow_mut().push("blocking done");
        });
        let b = seen.clone();
        sched.dispatch(move || {
            for _ in 0..3 {
                with(|s| s.sleep(5));
            }
            b.borrow_mut().push("ticker done");
        });
        sched.run();
        assert_eq!(*seen.borrow(), vec!["ticker done", "blocking done"]);
    }

    #[test]
    fn test_many_fibers_share_workers() {
        let sched = scheduler(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let resumed = Rc::new(Cell::new(0));
        for _ in 0..32 {
            let hits = hits.clone();
            let resumed = resumed.clone();
            sched.dispatch(move || {
                with(|s| {
                    s.await_tasks(vec![Box::new(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })])
                });
                resumed.set(resumed.get() + 1);
            });
        }
        sched.run();
        assert_eq!(hits.load(Ordering::SeqCst), 32);
        assert_eq!(resumed.get(), 32);
    }

    #[test]
    fn test_blocking_returns_value() {
        let sched = scheduler(2);
        let got = Rc::new(Cell::new(0));
        let g = got.clone();
        sched.dispatch(move || {
            let v = with(|s| s.blocking(|| 6 * 7)).unwrap();
            g.set(v);
        });
        sched.run();
        assert_eq!(got.get(), 42);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let sched = scheduler(1);
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        sched.dispatch(move || {
            let res: SchedResult<u32> = with(|s| s.blocking(|| panic!("worker boom")));
            assert_eq!(res, Err(SchedError::Worker(WorkerError::Panicked)));
            // The worker survived and takes the next job
            assert_eq!(with(|s| s.blocking(|| 7)), Ok(7));
            d.set(true);
        });
        sched.run();
        assert!(done.get());
    }

    #[test]
    fn test_drain_fiber_unwatches_when_idle() {
        let sched = scheduler(1);
        sched.dispatch(|| {
            with(|s| s.await_tasks(Vec::new()));
        });
        sched.run();
        let fd = sched.bridge().notify_fd();
        assert!(!sched.watcher_exists(fd));
        assert_eq!(sched.fiber_count(), 0);

        // A second run starts a fresh drain fiber
        sched.dispatch(|| {
            with(|s| s.await_tasks(Vec::new()));
        });
        sched.run();
        assert!(!sched.watcher_exists(fd));
    }

    #[test]
    fn test_drop_joins_workers() {
        let bridge = AsyncBridge::new(3).unwrap();
        assert_eq!(bridge.worker_count(), 3);
        assert_eq!(bridge.outstanding(), 0);
        drop(bridge);
    }
}

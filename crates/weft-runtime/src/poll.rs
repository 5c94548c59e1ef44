//! epoll-based I/O multiplexer
//!
//! One [`Watcher`] per registered descriptor records the interest mask the
//! kernel currently has (`current`), the mask the queued awaiters want
//! (`pending`), and a FIFO of awaiting fibers per direction. Changes to
//! `pending` only put the watcher on a dirty list; the kernel registration
//! is reconciled in one pass at the top of [`IoPoll::wait_for_events`].
//!
//! Awaiters are fiber slab indices linked through the fiber's own
//! [`Link`], so every method that moves awaiters takes the fiber arena.
//! Readiness is handed over one fiber per direction per wait: only the head
//! awaiter of a fired direction is woken, the rest stay queued for the next
//! report. Error/hangup conditions wake every awaiter.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use weft_core::list::{Link, LinkArena, Linked, List};
use weft_core::{kdebug, kfatal, ktrace, IoEvent, SchedError, SchedResult, Slab};

/// Per-descriptor readiness bookkeeping
pub struct Watcher {
    fd: RawFd,
    /// Interest registered with the kernel
    current: u32,
    /// Interest wanted by queued awaiters
    pending: u32,
    awaiters: [List; 2],
    /// Membership in the dirty list
    dirty: Link,
}

impl Watcher {
    fn new(fd: RawFd) -> Self {
        Watcher {
            fd,
            current: 0,
            pending: 0,
            awaiters: [List::new(), List::new()],
            dirty: Link::new(),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn awaiter_count(&self, event: IoEvent) -> usize {
        self.awaiters[event.index()].len()
    }
}

impl Linked for Watcher {
    fn link(&self) -> &Link {
        &self.dirty
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.dirty
    }
}

/// Fibers woken by one [`IoPoll::wait_for_events`] call
#[derive(Debug, Default)]
pub struct Wakeups {
    /// Woken because their direction became ready
    pub ready: List,
    /// Woken by an error or hangup condition on their descriptor
    pub hangup: List,
}

const HANGUP_FLAGS: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Readiness multiplexer over one epoll instance
pub struct IoPoll {
    epfd: OwnedFd,
    watchers: Slab<Watcher>,
    by_fd: HashMap<RawFd, usize>,
    dirty: List,
    events: Vec<libc::epoll_event>,
}

impl IoPoll {
    pub fn new(max_events: usize, watcher_chunk: usize) -> SchedResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(SchedError::Os(Errno::last() as i32));
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(IoPoll {
            epfd,
            watchers: Slab::with_chunk(watcher_chunk),
            by_fd: HashMap::new(),
            dirty: List::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    #[inline]
    pub fn watcher_exists(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    #[inline]
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Number of fibers queued on `fd` for `event`
    pub fn awaiter_count(&self, fd: RawFd, event: IoEvent) -> usize {
        self.by_fd
            .get(&fd)
            .map_or(0, |&w| self.watchers[w].awaiter_count(event))
    }

    /// Interest mask currently registered with the kernel for `fd`
    pub fn registered_flags(&self, fd: RawFd) -> Option<u32> {
        self.by_fd.get(&fd).map(|&w| self.watchers[w].current)
    }

    /// Start tracking `fd`. Each descriptor has a single owner.
    pub fn create_watcher(&mut self, fd: RawFd) -> SchedResult<()> {
        if fd < 0 {
            return Err(SchedError::Os(libc::EBADF));
        }
        if self.by_fd.contains_key(&fd) {
            return Err(SchedError::AlreadyWatched(fd));
        }
        let idx = self.watchers.insert(Watcher::new(fd));
        self.by_fd.insert(fd, idx);
        kdebug!("watching fd {}", fd);
        Ok(())
    }

    /// Stop tracking `fd`
    ///
    /// Every queued awaiter is moved onto `woken`; the caller delivers the
    /// closed-descriptor status. Any kernel registration is withdrawn.
    pub fn destroy_watcher<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        fd: RawFd,
        woken: &mut List,
    ) -> SchedResult<()> {
        let idx = self.by_fd.remove(&fd).ok_or(SchedError::NotWatched(fd))?;
        if self.watchers[idx].dirty.is_queued() {
            self.dirty.remove(&mut self.watchers, idx);
        }
        let Some(mut watcher) = self.watchers.remove(idx) else {
            kfatal!("watcher table out of sync for fd {}", fd);
        };
        for queue in watcher.awaiters.iter_mut() {
            woken.append(arena, queue);
        }
        if watcher.current != 0 {
            let mut ev = libc::epoll_event { events: 0, u64: 0 };
            let ret = unsafe {
                libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev)
            };
            if ret < 0 {
                match Errno::last() {
                    // Already closed behind our back; the kernel dropped it
                    Errno::EBADF | Errno::ENOENT => {
                        kdebug!("fd {} was closed before unwatch", fd);
                    }
                    errno => kfatal!("epoll_ctl(DEL, fd {}) failed: {}", fd, errno),
                }
            }
        }
        kdebug!("unwatched fd {}", fd);
        Ok(())
    }

    /// Queue fiber `fiber` on `fd` for `event`
    pub fn add_event_awaiter<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        fd: RawFd,
        event: IoEvent,
        fiber: usize,
    ) -> SchedResult<()> {
        let idx = *self.by_fd.get(&fd).ok_or(SchedError::NotWatched(fd))?;
        let watcher = &mut self.watchers[idx];
        watcher.awaiters[event.index()].push_back(arena, fiber);
        if watcher.pending & event.flag() == 0 {
            watcher.pending |= event.flag();
            self.mark_dirty(idx);
        }
        Ok(())
    }

    /// Detach one specific awaiter from `fd`'s `event` queue
    pub fn remove_event_awaiter<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        fd: RawFd,
        event: IoEvent,
        fiber: usize,
    ) -> SchedResult<()> {
        let idx = *self.by_fd.get(&fd).ok_or(SchedError::NotWatched(fd))?;
        self.detach(arena, idx, event, fiber);
        Ok(())
    }

    fn detach<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: usize, event: IoEvent, fiber: usize) {
        let watcher = &mut self.watchers[idx];
        let queue = &mut watcher.awaiters[event.index()];
        queue.remove(arena, fiber);
        if queue.is_empty() {
            watcher.pending &= !event.flag();
            self.mark_dirty(idx);
        }
    }

    /// Move every awaiter of watcher `idx` onto `out`
    fn drain_awaiters<A: LinkArena + ?Sized>(&mut self, arena: &mut A, idx: usize, out: &mut List) {
        let watcher = &mut self.watchers[idx];
        if watcher.pending == 0 {
            return;
        }
        for queue in watcher.awaiters.iter_mut() {
            out.append(arena, queue);
        }
        watcher.pending = 0;
        self.mark_dirty(idx);
    }

    #[inline]
    fn mark_dirty(&mut self, idx: usize) {
        if !self.watchers[idx].dirty.is_queued() {
            self.dirty.push_back(&mut self.watchers, idx);
        }
    }

    /// Bring kernel registrations in line with `pending` for dirty watchers
    fn reconcile(&mut self) {
        while let Some(idx) = self.dirty.pop_front(&mut self.watchers) {
            let watcher = &mut self.watchers[idx];
            if watcher.current == watcher.pending {
                continue;
            }
            let (op, name) = if watcher.current == 0 {
                (libc::EPOLL_CTL_ADD, "ADD")
            } else if watcher.pending == 0 {
                (libc::EPOLL_CTL_DEL, "DEL")
            } else {
                (libc::EPOLL_CTL_MOD, "MOD")
            };
            let mut ev = libc::epoll_event {
                events: watcher.pending,
                u64: idx as u64,
            };
            let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, watcher.fd, &mut ev) };
            if ret < 0 {
                kfatal!("epoll_ctl({}, fd {}) failed: {}", name, watcher.fd, Errno::last());
            }
            ktrace!("epoll_ctl({}, fd {}, {:#x})", name, watcher.fd, watcher.pending);
            watcher.current = watcher.pending;
        }
    }

    /// Reconcile, then block up to `timeout_ms` (-1 = forever) for readiness
    ///
    /// Woken fibers are appended to `wakeups`. Returns false, with nothing
    /// woken, if the wait was interrupted by a signal.
    pub fn wait_for_events<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        timeout_ms: i32,
        wakeups: &mut Wakeups,
    ) -> bool {
        self.reconcile();

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => return false,
                errno => kfatal!("epoll_wait failed: {}", errno),
            }
        }

        for i in 0..n as usize {
            let ev = self.events[i];
            let (flags, idx) = (ev.events, ev.u64 as usize);
            if !self.watchers.contains(idx) {
                continue;
            }
            if flags & HANGUP_FLAGS != 0 {
                self.drain_awaiters(arena, idx, &mut wakeups.hangup);
                continue;
            }
            for event in IoEvent::ALL {
                if flags & event.flag() == 0 {
                    continue;
                }
                if let Some(fiber) = self.watchers[idx].awaiters[event.index()].front() {
                    self.detach(arena, idx, event, fiber);
                    wakeups.ready.push_back(arena, fiber);
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        link: Link,
    }

    impl Linked for Node {
        fn link(&self) -> &Link {
            &self.link
        }
        fn link_mut(&mut self) -> &mut Link {
            &mut self.link
        }
    }

    fn fibers(n: usize) -> Slab<Node> {
        let mut slab = Slab::new();
        for _ in 0..n {
            slab.insert(Node { link: Link::new() });
        }
        slab
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_byte(fd: RawFd) {
        let ret = unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(ret, 1);
    }

    #[test]
    fn test_single_ownership() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let (r, w) = pipe();
        poll.create_watcher(r).unwrap();
        assert!(poll.watcher_exists(r));
        assert_eq!(poll.create_watcher(r), Err(SchedError::AlreadyWatched(r)));

        let mut arena = fibers(0);
        let mut woken = List::new();
        assert_eq!(
            poll.destroy_watcher(&mut arena, w, &mut woken),
            Err(SchedError::NotWatched(w))
        );
        poll.destroy_watcher(&mut arena, r, &mut woken).unwrap();
        assert!(!poll.watcher_exists(r));
        close(r);
        close(w);
    }

    #[test]
    fn test_registration_is_lazy() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let mut arena = fibers(1);
        let (r, w) = pipe();
        poll.create_watcher(r).unwrap();
        poll.add_event_awaiter(&mut arena, r, IoEvent::Readability, 0).unwrap();
        assert_eq!(poll.registered_flags(r), Some(0));

        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 0, &mut wakeups));
        assert_eq!(poll.registered_flags(r), Some(libc::EPOLLIN as u32));
        assert!(wakeups.ready.is_empty());

        poll.remove_event_awaiter(&mut arena, r, IoEvent::Readability, 0).unwrap();
        assert!(poll.wait_for_events(&mut arena, 0, &mut wakeups));
        assert_eq!(poll.registered_flags(r), Some(0));
        close(r);
        close(w);
    }

    #[test]
    fn test_one_awaiter_per_direction() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let mut arena = fibers(3);
        let (r, w) = pipe();
        poll.create_watcher(r).unwrap();
        for f in 0..3 {
            poll.add_event_awaiter(&mut arena, r, IoEvent::Readability, f).unwrap();
        }
        write_byte(w);

        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 1000, &mut wakeups));
        assert_eq!(wakeups.ready.to_vec(&arena), vec![0]);
        assert_eq!(poll.awaiter_count(r, IoEvent::Readability), 2);

        // Level-triggered: still readable, next head is handed over
        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 1000, &mut wakeups));
        assert_eq!(wakeups.ready.to_vec(&arena), vec![1]);
        close(r);
        close(w);
    }

    #[test]
    fn test_both_directions_fire() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let mut arena = fibers(2);
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        let (a, b) = (fds[0], fds[1]);
        poll.create_watcher(a).unwrap();
        poll.add_event_awaiter(&mut arena, a, IoEvent::Readability, 0).unwrap();
        poll.add_event_awaiter(&mut arena, a, IoEvent::Writability, 1).unwrap();
        write_byte(b);

        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 1000, &mut wakeups));
        assert_eq!(wakeups.ready.to_vec(&arena), vec![0, 1]);
        assert_eq!(poll.awaiter_count(a, IoEvent::Readability), 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_hangup_wakes_everyone() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let mut arena = fibers(3);
        let (r, w) = pipe();
        poll.create_watcher(r).unwrap();
        for f in 0..3 {
            poll.add_event_awaiter(&mut arena, r, IoEvent::Readability, f).unwrap();
        }
        close(w);

        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 1000, &mut wakeups));
        assert!(wakeups.ready.is_empty());
        assert_eq!(wakeups.hangup.to_vec(&arena), vec![0, 1, 2]);
        assert_eq!(poll.awaiter_count(r, IoEvent::Readability), 0);
        close(r);
    }

    #[test]
    fn test_destroy_wakes_awaiters_and_allows_reuse() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let mut arena = fibers(3);
        let (r, w) = pipe();
        poll.create_watcher(r).unwrap();
        poll.add_event_awaiter(&mut arena, r, IoEvent::Readability, 0).unwrap();
        poll.add_event_awaiter(&mut arena, r, IoEvent::Readability, 1).unwrap();
        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 0, &mut wakeups));

        let mut woken = List::new();
        poll.destroy_watcher(&mut arena, r, &mut woken).unwrap();
        assert_eq!(woken.to_vec(&arena), vec![0, 1]);
        assert_eq!(poll.watcher_count(), 0);

        // Same descriptor number can be registered again from scratch
        poll.create_watcher(r).unwrap();
        poll.add_event_awaiter(&mut arena, r, IoEvent::Readability, 2).unwrap();
        write_byte(w);
        let mut wakeups = Wakeups::default();
        assert!(poll.wait_for_events(&mut arena, 1000, &mut wakeups));
        assert_eq!(wakeups.ready.to_vec(&arena), vec![2]);
        close(r);
        close(w);
    }

    #[test]
    fn test_timeout_without_events() {
        let mut poll = IoPoll::new(16, 4).unwrap();
        let mut arena = fibers(0);
        let mut wakeups = Wakeups::default();
        let start = std::time::Instant::now();
        assert!(poll.wait_for_events(&mut arena, 20, &mut wakeups));
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
        assert!(wakeups.ready.is_empty());
    }
}

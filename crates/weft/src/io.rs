//! Fiber-aware syscall wrappers
//!
//! Descriptors created here are non-blocking and registered with the
//! running scheduler. Calls that would block suspend only the calling
//! fiber until the descriptor is ready, the timeout elapses (`ETIME`), or
//! the descriptor is closed by another fiber (`EBADF`).
//!
//! Timeouts are `Option<Duration>`; `None` waits forever. Every call on a
//! descriptor that is not registered fails with `EBADF`.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use weft_core::{IoEvent, SchedError};

use crate::{duration_ms, with_scheduler};

fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

/// Scheduler errors surface as their OS error number
fn os_error(e: SchedError) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

fn check_watched(fd: RawFd) -> io::Result<()> {
    if with_scheduler("weft::io", |s| s.watcher_exists(fd)) {
        Ok(())
    } else {
        Err(ebadf())
    }
}

fn watch(fd: RawFd) -> io::Result<RawFd> {
    match with_scheduler("weft::io", |s| s.watch_io(fd)) {
        Ok(()) => Ok(fd),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(os_error(e))
        }
    }
}

/// Attempt `op` until it succeeds, awaiting `event` on `fd` whenever it
/// would block.
///
/// After a hangup the operation is tried once more so the caller sees the
/// end-of-file or the socket's real error.
fn retry<F>(fd: RawFd, event: IoEvent, timeout: Option<Duration>, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    check_watched(fd)?;
    let timeout_ms = duration_ms(timeout);
    let mut hung_up = false;
    loop {
        let ret = op();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::EAGAIN if hung_up => return Err(os_error(SchedError::Hangup)),
            Errno::EAGAIN => {}
            errno => return Err(errno.into()),
        }
        match with_scheduler("weft::io", |s| s.await_io(fd, event, timeout_ms)) {
            Ok(()) => {}
            Err(SchedError::Hangup) => hung_up = true,
            Err(e) => return Err(os_error(e)),
        }
    }
}

// ----------------------------------------------------------------------
// Descriptor creation
// ----------------------------------------------------------------------

/// Open `path` non-blocking and register it
pub fn open<P: AsRef<Path>>(path: P, flags: i32, mode: libc::mode_t) -> io::Result<RawFd> {
    let path = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    loop {
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_NONBLOCK, mode as libc::c_uint) };
        if fd >= 0 {
            return watch(fd);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => return Err(errno.into()),
        }
    }
}

/// Create a non-blocking pipe; returns `(read_end, write_end)`
pub fn pipe2(flags: i32) -> io::Result<(RawFd, RawFd)> {
    let mut fds = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_NONBLOCK) } < 0 {
        return Err(Errno::last().into());
    }
    let read_end = watch(fds[0]).inspect_err(|_| unsafe {
        libc::close(fds[1]);
    })?;
    if let Err(e) = watch(fds[1]) {
        let _ = close(read_end);
        return Err(e);
    }
    Ok((read_end, fds[1]))
}

/// Create a non-blocking socket and register it
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) };
    if fd < 0 {
        return Err(Errno::last().into());
    }
    watch(fd)
}

/// Register a descriptor created elsewhere, switching it to non-blocking
///
/// Ownership passes to the scheduler side: release it with [`close`].
pub fn adopt(fd: RawFd) -> io::Result<RawFd> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Errno::last().into());
    }
    watch(fd)
}

/// Unregister and close `fd`
///
/// Fibers blocked on `fd` resume with `EBADF`.
pub fn close(fd: RawFd) -> io::Result<()> {
    check_watched(fd)?;
    with_scheduler("weft::io", |s| s.unwatch_io(fd)).map_err(os_error)?;
    // Linux releases the descriptor even when close reports EINTR
    if unsafe { libc::close(fd) } < 0 {
        match Errno::last() {
            Errno::EINTR => {}
            errno => return Err(errno.into()),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Data transfer
// ----------------------------------------------------------------------

pub fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry(fd, IoEvent::Readability, timeout, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn write(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry(fd, IoEvent::Writability, timeout, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// Write all of `buf`, suspending as often as needed
pub fn write_all(fd: RawFd, mut buf: &[u8], timeout: Option<Duration>) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf, timeout)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32, timeout: Option<Duration>) -> io::Result<usize> {
    retry(fd, IoEvent::Readability, timeout, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32, timeout: Option<Duration>) -> io::Result<usize> {
    retry(fd, IoEvent::Writability, timeout, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// Receive a datagram and its sender's address
pub fn recv_from(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    timeout: Option<Duration>,
) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = retry(fd, IoEvent::Readability, timeout, || {
        len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        }
    })?;
    Ok((n, from_sockaddr(&storage, len)))
}

pub fn send_to(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: &SocketAddr,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let (storage, len) = to_sockaddr(addr);
    retry(fd, IoEvent::Writability, timeout, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    })
}

// ----------------------------------------------------------------------
// Connections
// ----------------------------------------------------------------------

/// Accept a connection; the new descriptor is registered before return
pub fn accept4(
    fd: RawFd,
    flags: i32,
    timeout: Option<Duration>,
) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn = retry(fd, IoEvent::Readability, timeout, || {
        len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                flags | libc::SOCK_NONBLOCK,
            )
        };
        ret as libc::ssize_t
    })?;
    let conn = watch(conn as RawFd)?;
    Ok((conn, from_sockaddr(&storage, len)))
}

/// Connect `fd` to `addr`, suspending while the handshake is in progress
pub fn connect(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    check_watched(fd)?;
    let (storage, len) = to_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok(());
    }
    match Errno::last() {
        // An interrupted connect keeps going in the background
        Errno::EINPROGRESS | Errno::EINTR => {}
        errno => return Err(errno.into()),
    }

    match with_scheduler("weft::io", |s| s.await_io(fd, IoEvent::Writability, duration_ms(timeout))) {
        // SO_ERROR below carries the reason for a refused connection
        Ok(()) | Err(SchedError::Hangup) => {}
        Err(e) => return Err(os_error(e)),
    }

    let mut err: libc::c_int = 0;
    let mut err_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut err_len,
        )
    };
    if ret < 0 {
        return Err(Errno::last().into());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Socket addresses
// ----------------------------------------------------------------------

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    let len = len as usize;
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

//! weft Echo Server
//!
//! Single-threaded TCP echo server: one fiber accepts, one fiber per
//! connection reads and writes back until the peer closes.
//!
//! Usage:
//!     cargo build --release -p weft-echo
//!     ./target/release/weft-echo [port] [idle_timeout_secs]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::cell::Cell;
use std::net::TcpListener;
use std::os::fd::{IntoRawFd, RawFd};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use weft::{call, io, kdebug, kerror, kinfo, sleep_ms, Runtime, SchedulerConfig};

const BUF_SIZE: usize = 4096;

/// First pause after a failed accept, doubled per consecutive failure
const ACCEPT_BACKOFF_MS: u64 = 5;
const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

#[derive(Default)]
struct Stats {
    accepts: Cell<u64>,
    bytes: Cell<u64>,
    active: Cell<u64>,
    errors: Cell<u64>,
}

fn handle_client(fd: RawFd, idle: Option<Duration>, stats: Rc<Stats>) {
    stats.active.set(stats.active.get() + 1);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        match io::recv(fd, &mut buf, 0, idle) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = send_all(fd, &buf[..n], idle) {
                    kdebug!("fd {}: send failed: {}", fd, e);
                    stats.errors.set(stats.errors.get() + 1);
                    break;
                }
                stats.bytes.set(stats.bytes.get() + n as u64);
            }
            Err(e) => {
                kdebug!("fd {}: recv failed: {}", fd, e);
                stats.errors.set(stats.errors.get() + 1);
                break;
            }
        }
    }
    if let Err(e) = io::close(fd) {
        kerror!("fd {}: close failed: {}", fd, e);
    }
    stats.active.set(stats.active.get() - 1);
}

fn send_all(fd: RawFd, mut buf: &[u8], timeout: Option<Duration>) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = io::send(fd, buf, libc::MSG_NOSIGNAL, timeout)?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Pause before retrying accept after `failures` consecutive errors
fn accept_backoff(failures: u32) -> u64 {
    let shift = failures.saturating_sub(1).min(16);
    (ACCEPT_BACKOFF_MS << shift).min(ACCEPT_BACKOFF_MAX_MS)
}

fn serve(port: u16, idle: Option<Duration>) -> u8 {
    let listener = match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            kerror!("bind port {}: {}", port, e);
            return 1;
        }
    };
    let lfd = match io::adopt(listener.into_raw_fd()) {
        Ok(fd) => fd,
        Err(e) => {
            kerror!("register listener: {}", e);
            return 1;
        }
    };
    println!("weft-echo listening on port {}", port);

    let stats = Rc::new(Stats::default());
    let mut failures = 0u32;
    loop {
        match io::accept4(lfd, libc::SOCK_CLOEXEC, None) {
            Ok((fd, peer)) => {
                failures = 0;
                stats.accepts.set(stats.accepts.get() + 1);
                kinfo!(
                    "accepted {:?} as fd {} ({} active, {} total, {} bytes echoed)",
                    peer,
                    fd,
                    stats.active.get(),
                    stats.accepts.get(),
                    stats.bytes.get()
                );
                let stats = Rc::clone(&stats);
                call(move || handle_client(fd, idle, stats));
            }
            Err(e) => {
                kerror!("accept: {}", e);
                stats.errors.set(stats.errors.get() + 1);
                if e.raw_os_error() == Some(libc::EBADF) {
                    return 1;
                }
                // The listener stays readable while accept keeps failing (EMFILE)
                failures = failures.saturating_add(1);
                sleep_ms(accept_backoff(failures));
            }
        }
    }
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let port = match args.next().map(|p| p.parse::<u16>()) {
        None => 9999,
        Some(Ok(p)) => p,
        Some(Err(_)) => {
            eprintln!("usage: weft-echo [port] [idle_timeout_secs]");
            return ExitCode::FAILURE;
        }
    };
    let idle = args
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    let mut runtime = match Runtime::new(SchedulerConfig::default()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("weft-echo: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let status = runtime.block_on(move || serve(port, idle));
    ExitCode::from(status.unwrap_or(1))
}

//! Basic weft example
//!
//! One fiber sleeps 50ms and prints "A"; another yields once and prints
//! "B". The yield finishes long before the sleep, so the output is B then A.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `WEFT_FLUSH_EPRINT=1` - Flush log output immediately
//! - `WEFT_DEBUG=1` - Trace every run-loop iteration

use std::process::ExitCode;

use weft::{call, current_fiber, kdebug, kinfo, sleep_ms, yield_now, Runtime, SchedulerConfig};

// WEFT_LOG_LEVEL=debug cargo run -p weft-basic
fn main() -> ExitCode {
    let mut runtime = match Runtime::new(SchedulerConfig::default()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("basic: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let status = runtime.block_on(|| {
        kinfo!("main fiber {:?} starting", current_fiber());

        let a = call(|| {
            sleep_ms(50);
            println!("A");
        });
        let b = call(|| {
            yield_now();
            println!("B");
        });
        kdebug!("dispatched A={} B={}", a, b);
        0u8
    });

    ExitCode::from(status.unwrap_or(1))
}

//! Small helpers shared by the hooks and the bus.

use nix::sys::signal::Signal;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;

/// Shell convention for a process ended by `signal`: `128 + signo`.
pub fn exit_status_for(signal: Signal) -> i32 {
    128 + signal as i32
}

/// End the process immediately with `code`.
///
/// Skips final-shutdown hooks and destructors; callers run their own
/// finish handlers first.
#[allow(unsafe_code)]
pub fn force_exit(code: i32) -> ! {
    tracing::debug!("force_exit: code={}", code);
    // SAFETY: `_exit` takes no pointers and never returns; skipping atexit
    // handlers and destructors is the intended behaviour here.
    unsafe { libc::_exit(code) }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Render a crash the way the default panic hook does, followed by the
/// captured backtrace when one is available.
pub fn format_stacktrace(
    message: &str,
    location: Option<&str>,
    thread: Option<&str>,
    backtrace: &Backtrace,
) -> String {
    let mut out = String::new();
    let thread = thread.unwrap_or("<unnamed>");
    match location {
        Some(loc) => {
            let _ = writeln!(out, "thread '{thread}' panicked at {loc}:");
        }
        None => {
            let _ = writeln!(out, "thread '{thread}' panicked:");
        }
    }
    let _ = writeln!(out, "{message}");
    if backtrace.status() == BacktraceStatus::Captured {
        let _ = write!(out, "stack backtrace:\n{backtrace}");
    }
    out
}

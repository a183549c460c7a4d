//! Hook adapters over the process's termination notification points.
//!
//! Each adapter wraps exactly one process-wide slot and restores what it
//! found there:
//! - [`ExceptionHookAdapter`]: the panic hook
//! - [`SignalAdapter`]: termination-request signals, with per-signal restore
//! - [`ExitHookAdapter`]: the final-shutdown callback registry
//!
//! The slots themselves sit behind traits so a [`Runtime`] can swap them for
//! the in-memory ones in [`crate::testing`].

mod crash;
mod exit;
mod process_signals;
mod signals;

pub use crash::{
    CrashCallback, CrashLocation, CrashReport, ExceptionHookAdapter, PanicHook, PanicHookSlot,
    StdPanicHook,
};
pub use exit::{ExitCallback, ExitHookAdapter, ExitSlot, ProcessExitHooks};
pub use process_signals::{dispatch_pending, ProcessSignals};
pub use signals::{
    NativeAction, SignalAction, SignalAdapter, SignalContext, SignalHandler, SignalSlot,
    TerminateCallback,
};

use std::fmt;
use std::sync::Arc;

/// Ends the process with a status code.
#[derive(Clone)]
pub struct ExitFn(Arc<dyn Fn(i32) + Send + Sync>);

impl ExitFn {
    pub fn new(f: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Immediate `_exit(2)`; see [`crate::utils::force_exit`].
    pub fn process() -> Self {
        Self::new(|code| crate::utils::force_exit(code))
    }

    pub fn call(&self, code: i32) {
        (self.0)(code)
    }
}

impl fmt::Debug for ExitFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExitFn({:p})", Arc::as_ptr(&self.0))
    }
}

/// The process-wide slots a bus installs into, plus the way it forces exit.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub panic_hook: Arc<dyn PanicHookSlot>,
    pub signals: Arc<dyn SignalSlot>,
    pub exit_hooks: Arc<dyn ExitSlot>,
    pub exit: ExitFn,
}

impl Runtime {
    /// The real process: std panic hook, `sigaction`, `atexit`, `_exit`.
    pub fn process() -> Self {
        Self {
            panic_hook: Arc::new(StdPanicHook),
            signals: Arc::new(ProcessSignals),
            exit_hooks: Arc::new(ProcessExitHooks),
            exit: ExitFn::process(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::process()
    }
}

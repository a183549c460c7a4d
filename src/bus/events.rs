//! Event payloads handed to handlers.
//!
//! One record per trigger. Finish, Hold and Always handlers receive the
//! event of the trigger that led to them, or [`Event::Shutdown`] when the
//! process is ending without one.

use nix::sys::signal::Signal;

use crate::hooks::{CrashLocation, CrashReport, ExitFn, SignalAction, SignalContext};
use crate::utils::exit_status_for;

/// Exit status of a thread that panicked out of `main`.
pub const PANIC_EXIT_STATUS: i32 = 101;

/// An uncaught panic on the bus's thread.
#[derive(Debug, Clone)]
pub struct CrashEvent {
    /// The panic message.
    pub exception: String,
    /// Where the panic was raised.
    pub traceback: Option<CrashLocation>,
    pub thread: Option<String>,
    /// Whether the previously installed panic hook ran for this panic. It
    /// runs after crash handlers when the hook delivers the crash itself,
    /// and at panic time when delivery waits for the panic to leave a scope.
    pub chained: bool,
    report: CrashReport,
}

impl CrashEvent {
    pub(crate) fn new(report: CrashReport, chained: bool) -> Self {
        Self {
            exception: report.message.clone(),
            traceback: report.location.clone(),
            thread: report.thread.clone(),
            chained,
            report,
        }
    }

    /// Full crash text including the backtrace. Formatting happens on the
    /// first call only.
    pub fn stacktrace(&self) -> String {
        self.report.stacktrace()
    }

    pub fn report(&self) -> &CrashReport {
        &self.report
    }
}

/// A termination-request signal.
#[derive(Debug, Clone)]
pub struct TerminateEvent {
    pub signal: Signal,
    pub frame: SignalContext,
    /// Disposition the bus replaced for this signal.
    pub previous_handler: SignalAction,
    exit: ExitFn,
}

impl TerminateEvent {
    pub(crate) fn new(
        signal: Signal,
        frame: SignalContext,
        previous_handler: SignalAction,
        exit: ExitFn,
    ) -> Self {
        Self {
            signal,
            frame,
            previous_handler,
            exit,
        }
    }

    /// `128 + signal number`.
    pub fn recommended_status(&self) -> i32 {
        exit_status_for(self.signal)
    }

    /// End the process now, with `code` or the recommended status.
    pub fn exit(&self, code: Option<i32>) {
        self.exit.call(code.unwrap_or_else(|| self.recommended_status()))
    }
}

/// An explicit request to quit with a status code.
#[derive(Debug, Clone)]
pub struct QuitEvent {
    pub exit_code: i32,
    exit: ExitFn,
}

impl QuitEvent {
    pub(crate) fn new(exit_code: i32, exit: ExitFn) -> Self {
        Self { exit_code, exit }
    }

    /// End the process now, with `code` or the requested exit code.
    pub fn exit(&self, code: Option<i32>) {
        self.exit.call(code.unwrap_or(self.exit_code))
    }
}

/// A lifecycle event.
#[derive(Debug, Clone)]
pub enum Event {
    Crash(CrashEvent),
    Terminate(TerminateEvent),
    Quit(QuitEvent),
    /// Ordinary shutdown with no preceding trigger.
    Shutdown,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Crash(_) => "crash",
            Event::Terminate(_) => "terminate",
            Event::Quit(_) => "quit",
            Event::Shutdown => "shutdown",
        }
    }

    /// The status the process is expected to end with, when known.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Event::Crash(_) => Some(PANIC_EXIT_STATUS),
            Event::Terminate(e) => Some(e.recommended_status()),
            Event::Quit(e) => Some(e.exit_code),
            Event::Shutdown => None,
        }
    }

    pub fn as_crash(&self) -> Option<&CrashEvent> {
        match self {
            Event::Crash(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_terminate(&self) -> Option<&TerminateEvent> {
        match self {
            Event::Terminate(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_quit(&self) -> Option<&QuitEvent> {
        match self {
            Event::Quit(e) => Some(e),
            _ => None,
        }
    }
}

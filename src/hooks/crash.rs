//! Panic hook adapter.
//!
//! Wraps the process-wide panic hook. The adapter remembers whatever hook
//! was installed before it and puts it back on [`ExceptionHookAdapter::restore`].
//!
//! The hook runs for every panic, including ones a `catch_unwind` later
//! recovers, so its callback only learns that a panic started.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{Location, PanicHookInfo};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use crate::utils::{format_stacktrace, panic_message};

/// A panic hook as accepted by [`std::panic::set_hook`].
pub type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Callback installed by the adapter. The second argument runs the
/// previously installed hook; it is only present when chaining was requested.
pub type CrashCallback = Arc<dyn Fn(&CrashReport, Option<&dyn Fn()>) + Send + Sync>;

/// The process-wide panic hook slot.
pub trait PanicHookSlot: Send + Sync + fmt::Debug {
    /// Remove the current hook, leaving the default one in place.
    fn take(&self) -> PanicHook;

    /// Install `hook`, dropping the current one.
    fn set(&self, hook: PanicHook);
}

/// [`PanicHookSlot`] backed by `std::panic::{take_hook, set_hook}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPanicHook;

impl PanicHookSlot for StdPanicHook {
    fn take(&self) -> PanicHook {
        std::panic::take_hook()
    }

    fn set(&self, hook: PanicHook) {
        std::panic::set_hook(hook)
    }
}

/// Source position of a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl From<&Location<'_>> for CrashLocation {
    fn from(loc: &Location<'_>) -> Self {
        Self {
            file: loc.file().to_string(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for CrashLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Everything the panic hook knows about a crash, detached from the hook's
/// borrowed `PanicHookInfo`.
#[derive(Clone)]
pub struct CrashReport {
    pub message: String,
    pub location: Option<CrashLocation>,
    pub thread: Option<String>,
    pub thread_id: ThreadId,
    backtrace: Arc<Backtrace>,
    rendered: Arc<OnceLock<String>>,
}

impl CrashReport {
    /// Report for a crash on the current thread, located at the caller.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self::build(message.into(), Some(Location::caller().into()))
    }

    pub fn from_info(info: &PanicHookInfo<'_>) -> Self {
        Self::build(
            panic_message(info.payload()),
            info.location().map(CrashLocation::from),
        )
    }

    /// Report rebuilt from a panic payload after the hook has run. The
    /// source position is no longer known.
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        Self::build(panic_message(payload), None)
    }

    fn build(message: String, location: Option<CrashLocation>) -> Self {
        let current = std::thread::current();
        Self {
            message,
            location,
            thread: current.name().map(str::to_string),
            thread_id: current.id(),
            // Symbols are resolved only when the report is rendered.
            backtrace: Arc::new(Backtrace::capture()),
            rendered: Arc::new(OnceLock::new()),
        }
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Human-readable crash text, formatted once on first use.
    pub fn stacktrace(&self) -> String {
        self.rendered
            .get_or_init(|| {
                let location = self.location.as_ref().map(ToString::to_string);
                format_stacktrace(
                    &self.message,
                    location.as_deref(),
                    self.thread.as_deref(),
                    &self.backtrace,
                )
            })
            .clone()
    }
}

impl fmt::Debug for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashReport")
            .field("message", &self.message)
            .field("location", &self.location)
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

/// Installs a [`CrashCallback`] as the process panic hook.
pub struct ExceptionHookAdapter {
    slot: Arc<dyn PanicHookSlot>,
    previous: Option<Arc<PanicHook>>,
}

impl ExceptionHookAdapter {
    pub fn new(slot: Arc<dyn PanicHookSlot>) -> Self {
        Self {
            slot,
            previous: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.previous.is_some()
    }

    /// Install `callback`, remembering the hook it replaces.
    ///
    /// Registering again first restores the remembered hook, so the hook
    /// recorded is always the one found before this adapter touched the slot.
    pub fn register(&mut self, callback: CrashCallback, chain_previous: bool) {
        if std::thread::panicking() {
            tracing::warn!("panic_hook_register_skipped: thread is panicking");
            return;
        }
        self.restore();

        let previous: Arc<PanicHook> = Arc::new(self.slot.take());
        let chained = Arc::clone(&previous);
        self.slot.set(Box::new(move |info| {
            let report = CrashReport::from_info(info);
            if chain_previous {
                let call_previous = || chained(info);
                callback(&report, Some(&call_previous));
            } else {
                callback(&report, None);
            }
        }));
        self.previous = Some(previous);
    }

    /// Reinstall the hook found by [`register`](Self::register). No-op when
    /// nothing is installed.
    ///
    /// The std panic hook cannot be changed from a panicking thread; in that
    /// case the hook stays installed and the adapter keeps its record.
    pub fn restore(&mut self) {
        if std::thread::panicking() {
            tracing::warn!("panic_hook_restore_skipped: thread is panicking");
            return;
        }
        if let Some(previous) = self.previous.take() {
            self.slot.set(Box::new(move |info| previous(info)));
        }
    }
}

impl fmt::Debug for ExceptionHookAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHookAdapter")
            .field("slot", &self.slot)
            .field("installed", &self.is_installed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePanicHook;
    use parking_lot::Mutex;
    use serial_test::serial;
    use std::panic::catch_unwind;

    #[test]
    fn test_report_new_captures_caller() {
        let report = CrashReport::new("kaboom");
        assert_eq!(report.message, "kaboom");
        let loc = report.location.clone().unwrap();
        assert!(loc.file.ends_with("crash.rs"));
        assert_eq!(report.thread_id, std::thread::current().id());
    }

    #[test]
    fn test_stacktrace_contains_message_and_is_cached() {
        let report = CrashReport::new("disk on fire");
        let first = report.stacktrace();
        assert!(first.contains("disk on fire"));
        assert!(first.contains("panicked at"));
        assert_eq!(first, report.clone().stacktrace());
    }

    #[test]
    fn test_report_from_payload_has_no_location() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("late report"));
        let report = CrashReport::from_payload(payload.as_ref());
        assert_eq!(report.message, "late report");
        assert!(report.location.is_none());
        assert!(report.stacktrace().starts_with("thread '"));
    }

    #[test]
    fn test_register_and_restore_on_fake_slot() {
        let slot = Arc::new(FakePanicHook::default());
        let mut adapter = ExceptionHookAdapter::new(slot.clone());

        adapter.restore();
        assert_eq!(slot.sets(), 0);

        adapter.register(Arc::new(|_: &CrashReport, _: Option<&dyn Fn()>| {}), true);
        assert!(adapter.is_installed());
        assert_eq!(slot.takes(), 1);
        assert_eq!(slot.sets(), 1);

        adapter.restore();
        assert!(!adapter.is_installed());
        assert_eq!(slot.sets(), 2);

        adapter.restore();
        assert_eq!(slot.sets(), 2);
    }

    #[test]
    fn test_double_register_keeps_original_previous() {
        let slot = Arc::new(FakePanicHook::default());
        let mut adapter = ExceptionHookAdapter::new(slot.clone());

        adapter.register(Arc::new(|_: &CrashReport, _: Option<&dyn Fn()>| {}), false);
        adapter.register(Arc::new(|_: &CrashReport, _: Option<&dyn Fn()>| {}), false);
        // restore, take, set
        assert_eq!(slot.takes(), 2);
        assert_eq!(slot.sets(), 3);
    }

    #[test]
    #[serial(panic_hook)]
    fn test_real_hook_chains_and_restores() {
        let me = std::thread::current().id();
        let previous_calls = Arc::new(Mutex::new(0usize));
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        let pc = previous_calls.clone();
        std::panic::set_hook(Box::new(move |_| {
            if std::thread::current().id() == me {
                *pc.lock() += 1;
            }
        }));

        let mut adapter = ExceptionHookAdapter::new(Arc::new(StdPanicHook));
        let s = seen.clone();
        adapter.register(
            Arc::new(move |report, previous| {
                if report.thread_id == me {
                    s.lock().push(report.message.clone());
                    if let Some(call) = previous {
                        call();
                    }
                }
            }),
            true,
        );

        let _ = catch_unwind(|| panic!("first"));
        assert_eq!(*seen.lock(), vec!["first".to_string()]);
        assert_eq!(*previous_calls.lock(), 1);

        adapter.restore();
        let _ = catch_unwind(|| panic!("second"));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(*previous_calls.lock(), 2);

        drop(std::panic::take_hook());
    }
}

//! The real signal table.
//!
//! The OS-level handler only marks a signal as pending; it is async-signal
//! safe and never runs Rust handlers itself. Handlers run when the receiving
//! thread calls [`dispatch_pending`] at a point where running arbitrary code
//! is safe (a main loop, or a wait loop inside a handler).
//!
//! Handlers are installed without `SA_RESTART`, so a blocking system call on
//! the receiving thread returns `EINTR` and the caller gets a chance to
//! dispatch.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use super::signals::{NativeAction, SignalAction, SignalContext, SignalSlot};
use crate::control::raise_interrupt;
use crate::types::{Error, Result};

static PENDING: AtomicU64 = AtomicU64::new(0);
static ACTIONS: OnceLock<Mutex<HashMap<Signal, SignalAction>>> = OnceLock::new();

fn actions() -> &'static Mutex<HashMap<Signal, SignalAction>> {
    ACTIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

extern "C" fn mark_pending(signo: libc::c_int) {
    if (1..64).contains(&signo) {
        PENDING.fetch_or(1u64 << signo, Ordering::SeqCst);
    }
}

fn take_next_pending() -> Option<libc::c_int> {
    loop {
        let bits = PENDING.load(Ordering::SeqCst);
        if bits == 0 {
            return None;
        }
        let signo = bits.trailing_zeros();
        let bit = 1u64 << signo;
        if PENDING.fetch_and(!bit, Ordering::SeqCst) & bit != 0 {
            return Some(signo as libc::c_int);
        }
    }
}

/// [`SignalSlot`] backed by `sigaction(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSignals;

impl ProcessSignals {
    /// Run the action of every signal received since the last call, lowest
    /// signal number first. Returns how many handlers ran.
    ///
    /// A handler that unwinds (or an [`SignalAction::Interrupt`] disposition)
    /// stops dispatch; signals still pending stay pending.
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(signo) = take_next_pending() {
            let Ok(signal) = Signal::try_from(signo) else {
                continue;
            };
            let action = actions().lock().get(&signal).cloned();
            match action {
                Some(SignalAction::Handler(handler)) => {
                    handler.call(signal, &SignalContext::now());
                    ran += 1;
                }
                Some(SignalAction::Interrupt) => raise_interrupt(signal, SignalContext::now()),
                _ => tracing::trace!("signal_dropped: {} has no rust-level action", signal),
            }
        }
        ran
    }

    /// Whether `signal` was received and not yet dispatched.
    pub fn is_pending(&self, signal: Signal) -> bool {
        PENDING.load(Ordering::SeqCst) & (1u64 << (signal as i32)) != 0
    }
}

impl SignalSlot for ProcessSignals {
    #[allow(unsafe_code)]
    fn replace(&self, signal: Signal, action: SignalAction) -> Result<SignalAction> {
        let new = match &action {
            SignalAction::Default => plain(SigHandler::SigDfl),
            SignalAction::Ignore => plain(SigHandler::SigIgn),
            SignalAction::Interrupt | SignalAction::Handler(_) => {
                plain(SigHandler::Handler(mark_pending))
            }
            SignalAction::Native(native) => native.0,
        };

        // SAFETY: `mark_pending` only performs an atomic read-modify-write,
        // which is async-signal-safe. Other dispositions are OS-provided or
        // were read back from the OS earlier.
        let old = unsafe { sigaction(signal, &new) }.map_err(|e| Error::signal_install(signal, e))?;

        let mut table = actions().lock();
        let previous_rust = match action {
            SignalAction::Interrupt | SignalAction::Handler(_) => table.insert(signal, action),
            _ => table.remove(&signal),
        };

        // A table entry exists exactly while our trampoline is installed.
        Ok(previous_rust.unwrap_or_else(|| match old.handler() {
            SigHandler::SigDfl => SignalAction::Default,
            SigHandler::SigIgn => SignalAction::Ignore,
            _ => SignalAction::Native(NativeAction(old)),
        }))
    }
}

fn plain(handler: SigHandler) -> SigAction {
    SigAction::new(handler, SaFlags::empty(), SigSet::empty())
}

/// Dispatch pending signals on the process signal table.
pub fn dispatch_pending() -> usize {
    ProcessSignals.dispatch_pending()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlFlow;
    use serial_test::serial;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use crate::hooks::SignalHandler;

    #[test]
    #[serial(process_signals)]
    fn test_handler_runs_on_dispatch_not_on_delivery() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handler = SignalHandler::new(move |sig, _| {
            assert_eq!(sig, Signal::SIGUSR1);
            h.fetch_add(1, Ordering::SeqCst);
        });

        let previous = ProcessSignals
            .replace(Signal::SIGUSR1, SignalAction::Handler(handler.clone()))
            .unwrap();
        assert_eq!(previous.name(), "default");

        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        assert!(ProcessSignals.is_pending(Signal::SIGUSR1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(dispatch_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!ProcessSignals.is_pending(Signal::SIGUSR1));

        let replaced = ProcessSignals
            .replace(Signal::SIGUSR1, previous)
            .unwrap();
        assert!(replaced.is_handler(&handler));
    }

    #[test]
    #[serial(process_signals)]
    fn test_interrupt_disposition_unwinds_on_dispatch() {
        let previous = ProcessSignals
            .replace(Signal::SIGUSR2, SignalAction::Interrupt)
            .unwrap();

        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        let payload = catch_unwind(AssertUnwindSafe(dispatch_pending)).unwrap_err();
        match ControlFlow::from_payload(payload) {
            ControlFlow::Interrupted(i) => assert_eq!(i.signal, Signal::SIGUSR2),
            other => panic!("expected interrupt, got {other:?}"),
        }

        ProcessSignals.replace(Signal::SIGUSR2, previous).unwrap();
    }

    #[test]
    #[serial(process_signals)]
    fn test_ignore_round_trip() {
        let previous = ProcessSignals
            .replace(Signal::SIGUSR1, SignalAction::Ignore)
            .unwrap();
        let replaced = ProcessSignals.replace(Signal::SIGUSR1, previous).unwrap();
        assert_eq!(replaced.name(), "ignore");
    }

    #[test]
    fn test_sigkill_is_rejected() {
        let err = ProcessSignals
            .replace(Signal::SIGKILL, SignalAction::Ignore)
            .unwrap_err();
        assert!(matches!(err, Error::SignalInstall { .. }));
    }
}

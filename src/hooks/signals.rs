//! Termination-signal adapter.
//!
//! Installs one callback across a set of signals and remembers, per signal,
//! the disposition it replaced. Restoring works on any subset, which lets the
//! bus lift its own interception while terminate handlers run and put it
//! back afterwards.

use chrono::{DateTime, Utc};
use nix::sys::signal::{SigAction, SigHandler, Signal};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Result;

/// Where and when a signal was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalContext {
    pub received_at: DateTime<Utc>,
    pub thread: Option<String>,
}

impl SignalContext {
    pub fn now() -> Self {
        Self {
            received_at: Utc::now(),
            thread: std::thread::current().name().map(str::to_string),
        }
    }
}

type SignalFn = dyn Fn(Signal, &SignalContext) + Send + Sync;

/// Rust-level signal handler with pointer identity.
#[derive(Clone)]
pub struct SignalHandler(Arc<SignalFn>);

impl SignalHandler {
    pub fn new(f: impl Fn(Signal, &SignalContext) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, signal: Signal, context: &SignalContext) {
        (self.0)(signal, context)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalHandler({:p})", Arc::as_ptr(&self.0))
    }
}

/// An OS-level handler found in the signal table that this crate did not
/// install. Kept only so it can be put back verbatim.
#[derive(Clone, Copy)]
pub struct NativeAction(pub(crate) SigAction);

impl fmt::Debug for NativeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0.handler() {
            SigHandler::SigDfl => "SIG_DFL",
            SigHandler::SigIgn => "SIG_IGN",
            SigHandler::Handler(_) => "handler",
            SigHandler::SigAction(_) => "sigaction",
        };
        write!(f, "NativeAction({kind})")
    }
}

/// Disposition of one signal.
#[derive(Debug, Clone)]
pub enum SignalAction {
    /// The platform default (usually: terminate the process).
    Default,
    /// Discard the signal.
    Ignore,
    /// Unwind the receiving thread with an
    /// [`Interrupted`](crate::control::Interrupted) payload.
    Interrupt,
    /// Run a Rust handler on the receiving thread.
    Handler(SignalHandler),
    /// A foreign handler, restored as found.
    Native(NativeAction),
}

impl SignalAction {
    pub fn name(&self) -> &'static str {
        match self {
            SignalAction::Default => "default",
            SignalAction::Ignore => "ignore",
            SignalAction::Interrupt => "interrupt",
            SignalAction::Handler(_) => "handler",
            SignalAction::Native(_) => "native",
        }
    }

    pub fn is_handler(&self, handler: &SignalHandler) -> bool {
        matches!(self, SignalAction::Handler(h) if h.ptr_eq(handler))
    }
}

/// The process-wide signal table.
pub trait SignalSlot: Send + Sync + fmt::Debug {
    /// Install `action` for `signal`, returning the disposition it replaced.
    fn replace(&self, signal: Signal, action: SignalAction) -> Result<SignalAction>;
}

/// Callback installed by the adapter: signal, receive context, and the
/// disposition that was in place before the adapter.
pub type TerminateCallback = Arc<dyn Fn(Signal, &SignalContext, &SignalAction) + Send + Sync>;

/// Installs a [`TerminateCallback`] across a set of signals.
pub struct SignalAdapter {
    slot: Arc<dyn SignalSlot>,
    previous: Arc<Mutex<BTreeMap<Signal, SignalAction>>>,
}

impl SignalAdapter {
    pub fn new(slot: Arc<dyn SignalSlot>) -> Self {
        Self {
            slot,
            previous: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Signals currently intercepted by this adapter.
    pub fn installed(&self) -> Vec<Signal> {
        self.previous.lock().keys().copied().collect()
    }

    /// Disposition recorded for `signal` when it was intercepted.
    pub fn recorded(&self, signal: Signal) -> Option<SignalAction> {
        self.previous.lock().get(&signal).cloned()
    }

    /// Install `callback` for every signal in `signals`.
    ///
    /// A signal already intercepted keeps its originally recorded
    /// disposition. If the OS rejects one signal, the ones installed by this
    /// call are put back before the error is returned.
    pub fn register(&mut self, callback: TerminateCallback, signals: &[Signal]) -> Result<()> {
        let mut newly_installed = Vec::new();

        for &signal in signals {
            let cb = Arc::clone(&callback);
            let recorded = Arc::clone(&self.previous);
            let handler = SignalHandler::new(move |sig, ctx| {
                let previous = recorded
                    .lock()
                    .get(&sig)
                    .cloned()
                    .unwrap_or(SignalAction::Default);
                cb(sig, ctx, &previous);
            });

            match self.slot.replace(signal, SignalAction::Handler(handler)) {
                Ok(replaced) => {
                    let mut previous = self.previous.lock();
                    if !previous.contains_key(&signal) {
                        previous.insert(signal, replaced);
                        newly_installed.push(signal);
                    }
                }
                Err(err) => {
                    self.restore(&newly_installed)?;
                    return Err(err);
                }
            }
        }

        tracing::debug!("signal_adapter_registered: signals={:?}", signals);
        Ok(())
    }

    /// Put back the recorded disposition for exactly `signals`. Signals this
    /// adapter never intercepted are left alone.
    pub fn restore(&mut self, signals: &[Signal]) -> Result<()> {
        for &signal in signals {
            let Some(previous) = self.previous.lock().remove(&signal) else {
                continue;
            };
            if let Err(err) = self.slot.replace(signal, previous.clone()) {
                self.previous.lock().insert(signal, previous);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Put back every recorded disposition.
    pub fn restore_all(&mut self) -> Result<()> {
        let signals = self.installed();
        self.restore(&signals)
    }
}

impl fmt::Debug for SignalAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalAdapter")
            .field("slot", &self.slot)
            .field("installed", &self.installed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSignals;
    use pretty_assertions::assert_eq;

    fn recording_callback() -> (TerminateCallback, Arc<Mutex<Vec<(Signal, &'static str)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let cb: TerminateCallback = Arc::new(move |sig, _ctx, prev| {
            s.lock().push((sig, prev.name()));
        });
        (cb, seen)
    }

    #[test]
    fn test_register_records_previous_per_signal() {
        let fake = Arc::new(FakeSignals::new());
        fake.set(Signal::SIGINT, SignalAction::Interrupt);

        let mut adapter = SignalAdapter::new(fake.clone());
        let (cb, seen) = recording_callback();
        adapter
            .register(cb, &[Signal::SIGINT, Signal::SIGTERM])
            .unwrap();

        fake.deliver(Signal::SIGINT);
        fake.deliver(Signal::SIGTERM);
        assert_eq!(
            *seen.lock(),
            vec![(Signal::SIGINT, "interrupt"), (Signal::SIGTERM, "default")]
        );
        assert_eq!(adapter.installed(), vec![Signal::SIGINT, Signal::SIGTERM]);
    }

    #[test]
    fn test_partial_restore() {
        let fake = Arc::new(FakeSignals::new());
        fake.set(Signal::SIGINT, SignalAction::Interrupt);

        let mut adapter = SignalAdapter::new(fake.clone());
        let (cb, _seen) = recording_callback();
        adapter
            .register(cb, &[Signal::SIGINT, Signal::SIGTERM])
            .unwrap();

        adapter.restore(&[Signal::SIGINT]).unwrap();
        assert_eq!(fake.action(Signal::SIGINT).name(), "interrupt");
        assert_eq!(fake.action(Signal::SIGTERM).name(), "handler");
        assert_eq!(adapter.installed(), vec![Signal::SIGTERM]);

        // Restoring an unrecorded signal does nothing.
        adapter.restore(&[Signal::SIGINT, Signal::SIGHUP]).unwrap();
        assert_eq!(fake.action(Signal::SIGINT).name(), "interrupt");
        assert_eq!(fake.action(Signal::SIGHUP).name(), "default");

        adapter.restore_all().unwrap();
        assert_eq!(fake.action(Signal::SIGTERM).name(), "default");
        assert!(adapter.installed().is_empty());
    }

    #[test]
    fn test_reregister_keeps_original_disposition() {
        let fake = Arc::new(FakeSignals::new());
        fake.set(Signal::SIGTERM, SignalAction::Ignore);

        let mut adapter = SignalAdapter::new(fake.clone());
        let (cb, _) = recording_callback();
        adapter.register(cb.clone(), &[Signal::SIGTERM]).unwrap();
        adapter.register(cb, &[Signal::SIGTERM]).unwrap();

        adapter.restore_all().unwrap();
        assert_eq!(fake.action(Signal::SIGTERM).name(), "ignore");
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let fake = Arc::new(FakeSignals::new());
        fake.reject(Signal::SIGKILL);

        let mut adapter = SignalAdapter::new(fake.clone());
        let (cb, _) = recording_callback();
        let result = adapter.register(cb, &[Signal::SIGINT, Signal::SIGKILL]);

        assert!(result.is_err());
        assert_eq!(fake.action(Signal::SIGINT).name(), "default");
        assert!(adapter.installed().is_empty());
    }
}

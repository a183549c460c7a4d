//! In-memory stand-ins for the process-wide slots.
//!
//! A bus built on [`FakeRuntime::runtime`] never touches the real panic
//! hook, signal table or exit registry, so tests can run it in parallel and
//! drive every trigger by hand.

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::control::raise_interrupt;
use crate::hooks::{
    ExitCallback, ExitFn, ExitSlot, PanicHook, PanicHookSlot, Runtime, SignalAction,
    SignalContext, SignalSlot,
};
use crate::types::{Error, Result};

/// A panic hook slot that counts how it is used.
#[derive(Default)]
pub struct FakePanicHook {
    hook: Mutex<Option<PanicHook>>,
    takes: AtomicUsize,
    sets: AtomicUsize,
}

impl FakePanicHook {
    pub fn takes(&self) -> usize {
        self.takes.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.hook.lock().is_some()
    }
}

impl PanicHookSlot for FakePanicHook {
    fn take(&self) -> PanicHook {
        self.takes.fetch_add(1, Ordering::SeqCst);
        self.hook.lock().take().unwrap_or_else(|| Box::new(|_: &PanicHookInfo<'_>| {}))
    }

    fn set(&self, hook: PanicHook) {
        self.sets.fetch_add(1, Ordering::SeqCst);
        *self.hook.lock() = Some(hook);
    }
}

impl std::fmt::Debug for FakePanicHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePanicHook")
            .field("set", &self.is_set())
            .field("takes", &self.takes())
            .field("sets", &self.sets())
            .finish()
    }
}

/// A signal table with manual delivery.
#[derive(Debug, Default)]
pub struct FakeSignals {
    actions: Mutex<HashMap<Signal, SignalAction>>,
    rejected: Mutex<Vec<Signal>>,
    defaulted: Mutex<Vec<Signal>>,
}

impl FakeSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the disposition of `signal` without going through an adapter.
    pub fn set(&self, signal: Signal, action: SignalAction) {
        self.actions.lock().insert(signal, action);
    }

    pub fn action(&self, signal: Signal) -> SignalAction {
        self.actions
            .lock()
            .get(&signal)
            .cloned()
            .unwrap_or(SignalAction::Default)
    }

    /// Make every later `replace` for `signal` fail like `sigaction` would.
    pub fn reject(&self, signal: Signal) {
        self.rejected.lock().push(signal);
    }

    /// Signals delivered while their disposition was the platform default.
    /// A real process would have died on the first one.
    pub fn defaulted(&self) -> Vec<Signal> {
        self.defaulted.lock().clone()
    }

    /// Deliver `signal` on the calling thread.
    pub fn deliver(&self, signal: Signal) {
        let action = self.action(signal);
        match action {
            SignalAction::Handler(handler) => handler.call(signal, &SignalContext::now()),
            SignalAction::Interrupt => raise_interrupt(signal, SignalContext::now()),
            SignalAction::Default => self.defaulted.lock().push(signal),
            SignalAction::Ignore | SignalAction::Native(_) => {}
        }
    }
}

impl SignalSlot for FakeSignals {
    fn replace(&self, signal: Signal, action: SignalAction) -> Result<SignalAction> {
        if self.rejected.lock().contains(&signal) {
            return Err(Error::signal_install(signal, nix::Error::EINVAL));
        }
        Ok(self
            .actions
            .lock()
            .insert(signal, action)
            .unwrap_or(SignalAction::Default))
    }
}

/// An exit registry that runs only when told to.
#[derive(Debug, Default)]
pub struct FakeExitHooks {
    callbacks: Mutex<Vec<ExitCallback>>,
}

impl FakeExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    /// Simulate process exit: run and drop every callback, newest first.
    pub fn run(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks.iter().rev() {
            callback.call();
        }
    }
}

impl ExitSlot for FakeExitHooks {
    fn register(&self, callback: ExitCallback) {
        self.callbacks.lock().push(callback);
    }

    fn unregister(&self, callback: &ExitCallback) {
        self.callbacks.lock().retain(|c| !c.ptr_eq(callback));
    }
}

/// Records forced exits instead of performing them.
#[derive(Debug, Clone, Default)]
pub struct ExitRecorder {
    codes: Arc<Mutex<Vec<i32>>>,
}

impl ExitRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_fn(&self) -> ExitFn {
        let codes = Arc::clone(&self.codes);
        ExitFn::new(move |code| codes.lock().push(code))
    }

    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().clone()
    }

    /// The status a real process would have ended with.
    pub fn first(&self) -> Option<i32> {
        self.codes.lock().first().copied()
    }
}

/// One of each fake, kept around so tests can inspect them.
#[derive(Debug, Clone)]
pub struct FakeRuntime {
    pub panic_hook: Arc<FakePanicHook>,
    pub signals: Arc<FakeSignals>,
    pub exit_hooks: Arc<FakeExitHooks>,
    pub exits: ExitRecorder,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            panic_hook: Arc::new(FakePanicHook::default()),
            signals: Arc::new(FakeSignals::new()),
            exit_hooks: Arc::new(FakeExitHooks::new()),
            exits: ExitRecorder::new(),
        }
    }

    pub fn runtime(&self) -> Runtime {
        Runtime {
            panic_hook: self.panic_hook.clone(),
            signals: self.signals.clone(),
            exit_hooks: self.exit_hooks.clone(),
            exit: self.exits.exit_fn(),
        }
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

//! The lifecycle event bus.
//!
//! Owns six ordered handler sets, the per-episode ledger and the three hook
//! adapters. An episode runs from a trigger (signal, crash, quit, or plain
//! shutdown) to its resolution:
//!
//! ```text
//! terminate ─► [Terminate] ─┬─ exit_on_terminate ─► [Finish] ─► [Always] ─► force exit
//!                           └─ otherwise ─────────► [Hold] ───► [Always] ─► ledger cleared
//! crash ─────► [Crash] ─────► previous hook ──────► [Finish] ─► [Always]
//! quit ──────► [Quit] ──────┬─ exit_after_quit ───► [Finish] ─► [Always] ─► exit proceeds
//!                           └─ otherwise ─────────► [Hold] ───► [Always] ─► scope continues
//! shutdown ─────────────────────────────────────► [Finish] ─► [Always]
//! ```
//!
//! A handler is invoked at most once per episode no matter how many of its
//! categories fire. Delivery is single-threaded; no lock is held while a
//! handler runs, so handlers may register handlers or stop the bus.
//!
//! The panic hook sees every panic, caught or not. Inside a scope it only
//! records the report; the crash episode runs when the panic leaves the
//! outermost scope on the bus's thread. A panic on the main thread outside
//! any scope is delivered from the hook itself. If the process outlives a
//! crash episode, the next trigger starts with a clear ledger.

mod events;
mod registry;

pub use events::{CrashEvent, Event, QuitEvent, TerminateEvent, PANIC_EXIT_STATUS};
pub use registry::{Category, Handler, HandlerId, HandlerSet, Ledger};

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use crate::control::{ControlFlow, Quit};
use crate::hooks::{
    CrashCallback, CrashReport, ExceptionHookAdapter, ExitCallback, ExitHookAdapter, Runtime,
    SignalAction, SignalAdapter, SignalContext, TerminateCallback,
};
use crate::scope::{QuitInterceptor, QuitResolution, Scoped};
use crate::types::{BusConfig, Result};
use crate::utils::{exit_status_for, panic_message};

/// Mutable bookkeeping. Never locked while a handler runs.
#[derive(Debug, Default)]
struct BusState {
    handlers: HashMap<Category, HandlerSet>,
    ledger: Ledger,
    started: bool,
    /// Thread that started the bus; the only one whose crashes are delivered.
    owner: Option<ThreadId>,
    signals: Vec<Signal>,
    crashing: bool,
    /// One entry per open scope, innermost last.
    scopes: Vec<ThreadId>,
    /// Report taken by the panic hook inside a scope.
    pending_crash: Option<CrashReport>,
    /// A crash episode ran; its claims are stale if the process lives on.
    crash_episode: bool,
}

#[derive(Debug)]
struct Adapters {
    crash: ExceptionHookAdapter,
    signals: SignalAdapter,
    exit: ExitHookAdapter,
}

#[derive(Debug)]
struct Inner {
    config: BusConfig,
    runtime: Runtime,
    state: Mutex<BusState>,
    adapters: Mutex<Adapters>,
}

/// Process lifecycle event bus. Cloning yields another handle to the same bus.
///
/// A started bus stays alive until [`stop`](Self::stop) or process exit,
/// even after every handle is dropped, so final shutdown still reaches its
/// Finish and Always handlers.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// A bus wired to the real process hooks.
    pub fn new(config: BusConfig) -> Self {
        Self::with_runtime(config, Runtime::process())
    }

    /// A bus wired to `runtime`'s hooks.
    pub fn with_runtime(config: BusConfig, runtime: Runtime) -> Self {
        let adapters = Adapters {
            crash: ExceptionHookAdapter::new(Arc::clone(&runtime.panic_hook)),
            signals: SignalAdapter::new(Arc::clone(&runtime.signals)),
            exit: ExitHookAdapter::new(Arc::clone(&runtime.exit_hooks)),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                state: Mutex::new(BusState::default()),
                adapters: Mutex::new(adapters),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add `handler` to `category` and hand it back. Registering the same
    /// handler twice under one category is a no-op.
    pub fn register(&self, category: Category, handler: impl Into<Handler>) -> Handler {
        let handler = handler.into();
        let added = self
            .inner
            .state
            .lock()
            .handlers
            .entry(category)
            .or_default()
            .insert(handler.clone());
        if added {
            tracing::debug!("handler_registered: category={}, handler={:?}", category, handler);
        }
        handler
    }

    pub fn on_terminate(&self, handler: impl Into<Handler>) -> Handler {
        self.register(Category::Terminate, handler)
    }

    pub fn on_crash(&self, handler: impl Into<Handler>) -> Handler {
        self.register(Category::Crash, handler)
    }

    pub fn on_quit(&self, handler: impl Into<Handler>) -> Handler {
        self.register(Category::Quit, handler)
    }

    pub fn on_finish(&self, handler: impl Into<Handler>) -> Handler {
        self.register(Category::Finish, handler)
    }

    pub fn on_hold(&self, handler: impl Into<Handler>) -> Handler {
        self.register(Category::Hold, handler)
    }

    pub fn always(&self, handler: impl Into<Handler>) -> Handler {
        self.register(Category::Always, handler)
    }

    /// Handlers registered under `category`, in call order.
    pub fn handlers(&self, category: Category) -> Vec<Handler> {
        self.inner
            .state
            .lock()
            .handlers
            .get(&category)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, category: Category) -> usize {
        self.inner
            .state
            .lock()
            .handlers
            .get(&category)
            .map_or(0, HandlerSet::len)
    }

    /// Handlers already invoked in the current episode.
    pub fn delivered_count(&self) -> usize {
        self.inner.state.lock().ledger.len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Install the crash, signal and final-shutdown hooks.
    ///
    /// Returns `Ok(false)` if the bus was already started.
    pub fn start(&self) -> Result<bool> {
        let signals = self.inner.config.termination_signals()?;
        let mut adapters = self.inner.adapters.lock();
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Ok(false);
            }
            state.ledger.clear();
            state.crash_episode = false;
        }

        let weak = Arc::downgrade(&self.inner);
        adapters.crash.register(
            crash_callback(weak.clone()),
            self.inner.config.call_previous_exception_handler,
        );
        if let Err(err) = adapters.signals.register(terminate_callback(weak), &signals) {
            adapters.crash.restore();
            return Err(err);
        }
        // Holds the bus until stop() or process exit.
        adapters.exit.register(finish_callback(Arc::clone(&self.inner)));

        let mut state = self.inner.state.lock();
        state.started = true;
        state.owner = Some(std::thread::current().id());
        state.signals = signals;
        tracing::info!("lifecycle_bus_started: signals={:?}", state.signals);
        Ok(true)
    }

    /// Restore every hook found by [`start`](Self::start).
    ///
    /// Returns `Ok(false)` if the bus was not started.
    pub fn stop(&self) -> Result<bool> {
        let mut adapters = self.inner.adapters.lock();
        if !self.inner.state.lock().started {
            return Ok(false);
        }

        adapters.signals.restore_all()?;
        adapters.crash.restore();
        adapters.exit.unregister();

        let mut state = self.inner.state.lock();
        state.started = false;
        state.owner = None;
        state.pending_crash = None;
        tracing::info!("lifecycle_bus_stopped");
        Ok(true)
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// A quit interceptor that starts this bus on entry, routes explicit
    /// quits through the quit handlers, and delivers the crash episode for a
    /// panic that escapes it.
    pub fn scope(&self) -> QuitInterceptor<'static> {
        let enter = self.clone();
        let on_quit = Arc::clone(&self.inner);
        let leave = Arc::clone(&self.inner);
        let escape = Arc::clone(&self.inner);
        QuitInterceptor::new(
            move || {
                enter.start()?;
                enter.inner.enter_scope();
                Ok(())
            },
            move |quit| on_quit.handle_quit(quit),
        )
        .on_leave(move || leave.leave_scope())
        .on_escape(move |payload| escape.handle_escape(payload))
    }

    /// Run `f` inside [`scope`](Self::scope).
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Result<Scoped<T>> {
        self.scope().run(f)
    }
}

fn crash_callback(weak: Weak<Inner>) -> CrashCallback {
    Arc::new(move |report: &CrashReport, previous: Option<&dyn Fn()>| match weak.upgrade() {
        Some(inner) => inner.handle_crash(report, previous),
        None => {
            if let Some(call) = previous {
                call();
            }
        }
    })
}

fn terminate_callback(weak: Weak<Inner>) -> TerminateCallback {
    Arc::new(move |signal: Signal, context: &SignalContext, previous: &SignalAction| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_terminate(signal, context.clone(), previous.clone());
        }
    })
}

fn finish_callback(inner: Arc<Inner>) -> ExitCallback {
    ExitCallback::new(move || {
        tracing::debug!("final_shutdown");
        inner.handle_finish(&Event::Shutdown);
    })
}

fn on_main_thread(report: &CrashReport) -> bool {
    report.thread.as_deref() == Some("main")
}

impl Inner {
    // =========================================================================
    // Delivery
    // =========================================================================

    /// Invoke every handler of `category` not yet delivered this episode, in
    /// registration order. Each handler is claimed in the ledger right
    /// before it runs.
    fn deliver(&self, category: Category, event: &Event) {
        let mut index = 0;
        loop {
            let handler = {
                let mut state = self.state.lock();
                let Some(handler) = state
                    .handlers
                    .get(&category)
                    .and_then(|set| set.get(index))
                    .cloned()
                else {
                    break;
                };
                index += 1;
                if !state.ledger.claim(handler.id()) {
                    tracing::trace!("handler_skipped: category={}, handler={:?}", category, handler);
                    continue;
                }
                handler
            };
            tracing::debug!(
                "delivering: category={}, event={}, handler={:?}",
                category,
                event.kind(),
                handler
            );
            handler.call(event);
        }
    }

    fn handle_finish(&self, event: &Event) {
        self.deliver(Category::Finish, event);
        self.deliver(Category::Always, event);
    }

    fn handle_hold(&self, event: &Event) {
        self.deliver(Category::Hold, event);
        self.deliver(Category::Always, event);
        self.state.lock().ledger.clear();
        tracing::info!("episode_held: event={}", event.kind());
    }

    /// Forget the claims of a crash episode the process survived.
    fn recover_after_crash(&self) {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.crash_episode) {
            state.ledger.clear();
            tracing::warn!("crash_survived: ledger cleared");
        }
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Panic hook entry point. Runs for every panic, caught or not.
    fn handle_crash(&self, report: &CrashReport, previous: Option<&dyn Fn()>) {
        let deliver_now = {
            let mut state = self.state.lock();
            if state.owner != Some(report.thread_id) {
                false
            } else if state.crashing {
                tracing::error!("nested_crash_not_delivered: {}", report.message);
                false
            } else if state.scopes.contains(&report.thread_id) || !on_main_thread(report) {
                tracing::debug!("crash_deferred: {}", report.message);
                state.pending_crash = Some(report.clone());
                false
            } else {
                true
            }
        };
        if deliver_now {
            self.deliver_crash(report, previous.is_some(), previous);
        } else if let Some(call) = previous {
            call();
        }
    }

    /// A panic is leaving a scope uncaught.
    fn handle_escape(&self, payload: &(dyn Any + Send)) {
        let current = std::thread::current().id();
        let pending = {
            let mut state = self.state.lock();
            if state.owner != Some(current) || state.scopes.contains(&current) {
                return;
            }
            state.pending_crash.take()
        };
        let message = panic_message(payload);
        let (report, chained) = match pending {
            Some(report) if report.message == message => {
                (report, self.config.call_previous_exception_handler)
            }
            _ => (CrashReport::from_payload(payload), false),
        };
        self.deliver_crash(&report, chained, None);
    }

    fn deliver_crash(&self, report: &CrashReport, chained: bool, previous: Option<&dyn Fn()>) {
        self.recover_after_crash();
        let nested = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.crashing, true)
        };
        if nested {
            tracing::error!("nested_crash_not_delivered: {}", report.message);
            if let Some(call) = previous {
                call();
            }
            return;
        }

        tracing::error!("crash: {}", report.message);
        let event = Event::Crash(CrashEvent::new(report.clone(), chained));
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.deliver(Category::Crash, &event);
            if let Some(call) = previous {
                call();
            }
            self.handle_finish(&event);
        }));
        {
            let mut state = self.state.lock();
            state.crashing = false;
            state.crash_episode = true;
        }
        if let Err(payload) = outcome {
            resume_unwind(payload);
        }
    }

    fn handle_terminate(self: &Arc<Self>, signal: Signal, frame: SignalContext, previous: SignalAction) {
        self.recover_after_crash();
        let status = exit_status_for(signal);
        tracing::warn!("terminate_requested: signal={}, status={}", signal, status);
        let event = Event::Terminate(TerminateEvent::new(
            signal,
            frame,
            previous,
            self.runtime.exit.clone(),
        ));

        // Lift interception so a blocking handler stays interruptible.
        self.tear_down_signals();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.deliver(Category::Terminate, &event)
        }));
        self.reinstall_signals();

        match outcome {
            Ok(()) if self.config.exit_on_terminate => {
                self.handle_finish(&event);
                tracing::info!("terminate_exit: status={}", status);
                self.runtime.exit.call(status);
            }
            Ok(()) => self.handle_hold(&event),
            Err(payload) => match ControlFlow::from_payload(payload) {
                ControlFlow::Quit(quit) => {
                    tracing::info!("terminate_quit_requested: code={}", quit.code());
                    self.handle_finish(&event);
                    ControlFlow::Quit(quit).resume();
                }
                ControlFlow::Interrupted(again) => {
                    tracing::warn!("terminate_repeated: signal={}", again.signal);
                    self.state.lock().ledger.clear();
                    let previous = self
                        .adapters
                        .lock()
                        .signals
                        .recorded(again.signal)
                        .unwrap_or(SignalAction::Default);
                    self.handle_terminate(again.signal, again.context, previous);
                }
                other => other.resume(),
            },
        }
    }

    fn handle_quit(&self, quit: Quit) -> QuitResolution {
        self.recover_after_crash();
        tracing::info!("quit_requested: code={}", quit.code());
        let event = Event::Quit(QuitEvent::new(quit.code(), self.runtime.exit.clone()));
        let outcome = catch_unwind(AssertUnwindSafe(|| self.deliver(Category::Quit, &event)));

        match outcome {
            Ok(()) if self.config.exit_after_quit_handlers => {
                self.handle_finish(&event);
                QuitResolution::Exit
            }
            Ok(()) => {
                self.handle_hold(&event);
                QuitResolution::Hold
            }
            Err(payload) => match ControlFlow::from_payload(payload) {
                ControlFlow::Quit(again) => {
                    tracing::info!("quit_handler_requested_exit: code={}", again.code());
                    self.handle_finish(&event);
                    ControlFlow::Quit(again).resume();
                }
                other => other.resume(),
            },
        }
    }

    // =========================================================================
    // Scope bookkeeping
    // =========================================================================

    fn enter_scope(&self) {
        self.recover_after_crash();
        let current = std::thread::current().id();
        let mut state = self.state.lock();
        state.scopes.push(current);
        if state
            .pending_crash
            .as_ref()
            .is_some_and(|report| report.thread_id == current)
        {
            // A recovered panic from before this scope.
            state.pending_crash = None;
        }
    }

    fn leave_scope(&self) {
        let current = std::thread::current().id();
        let mut state = self.state.lock();
        if let Some(pos) = state.scopes.iter().rposition(|id| *id == current) {
            state.scopes.remove(pos);
        }
    }

    // =========================================================================
    // Signal interception around terminate delivery
    // =========================================================================

    fn tear_down_signals(&self) {
        let signals = {
            let state = self.state.lock();
            if !state.started {
                return;
            }
            state.signals.clone()
        };
        if let Err(err) = self.adapters.lock().signals.restore(&signals) {
            tracing::error!("signal_teardown_failed: {}", err);
        }
    }

    fn reinstall_signals(self: &Arc<Self>) {
        let signals = {
            let state = self.state.lock();
            if !state.started {
                return;
            }
            state.signals.clone()
        };
        let callback = terminate_callback(Arc::downgrade(self));
        if let Err(err) = self.adapters.lock().signals.register(callback, &signals) {
            tracing::error!("signal_reinstall_failed: {}", err);
        }
    }
}

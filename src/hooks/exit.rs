//! Final-shutdown hook adapter.
//!
//! A final-shutdown callback runs once, with no arguments, when the process
//! leaves through the normal exit path: returning from `main` or
//! `std::process::exit`. It does not run on a forced `_exit` or when a
//! signal kills the process.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once, OnceLock};

use crate::utils::panic_message;

/// A zero-argument callback with pointer identity.
#[derive(Clone)]
pub struct ExitCallback(Arc<dyn Fn() + Send + Sync>);

impl ExitCallback {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self) {
        (self.0)()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExitCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExitCallback({:p})", Arc::as_ptr(&self.0))
    }
}

/// The process-wide final-shutdown registry.
pub trait ExitSlot: Send + Sync + fmt::Debug {
    fn register(&self, callback: ExitCallback);
    fn unregister(&self, callback: &ExitCallback);
}

static REGISTRY: OnceLock<Mutex<Vec<ExitCallback>>> = OnceLock::new();
static ATEXIT: Once = Once::new();

fn registry() -> &'static Mutex<Vec<ExitCallback>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

extern "C" fn run_exit_callbacks() {
    let callbacks = std::mem::take(&mut *registry().lock());
    for callback in callbacks.iter().rev() {
        // Unwinding out of an `extern "C"` function aborts the process.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback.call())) {
            tracing::error!("exit_callback_panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

/// [`ExitSlot`] backed by a single `atexit(3)` registration. Callbacks run
/// in reverse registration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExitHooks;

impl ExitSlot for ProcessExitHooks {
    #[allow(unsafe_code)]
    fn register(&self, callback: ExitCallback) {
        ATEXIT.call_once(|| {
            // SAFETY: `run_exit_callbacks` is a plain `extern "C" fn()` that
            // never unwinds across the C boundary.
            let rc = unsafe { libc::atexit(run_exit_callbacks) };
            if rc != 0 {
                tracing::warn!("atexit_registration_failed: rc={}", rc);
            }
        });
        registry().lock().push(callback);
    }

    fn unregister(&self, callback: &ExitCallback) {
        registry().lock().retain(|c| !c.ptr_eq(callback));
    }
}

/// Installs one [`ExitCallback`] into an [`ExitSlot`].
pub struct ExitHookAdapter {
    slot: Arc<dyn ExitSlot>,
    installed: Option<ExitCallback>,
}

impl ExitHookAdapter {
    pub fn new(slot: Arc<dyn ExitSlot>) -> Self {
        Self {
            slot,
            installed: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Install `callback`, replacing the one this adapter installed before.
    pub fn register(&mut self, callback: ExitCallback) {
        self.unregister();
        self.slot.register(callback.clone());
        self.installed = Some(callback);
    }

    /// Remove the installed callback. No-op when nothing is installed.
    pub fn unregister(&mut self) {
        if let Some(callback) = self.installed.take() {
            self.slot.unregister(&callback);
        }
    }
}

impl fmt::Debug for ExitHookAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHookAdapter")
            .field("slot", &self.slot)
            .field("installed", &self.installed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExitHooks;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pending() -> usize {
        registry().lock().len()
    }

    #[test]
    fn test_register_unregister_symmetry() {
        let slot = Arc::new(FakeExitHooks::new());
        let mut adapter = ExitHookAdapter::new(slot.clone());

        adapter.unregister();
        assert_eq!(slot.len(), 0);

        adapter.register(ExitCallback::new(|| {}));
        assert!(adapter.is_installed());
        assert_eq!(slot.len(), 1);

        adapter.register(ExitCallback::new(|| {}));
        assert_eq!(slot.len(), 1);

        adapter.unregister();
        assert!(!adapter.is_installed());
        assert_eq!(slot.len(), 0);
    }

    #[test]
    fn test_fake_runs_in_reverse_order() {
        let slot = FakeExitHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let o = order.clone();
            slot.register(ExitCallback::new(move || o.lock().push(i)));
        }
        slot.run();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert_eq!(slot.len(), 0);
    }

    #[test]
    #[serial(exit_hooks)]
    fn test_process_registry_unregister_by_identity() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let keep = ExitCallback::new(|| {});
        let drop_me = ExitCallback::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let before = pending();
        ProcessExitHooks.register(keep.clone());
        ProcessExitHooks.register(drop_me.clone());
        assert_eq!(pending(), before + 2);

        ProcessExitHooks.unregister(&drop_me);
        ProcessExitHooks.unregister(&keep);
        assert_eq!(pending(), before);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

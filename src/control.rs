//! Control-flow unwinds understood by the bus.
//!
//! Two conditions travel as unwinding payloads rather than return values:
//! an explicit request to quit with a status code, and a repeated
//! termination request arriving while terminate handlers still run. Both
//! are raised with [`std::panic::resume_unwind`], so the panic hook (and with
//! it the crash path) never sees them. They are caught only where the bus
//! or the quit interceptor knows how to resume.

use nix::sys::signal::Signal;
use std::any::Any;
use std::panic::resume_unwind;
use std::process::ExitCode;

use crate::hooks::SignalContext;

/// An explicit request to end the process with `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quit {
    code: i32,
}

impl Quit {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    /// End the process through the normal exit path (final-shutdown hooks run).
    pub fn exit(self) -> ! {
        std::process::exit(self.code)
    }
}

impl From<Quit> for ExitCode {
    fn from(quit: Quit) -> Self {
        // Shells only ever observe the low byte.
        ExitCode::from((quit.code & 0xff) as u8)
    }
}

/// A termination request that arrived while the bus had its own
/// interception torn down.
#[derive(Debug, Clone)]
pub struct Interrupted {
    pub signal: Signal,
    pub context: SignalContext,
}

/// Unwind the current thread with a [`Quit`] payload.
///
/// Must be called inside a [`QuitInterceptor`](crate::QuitInterceptor) scope
/// (or a handler running under one); otherwise the unwind ends the thread.
pub fn quit(code: i32) -> ! {
    resume_unwind(Box::new(Quit::new(code)))
}

/// Unwind the current thread with an [`Interrupted`] payload for `signal`.
pub fn raise_interrupt(signal: Signal, context: SignalContext) -> ! {
    resume_unwind(Box::new(Interrupted { signal, context }))
}

/// Classification of a caught unwind payload.
#[derive(Debug)]
pub enum ControlFlow {
    Quit(Quit),
    Interrupted(Interrupted),
    /// Anything else: a real panic that must keep unwinding.
    Other(Box<dyn Any + Send>),
}

impl ControlFlow {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Quit>() {
            Ok(quit) => return Self::Quit(*quit),
            Err(other) => other,
        };
        match payload.downcast::<Interrupted>() {
            Ok(interrupted) => Self::Interrupted(*interrupted),
            Err(other) => Self::Other(other),
        }
    }

    /// Continue unwinding with the original payload.
    pub fn resume(self) -> ! {
        match self {
            Self::Quit(quit) => resume_unwind(Box::new(quit)),
            Self::Interrupted(interrupted) => resume_unwind(Box::new(interrupted)),
            Self::Other(payload) => resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_quit_payload_round_trip() {
        let payload = catch_unwind(|| quit(3)).unwrap_err();
        match ControlFlow::from_payload(payload) {
            ControlFlow::Quit(q) => assert_eq!(q.code(), 3),
            other => panic!("expected quit, got {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_payload() {
        let payload =
            catch_unwind(|| raise_interrupt(Signal::SIGINT, SignalContext::now())).unwrap_err();
        match ControlFlow::from_payload(payload) {
            ControlFlow::Interrupted(i) => assert_eq!(i.signal, Signal::SIGINT),
            other => panic!("expected interrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_panic_is_other() {
        let payload = catch_unwind(|| resume_unwind(Box::new("boom"))).unwrap_err();
        match ControlFlow::from_payload(payload) {
            ControlFlow::Other(p) => assert_eq!(p.downcast_ref::<&str>(), Some(&"boom")),
            other => panic!("expected other, got {other:?}"),
        }
    }
}

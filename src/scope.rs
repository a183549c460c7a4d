//! Quit interception.
//!
//! Nothing in the process announces an explicit quit: a [`Quit`] simply
//! unwinds. [`QuitInterceptor`] is the frame that catches it, hands it to
//! `on_quit`, and reports whether the process should still exit.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use crate::control::{ControlFlow, Quit};
use crate::types::Result;

/// What `on_quit` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitResolution {
    /// Let the quit proceed to process exit.
    Exit,
    /// Suppress the quit; the process keeps running.
    Hold,
}

/// Outcome of a block run inside a [`QuitInterceptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Scoped<T> {
    /// The block returned normally.
    Completed(T),
    /// The block quit and the quit was suppressed.
    Held(Quit),
    /// The block quit and the process should now exit with this code.
    Exiting(Quit),
}

impl<T> Scoped<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Scoped::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_exiting(&self) -> bool {
        matches!(self, Scoped::Exiting(_))
    }

    /// The quit that ended the block, if one did.
    pub fn quit(&self) -> Option<Quit> {
        match self {
            Scoped::Completed(_) => None,
            Scoped::Held(quit) | Scoped::Exiting(quit) => Some(*quit),
        }
    }

    /// End the process if the outcome says so; otherwise hand it back.
    pub fn exit_if_requested(self) -> Self {
        if let Scoped::Exiting(quit) = self {
            tracing::info!("exiting: code={}", quit.code());
            quit.exit();
        }
        self
    }
}

type OnEnter<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;
type OnQuit<'a> = Box<dyn FnOnce(Quit) -> QuitResolution + 'a>;
type OnLeave<'a> = Box<dyn FnOnce() + 'a>;
type OnEscape<'a> = Box<dyn FnOnce(&(dyn Any + Send)) + 'a>;

/// Catches a [`Quit`] unwinding out of a block.
pub struct QuitInterceptor<'a> {
    on_enter: OnEnter<'a>,
    on_quit: OnQuit<'a>,
    on_leave: Option<OnLeave<'a>>,
    on_escape: Option<OnEscape<'a>>,
}

impl<'a> QuitInterceptor<'a> {
    pub fn new(
        on_enter: impl FnOnce() -> Result<()> + 'a,
        on_quit: impl FnOnce(Quit) -> QuitResolution + 'a,
    ) -> Self {
        Self {
            on_enter: Box::new(on_enter),
            on_quit: Box::new(on_quit),
            on_leave: None,
            on_escape: None,
        }
    }

    /// Run `on_leave` as soon as the block is done, however it ended.
    pub fn on_leave(mut self, on_leave: impl FnOnce() + 'a) -> Self {
        self.on_leave = Some(Box::new(on_leave));
        self
    }

    /// Run `on_escape` with the payload of an unwind that is about to leave
    /// the scope uncaught. Quits and interrupts never reach it.
    pub fn on_escape(mut self, on_escape: impl FnOnce(&(dyn Any + Send)) + 'a) -> Self {
        self.on_escape = Some(Box::new(on_escape));
        self
    }

    /// Run `on_enter`, then `f`.
    ///
    /// Only a [`Quit`] is intercepted. Every other unwind, including an
    /// [`Interrupted`](crate::control::Interrupted), passes through
    /// untouched. A quit raised by `on_quit` itself means the process must
    /// exit with that code.
    pub fn run<T>(self, f: impl FnOnce() -> T) -> Result<Scoped<T>> {
        let Self {
            on_enter,
            on_quit,
            on_leave,
            on_escape,
        } = self;
        on_enter()?;

        let outcome = catch_unwind(AssertUnwindSafe(f));
        if let Some(leave) = on_leave {
            leave();
        }
        let quit = match outcome {
            Ok(value) => return Ok(Scoped::Completed(value)),
            Err(payload) => match ControlFlow::from_payload(payload) {
                ControlFlow::Quit(quit) => quit,
                ControlFlow::Other(payload) => {
                    if let Some(escape) = on_escape {
                        escape(payload.as_ref());
                    }
                    resume_unwind(payload)
                }
                other => other.resume(),
            },
        };
        tracing::debug!("quit_intercepted: code={}", quit.code());

        match catch_unwind(AssertUnwindSafe(|| on_quit(quit))) {
            Ok(QuitResolution::Exit) => Ok(Scoped::Exiting(quit)),
            Ok(QuitResolution::Hold) => Ok(Scoped::Held(quit)),
            Err(payload) => match ControlFlow::from_payload(payload) {
                ControlFlow::Quit(forced) => Ok(Scoped::Exiting(forced)),
                other => other.resume(),
            },
        }
    }

    /// Turn `f` into a closure that runs inside this interceptor.
    pub fn wrap<T: 'a>(
        self,
        f: impl FnOnce() -> T + 'a,
    ) -> impl FnOnce() -> Result<Scoped<T>> + 'a {
        move || self.run(f)
    }
}

impl fmt::Debug for QuitInterceptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuitInterceptor").finish_non_exhaustive()
    }
}

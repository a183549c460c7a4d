//! # Lifecycle Bus - process lifecycle events for Rust programs
//!
//! One place to register code that must run when the process is ending:
//! - Crash: an uncaught panic on the thread that started the bus
//! - Terminate: a termination-request signal (SIGINT, SIGTERM by default)
//! - Quit: an explicit [`quit`] from inside a bus scope
//! - Finish / Hold / Always: how an episode resolves
//!
//! ## Architecture
//!
//! ```text
//!   panic hook ──► ExceptionHookAdapter ─┐
//!   sigaction ───► SignalAdapter ────────┼──► EventBus ──► handlers (ordered,
//!   atexit ──────► ExitHookAdapter ──────┤                 at most once per episode)
//!   quit(code) ──► QuitInterceptor ──────┘
//! ```
//!
//! Signals are recorded by an async-signal-safe trampoline and dispatched
//! by [`dispatch_pending`] on the thread that owns the bus.
//!
//! A started bus stays registered for final shutdown until
//! [`EventBus::stop`], so it can be a plain local in `main`. A panic counts
//! as a crash once it escapes the bus scope.
//!
//! ```no_run
//! use lifecycle_bus::{BusConfig, Event, EventBus};
//!
//! let bus = EventBus::new(BusConfig::default());
//! bus.on_finish(|event: &Event| eprintln!("finishing after {}", event.kind()));
//! let outcome = bus.run(|| {
//!     loop {
//!         lifecycle_bus::dispatch_pending();
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//! });
//! ```

// Enforce strict safety at compile time; the OS hooks opt out locally.
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod bus;
pub mod control;
pub mod hooks;
pub mod scope;
pub mod testing;
pub mod types;
pub mod utils;

// Internal utilities
pub mod observability;

pub use bus::{Category, CrashEvent, Event, EventBus, Handler, QuitEvent, TerminateEvent};
pub use control::{quit, Quit};
pub use hooks::{dispatch_pending, Runtime, SignalAction, SignalContext};
pub use scope::{QuitInterceptor, QuitResolution, Scoped};
pub use types::{BusConfig, Error, Result};

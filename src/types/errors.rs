//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Handler
//! panics are never folded into these; they keep unwinding.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the lifecycle bus.
#[derive(Error, Debug)]
pub enum Error {
    /// A signal name that does not map to a platform signal.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// The OS refused to change a signal disposition.
    #[error("failed to install handler for {signal}: {source}")]
    SignalInstall {
        signal: String,
        #[source]
        source: nix::Error,
    },

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn unknown_signal(name: impl Into<String>) -> Self {
        Self::UnknownSignal(name.into())
    }

    pub fn signal_install(signal: nix::sys::signal::Signal, source: nix::Error) -> Self {
        Self::SignalInstall {
            signal: signal.as_str().to_string(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

//! Configuration structures.
//!
//! Configuration is built from defaults, a JSON file, or environment
//! variables (`LIFECYCLE_*`), in that order of precedence when combined
//! through [`BusConfig::from_env`].

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use super::errors::{Error, Result};

const ENV_CALL_PREVIOUS: &str = "LIFECYCLE_CALL_PREVIOUS_EXCEPTION_HANDLER";
const ENV_EXIT_ON_TERMINATE: &str = "LIFECYCLE_EXIT_ON_TERMINATE";
const ENV_EXIT_AFTER_QUIT: &str = "LIFECYCLE_EXIT_AFTER_QUIT_HANDLERS";
const ENV_SIGNALS: &str = "LIFECYCLE_SIGNALS";

/// Construction-time policy of an [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Run whatever panic hook was installed before the bus after crash
    /// handlers have seen the event.
    pub call_previous_exception_handler: bool,

    /// After terminate handlers run, end the process instead of holding.
    pub exit_on_terminate: bool,

    /// After quit handlers run, let the exit proceed instead of holding.
    pub exit_after_quit_handlers: bool,

    /// Termination-request signals intercepted by the bus.
    pub signals: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            call_previous_exception_handler: true,
            exit_on_terminate: true,
            exit_after_quit_handlers: true,
            signals: vec!["SIGINT".to_string(), "SIGTERM".to_string()],
        }
    }
}

impl BusConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Overlay `LIFECYCLE_*` environment variables onto this config.
    pub fn from_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_CALL_PREVIOUS) {
            self.call_previous_exception_handler = parse_flag(ENV_CALL_PREVIOUS, &v)?;
        }
        if let Some(v) = lookup(ENV_EXIT_ON_TERMINATE) {
            self.exit_on_terminate = parse_flag(ENV_EXIT_ON_TERMINATE, &v)?;
        }
        if let Some(v) = lookup(ENV_EXIT_AFTER_QUIT) {
            self.exit_after_quit_handlers = parse_flag(ENV_EXIT_AFTER_QUIT, &v)?;
        }
        if let Some(v) = lookup(ENV_SIGNALS) {
            self.signals = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn with_call_previous_exception_handler(mut self, enabled: bool) -> Self {
        self.call_previous_exception_handler = enabled;
        self
    }

    pub fn with_exit_on_terminate(mut self, enabled: bool) -> Self {
        self.exit_on_terminate = enabled;
        self
    }

    pub fn with_exit_after_quit_handlers(mut self, enabled: bool) -> Self {
        self.exit_after_quit_handlers = enabled;
        self
    }

    pub fn with_signals<I, S>(mut self, signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signals = signals.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve signal names (`"SIGINT"`, `"INT"` or `"int"`) into signals.
    pub fn termination_signals(&self) -> Result<Vec<Signal>> {
        let mut resolved = Vec::with_capacity(self.signals.len());
        for name in &self.signals {
            let signal = parse_signal(name)?;
            if !resolved.contains(&signal) {
                resolved.push(signal);
            }
        }
        Ok(resolved)
    }
}

fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&canonical).map_err(|_| Error::unknown_signal(name))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

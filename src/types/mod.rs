//! Core types for the lifecycle bus.
//!
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Bus policy and intercepted signal set

mod config;
mod errors;

pub use config::BusConfig;
pub use errors::{Error, Result};

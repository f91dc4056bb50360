#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Composition root: configuration loading and runtime wiring for the
//! proactive agent binary.

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

/// Bus, services and journal wiring.
#[path = "../runtime.rs"]
pub mod runtime;

pub use config::AgentConfig;
pub use runtime::{AgentRuntime, Components, RuntimeReport};

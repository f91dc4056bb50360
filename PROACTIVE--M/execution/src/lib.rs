#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Execution stage: runs a whitelisted command for every `execute` decision
//! and reports the outcome as `execution_result`.

/// Command derivation and the allow-list.
#[path = "../command.rs"]
pub mod command;

/// Process runners.
#[path = "../runner.rs"]
pub mod runner;

/// The execution service.
#[path = "../service.rs"]
pub mod service;

use std::time::Duration;

use thiserror::Error;

pub use command::{derive_command, CommandPolicy};
pub use runner::{merge_output, CommandRunner, Invocation, ProcessCommandRunner, RunOutcome};
pub use service::{ExecutionConfig, ExecutionService, ExecutionStats};

/// Errors raised while running a command.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The program could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
    /// The program outlived its deadline and was killed.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

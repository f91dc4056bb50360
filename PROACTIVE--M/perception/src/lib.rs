#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Perception stage: turns raw filesystem notifications into `file_event`
//! messages.

/// Change-notification sources and the `notify`-backed implementation.
#[path = "../source.rs"]
pub mod source;

/// Watch-root expansion and the extension allow-list.
#[path = "../filter.rs"]
pub mod filter;

/// The perception service.
#[path = "../service.rs"]
pub mod service;

use std::path::PathBuf;

use thiserror::Error;

pub use filter::{expand_home, ExtensionFilter};
pub use service::{PerceptionConfig, PerceptionService, PerceptionStats};
pub use source::{ChangeSource, NotifyChangeSource, RawChange, RawOperation};

/// Errors raised while registering watch roots.
#[derive(Debug, Error)]
pub enum PerceptionError {
    /// The root does not exist.
    #[error("watch root {0} does not exist")]
    MissingRoot(PathBuf),
    /// The source was already closed.
    #[error("change source is closed")]
    Closed,
    /// The OS watcher refused the operation.
    #[error("watcher: {0}")]
    Watch(#[from] notify::Error),
}

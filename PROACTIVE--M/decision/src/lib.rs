#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Decision stage: resolves each `file_event` into a `decision` through a
//! rate limiter, a decision cache and a reasoning service.

/// Reasoning-service clients.
#[path = "../reasoning.rs"]
pub mod reasoning;

/// Cache and rate-limit backends.
#[path = "../cache.rs"]
pub mod cache;

/// Prompt construction and reply parsing.
#[path = "../prompt.rs"]
pub mod prompt;

/// The decision service.
#[path = "../service.rs"]
pub mod service;

use std::time::Duration;

use thiserror::Error;

pub use cache::{CacheBackend, MemoryCacheBackend, RATE_LIMIT_KEY};
pub use prompt::{build_prompt, cache_key, parse_decision};
pub use reasoning::{
    GenerationParams, HttpReasoningClient, OfflineReasoningClient, ReasoningClient,
    DEFAULT_REPROBE_INTERVAL,
};
pub use service::{
    DecisionConfig, DecisionService, DecisionStats, Resolution, ResolutionSource,
};

/// Errors raised by the reasoning client and cache backends.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// The reasoning service is known to be unreachable.
    #[error("reasoning service unavailable")]
    Unavailable,
    /// The call exceeded its deadline.
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),
    /// Transport or status failure.
    #[error("reasoning transport: {0}")]
    Http(#[from] reqwest::Error),
    /// The cache backend failed.
    #[error("cache backend: {0}")]
    Cache(String),
}

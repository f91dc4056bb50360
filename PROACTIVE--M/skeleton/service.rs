use std::any::Any;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::workers::Workers;

/// Component managed by the [`ServiceManager`](crate::ServiceManager).
///
/// `start` should spawn its internal loops and return promptly; every loop it
/// spawns must select on `token`. `stop` releases resources and waits for those
/// loops to exit.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable name used in logs and state reports.
    fn name(&self) -> &str;

    /// Starts the service.
    async fn start(&self, token: CancellationToken) -> Result<(), ServiceError>;

    /// Stops the service and joins its workers.
    async fn stop(&self) -> Result<(), ServiceError>;

    /// Workers the manager watches so a panicking loop fails the service at
    /// once rather than at the next `stop`.
    fn workers(&self) -> Option<&Workers> {
        None
    }
}

/// Lifecycle state tracked by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ServiceState {
    /// Registered but not launched.
    Pending,
    /// Launched and not yet stopped.
    Running,
    /// Stopped cleanly.
    Stopped,
    /// Start failed, panicked, or a worker panicked.
    Failed(String),
}

impl ServiceState {
    /// Whether the service ended in failure.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Errors raised by service lifecycles.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Start could not complete.
    #[error("{service} failed to start: {reason}")]
    Start {
        /// Service name.
        service: String,
        /// Failure detail.
        reason: String,
    },
    /// `start` was called twice.
    #[error("{0} is already running")]
    AlreadyRunning(String),
    /// A service body or one of its workers panicked.
    #[error("{service} panicked: {reason}")]
    Panicked {
        /// Service name.
        service: String,
        /// Panic message.
        reason: String,
    },
}

/// Extracts a readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_handles_both_payload_types() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        let opaque_payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(static_payload.as_ref()), "boom");
        assert_eq!(panic_message(owned_payload.as_ref()), "kaboom");
        assert_eq!(panic_message(opaque_payload.as_ref()), "unknown panic");
    }
}

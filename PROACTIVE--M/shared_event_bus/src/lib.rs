#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! In-process publish/subscribe bus connecting the perception, decision, and
//! execution stages.
//!
//! Delivery is best-effort: publishing never blocks, and a full inbound buffer
//! or subscriber queue drops the newest message. Drops are counted and exposed
//! through [`BusMetrics`].

/// Typed message envelope and payload variants.
#[path = "../message.rs"]
pub mod message;

/// Message bus, subscriptions, and metrics.
#[path = "../bus.rs"]
pub mod bus;

/// Append-only JSONL journal fed by a wildcard subscription.
#[path = "../journal.rs"]
pub mod journal;

use thiserror::Error;

pub use bus::{
    BusMetrics, MessageBus, QueueDepth, Subscription, SubscriptionId, DEFAULT_BUFFER_SIZE,
};
pub use journal::MessageJournal;
pub use message::{
    kinds, CommandExecutionPayload, DecisionKind, DecisionPayload, EventRecord, EventType,
    ExecutionResultPayload, FileEventPayload, Message, Payload, PerceptionTriggerPayload,
    WILDCARD,
};

/// Errors surfaced by the bus and its helpers.
#[derive(Debug, Error)]
pub enum BusError {
    /// The dispatch loop was already started (or started and stopped).
    #[error("message bus already started")]
    AlreadyStarted,
    /// The kind cannot be used for a published message.
    #[error("invalid message kind '{0}'")]
    InvalidKind(String),
    /// A payload does not satisfy the contract of its kind.
    #[error("invalid payload for '{kind}': {reason}")]
    InvalidPayload {
        /// Kind whose contract was violated.
        kind: String,
        /// Decoder detail.
        reason: String,
    },
    /// Journal file could not be written.
    #[error("journal i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Journal record could not be encoded.
    #[error("journal encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

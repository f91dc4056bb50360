#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Lifecycle skeleton shared by the pipeline services: the [`Service`]
//! contract, the [`ServiceManager`] that owns every service, and the worker
//! and telemetry helpers services are built from.

/// Service contract, lifecycle state, and errors.
#[path = "../service.rs"]
pub mod service;

/// Manager starting and stopping services as one unit.
#[path = "../manager.rs"]
pub mod manager;

/// Panic-isolated background workers owned by a service.
#[path = "../workers.rs"]
pub mod workers;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use manager::ServiceManager;
pub use service::{Service, ServiceError, ServiceState};
pub use telemetry::{ServiceTelemetry, ServiceTelemetryBuilder};
pub use tokio_util::sync::CancellationToken;
pub use workers::Workers;

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::service::{panic_message, ServiceError};

/// Background loops owned by one service.
///
/// Each worker runs behind a panic boundary: a panic is logged and recorded,
/// wakes [`panicked`](Self::panicked), and surfaces from
/// [`join`](Self::join) instead of unwinding into the runtime.
#[derive(Debug)]
pub struct Workers {
    service: String,
    handles: Mutex<Vec<JoinHandle<()>>>,
    failures: Arc<Mutex<Vec<String>>>,
    tripped: Mutex<CancellationToken>,
}

impl Workers {
    /// Creates an empty set for `service`.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handles: Mutex::new(Vec::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
            tripped: Mutex::new(CancellationToken::new()),
        }
    }

    /// Spawns a named worker on the current runtime.
    pub fn spawn<F>(&self, label: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let service = self.service.clone();
        let failures = Arc::clone(&self.failures);
        let tripped = self.tripped.lock().clone();
        let handle = tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
                let reason = panic_message(panic.as_ref());
                error!(service = %service, worker = label, %reason, "worker panicked");
                failures.lock().push(format!("{label}: {reason}"));
                tripped.cancel();
            }
        });
        self.handles.lock().push(handle);
    }

    /// Number of workers spawned and not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether no workers are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves with the first panic reason once any worker has panicked.
    pub async fn panicked(&self) -> String {
        let tripped = self.tripped.lock().clone();
        tripped.cancelled().await;
        self.failures.lock().first().cloned().unwrap_or_default()
    }

    /// Waits for every worker to exit. Fails if any of them panicked.
    pub async fn join(&self) -> Result<(), ServiceError> {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(service = %self.service, %err, "worker join failed");
            }
        }
        let failures = std::mem::take(&mut *self.failures.lock());
        *self.tripped.lock() = CancellationToken::new();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Panicked {
                service: self.service.clone(),
                reason: failures.join("; "),
            })
        }
    }
}

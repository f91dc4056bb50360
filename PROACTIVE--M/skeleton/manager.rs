use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::service::{panic_message, Service, ServiceError, ServiceState};

struct ManagedService {
    service: Arc<dyn Service>,
    state: Arc<RwLock<ServiceState>>,
}

/// Owns every pipeline service and is the only caller of their lifecycle.
pub struct ServiceManager {
    services: Vec<ManagedService>,
    root: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.states())
            .finish_non_exhaustive()
    }
}

impl ServiceManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            root: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a service. Services start in registration order and stop in
    /// reverse.
    pub fn add_service(&mut self, service: Arc<dyn Service>) {
        self.services.push(ManagedService {
            service,
            state: Arc::new(RwLock::new(ServiceState::Pending)),
        });
    }

    /// Root token; every service receives a child of it.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Launches every service on its own task and returns once all are spawned.
    ///
    /// A failing or panicking `start`, or a panic in one of the service's
    /// [`workers`](Service::workers), marks only that service as
    /// [`ServiceState::Failed`].
    pub fn start_all(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("services already started");
            return;
        }
        for managed in &self.services {
            let service = Arc::clone(&managed.service);
            let state = Arc::clone(&managed.state);
            let token = self.root.child_token();
            let watch = token.clone();
            *state.write() = ServiceState::Running;
            tasks.push(tokio::spawn(async move {
                let name = service.name().to_string();
                let started = match AssertUnwindSafe(service.start(token)).catch_unwind().await {
                    Ok(Ok(())) => {
                        info!(service = %name, "service started");
                        true
                    }
                    Ok(Err(err)) => {
                        error!(service = %name, %err, "service failed to start");
                        *state.write() = ServiceState::Failed(err.to_string());
                        false
                    }
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        error!(service = %name, %reason, "service panicked");
                        *state.write() = ServiceState::Failed(format!("panicked: {reason}"));
                        false
                    }
                };
                let Some(workers) = service.workers().filter(|_| started) else {
                    return;
                };
                tokio::select! {
                    biased;
                    () = watch.cancelled() => {}
                    reason = workers.panicked() => {
                        error!(service = %name, %reason, "service worker panicked");
                        *state.write() = ServiceState::Failed(format!("worker panicked: {reason}"));
                    }
                }
            }));
        }
        info!(count = self.services.len(), "all services launched");
    }

    /// Stops every service, cancels the shared token, and waits for all
    /// service tasks to exit.
    pub async fn stop_all(&self) {
        for managed in self.services.iter().rev() {
            let name = managed.service.name().to_string();
            let outcome = AssertUnwindSafe(managed.service.stop())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ServiceError::Panicked {
                        service: name.clone(),
                        reason: panic_message(panic.as_ref()),
                    })
                });
            let mut state = managed.state.write();
            match outcome {
                Ok(()) if !state.is_failed() => *state = ServiceState::Stopped,
                Ok(()) => {}
                Err(err) => {
                    warn!(service = %name, %err, "service stopped with error");
                    *state = ServiceState::Failed(err.to_string());
                }
            }
        }

        self.root.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "service task join failed");
            }
        }
        info!("all services stopped");
    }

    /// Current state of each service, in registration order.
    #[must_use]
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|managed| {
                (
                    managed.service.name().to_string(),
                    managed.state.read().clone(),
                )
            })
            .collect()
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::workers::Workers;

    struct LoopService {
        name: &'static str,
        workers: Workers,
        ticks: Arc<AtomicUsize>,
        stopped: AtomicBool,
    }

    impl LoopService {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                workers: Workers::new(name),
                ticks: Arc::new(AtomicUsize::new(0)),
                stopped: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Service for LoopService {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self, token: CancellationToken) -> Result<(), ServiceError> {
            let ticks = Arc::clone(&self.ticks);
            self.workers.spawn("loop", async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_millis(1)) => {
                            ticks.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.stopped.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    struct PanickingService;

    #[async_trait]
    impl Service for PanickingService {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn start(&self, _token: CancellationToken) -> Result<(), ServiceError> {
            panic!("start exploded");
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    struct FaultyWorkerService {
        workers: Workers,
    }

    #[async_trait]
    impl Service for FaultyWorkerService {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn start(&self, _token: CancellationToken) -> Result<(), ServiceError> {
            self.workers.spawn("indexer", async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                panic!("index corrupted");
            });
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.workers.join().await
        }

        fn workers(&self) -> Option<&Workers> {
            Some(&self.workers)
        }
    }

    struct RefusingService;

    #[async_trait]
    impl Service for RefusingService {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn start(&self, _token: CancellationToken) -> Result<(), ServiceError> {
            Err(ServiceError::Start {
                service: "refusing".into(),
                reason: "no watcher".into(),
            })
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn starts_and_stops_every_service() {
        let first = Arc::new(LoopService::new("first"));
        let second = Arc::new(LoopService::new("second"));
        let mut manager = ServiceManager::new();
        manager.add_service(first.clone());
        manager.add_service(second.clone());
        assert_eq!(manager.states()[0].1, ServiceState::Pending);

        manager.start_all();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first.ticks.load(Ordering::Relaxed) > 0);
        assert!(second.ticks.load(Ordering::Relaxed) > 0);

        manager.stop_all().await;
        first.workers.join().await.unwrap();
        second.workers.join().await.unwrap();
        assert!(first.stopped.load(Ordering::Relaxed));
        assert!(manager.token().is_cancelled());
        assert!(manager
            .states()
            .iter()
            .all(|(_, state)| *state == ServiceState::Stopped));
    }

    #[tokio::test]
    async fn panicking_service_does_not_take_down_others() {
        let healthy = Arc::new(LoopService::new("healthy"));
        let mut manager = ServiceManager::new();
        manager.add_service(Arc::new(PanickingService));
        manager.add_service(Arc::new(RefusingService));
        manager.add_service(healthy.clone());

        manager.start_all();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(healthy.ticks.load(Ordering::Relaxed) > 0);

        let states = manager.states();
        assert!(matches!(&states[0].1, ServiceState::Failed(reason) if reason.contains("start exploded")));
        assert!(matches!(&states[1].1, ServiceState::Failed(reason) if reason.contains("no watcher")));
        assert_eq!(states[2].1, ServiceState::Running);

        manager.stop_all().await;
        let states = manager.states();
        assert!(states[0].1.is_failed());
        assert_eq!(states[2].1, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn worker_panic_fails_its_service_immediately() {
        let healthy = Arc::new(LoopService::new("healthy"));
        let mut manager = ServiceManager::new();
        manager.add_service(Arc::new(FaultyWorkerService {
            workers: Workers::new("faulty"),
        }));
        manager.add_service(healthy.clone());

        manager.start_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let states = manager.states();
        assert!(matches!(&states[0].1, ServiceState::Failed(reason) if reason.contains("index corrupted")));
        assert_eq!(states[1].1, ServiceState::Running);
        assert!(healthy.ticks.load(Ordering::Relaxed) > 0);

        manager.stop_all().await;
        let states = manager.states();
        assert!(states[0].1.is_failed());
        assert_eq!(states[1].1, ServiceState::Stopped);
    }
}

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use proactive_skeleton::{CancellationToken, Service, ServiceError, ServiceTelemetry, Workers};
use serde::Serialize;
use serde_json::json;
use shared_event_bus::{EventType, FileEventPayload, MessageBus, Payload};
use shared_logging::LogLevel;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{
    filter::{expand_home, ExtensionFilter},
    source::{ChangeSource, RawChange, RawOperation},
};

const SERVICE_NAME: &str = "perception";

/// Settings for [`PerceptionService`].
#[derive(Debug, Clone)]
pub struct PerceptionConfig {
    /// When false the service starts and stops without doing anything.
    pub enabled: bool,
    /// Roots to watch; `~` is expanded.
    pub watch_paths: Vec<String>,
    /// Extension allow-list; empty admits every file.
    pub file_extensions: Vec<String>,
    /// Period of the auxiliary poll loop.
    pub poll_interval: Duration,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_paths: Vec::new(),
            file_extensions: Vec::new(),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerceptionStats {
    /// Raw changes received from the source.
    pub observed: u64,
    /// `file_event` messages published.
    pub published: u64,
    /// Changes discarded by the extension filter.
    pub filtered: u64,
}

#[derive(Default)]
struct Counters {
    observed: AtomicU64,
    published: AtomicU64,
    filtered: AtomicU64,
}

struct Core {
    bus: MessageBus,
    filter: ExtensionFilter,
    telemetry: ServiceTelemetry,
    counters: Counters,
}

impl Core {
    fn handle(&self, change: &RawChange) {
        self.counters.observed.fetch_add(1, Ordering::Relaxed);
        if !self.filter.allows(&change.path) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            trace!(path = %change.path.display(), "change filtered by extension");
            return;
        }

        let event_type = map_operation(change.operation);
        let file_path = change.path.to_string_lossy().into_owned();
        info!(%event_type, %file_path, "file event");
        let _ = self.telemetry.log(
            LogLevel::Info,
            "perception.file_event",
            json!({ "event_type": event_type.label(), "file_path": file_path }),
        );
        self.bus.publish_payload(
            SERVICE_NAME,
            Payload::FileEvent(FileEventPayload {
                event_type,
                file_path,
            }),
        );
        self.counters.published.fetch_add(1, Ordering::Relaxed);
    }
}

/// Maps a raw operation onto the wire event type.
#[must_use]
pub const fn map_operation(operation: RawOperation) -> EventType {
    match operation {
        RawOperation::Create => EventType::Create,
        RawOperation::Write => EventType::Write,
        RawOperation::Remove => EventType::Remove,
        RawOperation::Rename => EventType::Rename,
        RawOperation::Chmod => EventType::Chmod,
        RawOperation::Other => EventType::Unknown,
    }
}

/// Watches the configured roots and publishes one `file_event` per admitted
/// change.
pub struct PerceptionService {
    config: PerceptionConfig,
    source: Mutex<Box<dyn ChangeSource>>,
    core: Arc<Core>,
    workers: Workers,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for PerceptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerceptionService")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PerceptionService {
    /// Creates the service over `source`.
    #[must_use]
    pub fn new(config: PerceptionConfig, bus: MessageBus, source: Box<dyn ChangeSource>) -> Self {
        let filter = ExtensionFilter::new(&config.file_extensions);
        Self {
            config,
            source: Mutex::new(source),
            core: Arc::new(Core {
                bus,
                filter,
                telemetry: ServiceTelemetry::disabled(SERVICE_NAME),
                counters: Counters::default(),
            }),
            workers: Workers::new(SERVICE_NAME),
            shutdown: Mutex::new(None),
        }
    }

    /// Attaches a telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: &ServiceTelemetry) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.telemetry = telemetry.for_component(SERVICE_NAME);
        }
        self
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> PerceptionStats {
        let counters = &self.core.counters;
        PerceptionStats {
            observed: counters.observed.load(Ordering::Relaxed),
            published: counters.published.load(Ordering::Relaxed),
            filtered: counters.filtered.load(Ordering::Relaxed),
        }
    }

    fn register_roots(&self, source: &mut dyn ChangeSource) -> usize {
        let mut registered = 0;
        for raw in &self.config.watch_paths {
            let Some(root) = expand_home(raw) else {
                warn!(path = %raw, "cannot expand home directory, skipping root");
                continue;
            };
            match source.add_root(&root) {
                Ok(()) => {
                    registered += 1;
                    info!(root = %root.display(), "watching root");
                }
                Err(err) => warn!(root = %root.display(), %err, "failed to watch root"),
            }
        }
        registered
    }
}

#[async_trait]
impl Service for PerceptionService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self, token: CancellationToken) -> Result<(), ServiceError> {
        if !self.config.enabled {
            info!("perception disabled");
            return Ok(());
        }

        let events = {
            let mut source = self.source.lock();
            let events = source
                .take_events()
                .ok_or_else(|| ServiceError::AlreadyRunning(SERVICE_NAME.into()))?;
            let roots = self.register_roots(source.as_mut());
            if roots == 0 {
                warn!("no watch roots registered");
            }
            events
        };

        let token = token.child_token();
        *self.shutdown.lock() = Some(token.clone());

        self.workers.spawn(
            "consume",
            consume(events, Arc::clone(&self.core), token.clone()),
        );
        self.workers
            .spawn("poll", poll(self.config.poll_interval, token));
        let _ = self.core.telemetry.log(
            LogLevel::Info,
            "perception.started",
            json!({
                "watch_paths": self.config.watch_paths,
                "file_extensions": self.core.filter.extensions(),
            }),
        );
        Ok(())
    }

    fn workers(&self) -> Option<&Workers> {
        Some(&self.workers)
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        self.source.lock().close();
        self.workers.join().await?;
        let stats = self.stats();
        info!(?stats, "perception stopped");
        Ok(())
    }
}

async fn consume(
    mut events: mpsc::Receiver<RawChange>,
    core: Arc<Core>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = events.recv() => match next {
                Some(change) => core.handle(&change),
                None => break,
            },
        }
    }
    debug!("perception consume loop exited");
}

async fn poll(period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => trace!("perception poll tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use shared_event_bus::kinds;

    use super::*;
    use crate::PerceptionError;

    struct ChannelSource {
        roots: Arc<Mutex<Vec<PathBuf>>>,
        events: Option<mpsc::Receiver<RawChange>>,
        closed: Arc<Mutex<bool>>,
    }

    impl ChangeSource for ChannelSource {
        fn add_root(&mut self, root: &Path) -> Result<(), PerceptionError> {
            if root.starts_with("/missing") {
                return Err(PerceptionError::MissingRoot(root.to_path_buf()));
            }
            self.roots.lock().push(root.to_path_buf());
            Ok(())
        }

        fn take_events(&mut self) -> Option<mpsc::Receiver<RawChange>> {
            self.events.take()
        }

        fn close(&mut self) {
            *self.closed.lock() = true;
        }
    }

    struct Harness {
        bus: MessageBus,
        service: PerceptionService,
        feed: mpsc::Sender<RawChange>,
        roots: Arc<Mutex<Vec<PathBuf>>>,
        closed: Arc<Mutex<bool>>,
    }

    fn harness(watch_paths: &[&str], extensions: &[&str]) -> Harness {
        let (feed, rx) = mpsc::channel(16);
        let roots = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let source = ChannelSource {
            roots: Arc::clone(&roots),
            events: Some(rx),
            closed: Arc::clone(&closed),
        };
        let bus = MessageBus::new(16);
        bus.start().unwrap();
        let config = PerceptionConfig {
            enabled: true,
            watch_paths: watch_paths.iter().map(ToString::to_string).collect(),
            file_extensions: extensions.iter().map(ToString::to_string).collect(),
            poll_interval: Duration::from_millis(20),
        };
        let service = PerceptionService::new(config, bus.clone(), Box::new(source));
        Harness {
            bus,
            service,
            feed,
            roots,
            closed,
        }
    }

    #[tokio::test]
    async fn extension_filter_drops_unlisted_files() {
        let h = harness(&["/data"], &[".txt"]);
        let mut files = h.bus.subscribe(kinds::FILE_EVENT);
        h.service.start(CancellationToken::new()).await.unwrap();

        h.feed
            .send(RawChange::new("/data/notes.md", RawOperation::Write))
            .await
            .unwrap();
        h.feed
            .send(RawChange::new("/data/NOTES.TXT", RawOperation::Create))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), files.recv())
            .await
            .unwrap()
            .unwrap();
        let Payload::FileEvent(event) = &message.payload else {
            panic!("unexpected payload {:?}", message.payload);
        };
        assert_eq!(event.file_path, "/data/NOTES.TXT");
        assert_eq!(event.event_type, EventType::Create);
        assert_eq!(message.origin, "perception");

        h.service.stop().await.unwrap();
        assert!(files.try_recv().is_none());
        assert_eq!(
            h.service.stats(),
            PerceptionStats {
                observed: 2,
                published: 1,
                filtered: 1,
            }
        );
        h.bus.stop().await;
    }

    #[tokio::test]
    async fn unclassified_operations_become_unknown() {
        let h = harness(&["/data"], &[]);
        let mut files = h.bus.subscribe(kinds::FILE_EVENT);
        h.service.start(CancellationToken::new()).await.unwrap();
        h.feed
            .send(RawChange::new("/data/Makefile", RawOperation::Other))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), files.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            &message.payload,
            Payload::FileEvent(event) if event.event_type == EventType::Unknown
        ));
        h.service.stop().await.unwrap();
        h.bus.stop().await;
    }

    #[tokio::test]
    async fn unusable_roots_are_skipped() {
        let h = harness(&["/missing/root", "/data"], &[]);
        h.service.start(CancellationToken::new()).await.unwrap();
        assert_eq!(*h.roots.lock(), vec![PathBuf::from("/data")]);
        h.service.stop().await.unwrap();
        h.bus.stop().await;
    }

    #[tokio::test]
    async fn stop_discards_pending_changes() {
        let h = harness(&["/data"], &[]);
        h.service.start(CancellationToken::new()).await.unwrap();
        h.service.stop().await.unwrap();
        assert!(*h.closed.lock());
        assert!(h
            .feed
            .try_send(RawChange::new("/data/late.txt", RawOperation::Write))
            .is_err());
        assert_eq!(h.service.stats().published, 0);
        h.bus.stop().await;
    }

    #[tokio::test]
    async fn disabled_service_is_inert() {
        let mut h = harness(&["/data"], &[]);
        h.service.config.enabled = false;
        h.service.start(CancellationToken::new()).await.unwrap();
        assert!(h.roots.lock().is_empty());
        h.service.stop().await.unwrap();
        h.bus.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = harness(&["/data"], &[]);
        h.service.start(CancellationToken::new()).await.unwrap();
        let err = h.service.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRunning(_)));
        h.service.stop().await.unwrap();
        h.bus.stop().await;
    }
}

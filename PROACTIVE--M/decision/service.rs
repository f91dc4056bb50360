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
use shared_event_bus::{
    kinds, DecisionKind, DecisionPayload, EventType, MessageBus, Payload, Subscription,
};
use shared_logging::LogLevel;
use tracing::{debug, info, warn};

use crate::{
    cache::CacheBackend,
    DecisionError,
    prompt::{build_prompt, cache_key, parse_decision},
    reasoning::{GenerationParams, ReasoningClient},
};

const SERVICE_NAME: &str = "decision";

/// Settings for [`DecisionService`].
///
/// Rate limiting and caching apply whenever a connected cache backend is
/// supplied to [`DecisionService::new`].
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// When false the service starts and stops without doing anything.
    pub enabled: bool,
    /// Settings forwarded to the reasoning client.
    pub generation: GenerationParams,
    /// Window of the global rate-limit marker.
    pub max_interval: Duration,
    /// Lifetime of cached decisions.
    pub cache_ttl: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            generation: GenerationParams::default(),
            max_interval: Duration::from_secs(5 * 60),
            cache_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Fresh answer from the reasoning service.
    Live,
    /// Cached answer used while not throttled.
    Cache,
    /// Cached answer reused while throttled.
    ThrottledCache,
    /// `monitor` because throttled with nothing cached.
    ThrottledDefault,
    /// `monitor` because the live call was skipped, failed or unparseable.
    Fallback,
}

impl ResolutionSource {
    /// Label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Cache => "cache",
            Self::ThrottledCache => "throttled_cache",
            Self::ThrottledDefault => "throttled_default",
            Self::Fallback => "fallback",
        }
    }
}

/// Outcome of resolving one file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Chosen decision.
    pub decision: DecisionKind,
    /// How it was obtained.
    pub source: ResolutionSource,
}

impl Resolution {
    const fn new(decision: DecisionKind, source: ResolutionSource) -> Self {
        Self { decision, source }
    }

    const fn fallback() -> Self {
        Self::new(DecisionKind::Monitor, ResolutionSource::Fallback)
    }
}

/// Resolutions per source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionStats {
    /// Live answers.
    pub live: u64,
    /// Cache hits outside throttling.
    pub cache: u64,
    /// Cache hits while throttled.
    pub throttled_cache: u64,
    /// Throttled defaults.
    pub throttled_default: u64,
    /// Fallbacks to `monitor`.
    pub fallback: u64,
}

#[derive(Default)]
struct Counters {
    live: AtomicU64,
    cache: AtomicU64,
    throttled_cache: AtomicU64,
    throttled_default: AtomicU64,
    fallback: AtomicU64,
}

impl Counters {
    fn record(&self, source: ResolutionSource) {
        let counter = match source {
            ResolutionSource::Live => &self.live,
            ResolutionSource::Cache => &self.cache,
            ResolutionSource::ThrottledCache => &self.throttled_cache,
            ResolutionSource::ThrottledDefault => &self.throttled_default,
            ResolutionSource::Fallback => &self.fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DecisionStats {
        DecisionStats {
            live: self.live.load(Ordering::Relaxed),
            cache: self.cache.load(Ordering::Relaxed),
            throttled_cache: self.throttled_cache.load(Ordering::Relaxed),
            throttled_default: self.throttled_default.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
        }
    }
}

struct Resolver {
    config: DecisionConfig,
    client: Arc<dyn ReasoningClient>,
    cache: Option<Arc<dyn CacheBackend>>,
    telemetry: ServiceTelemetry,
    counters: Counters,
}

impl Resolver {
    async fn resolve(&self, event_type: EventType, file_path: &str) -> Resolution {
        let key = cache_key(event_type, file_path);
        let mut backend = self
            .cache
            .as_deref()
            .filter(|backend| backend.is_connected());
        if backend.is_none() && self.cache.is_some() {
            debug!("cache backend disconnected, resolving without it");
        }

        if let Some(cache) = backend {
            match cache
                .check_and_advise_rate_limit(self.config.max_interval)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    let resolution = Self::throttled(cache, &key).await;
                    self.remember(cache, &key, resolution.decision).await;
                    return resolution;
                }
                Err(err) => {
                    warn!(%err, "rate limit check failed, failing open");
                    backend = None;
                }
            }
        }

        if let Some(cache) = backend {
            match cache.get(&key).await {
                Ok(Some(raw)) => match raw.parse::<DecisionKind>() {
                    Ok(decision) => return Resolution::new(decision, ResolutionSource::Cache),
                    Err(err) => warn!(%key, %err, "ignoring corrupt cached decision"),
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(%key, %err, "cache read failed, failing open");
                    backend = None;
                }
            }
        }

        let Some(resolution) = self.ask(event_type, file_path).await else {
            return Resolution::fallback();
        };
        if let Some(cache) = backend {
            self.remember(cache, &key, resolution.decision).await;
        }
        resolution
    }

    async fn throttled(cache: &dyn CacheBackend, key: &str) -> Resolution {
        match cache.get(key).await {
            Ok(Some(raw)) => {
                if let Ok(decision) = raw.parse::<DecisionKind>() {
                    return Resolution::new(decision, ResolutionSource::ThrottledCache);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(%key, %err, "cache read failed while throttled"),
        }
        Resolution::new(DecisionKind::Monitor, ResolutionSource::ThrottledDefault)
    }

    async fn remember(&self, cache: &dyn CacheBackend, key: &str, decision: DecisionKind) {
        if let Err(err) = cache
            .set(key, decision.label(), self.config.cache_ttl)
            .await
        {
            warn!(%key, %err, "failed to cache decision");
        }
    }

    /// Calls the reasoning service. `None` means no call was attempted.
    async fn ask(&self, event_type: EventType, file_path: &str) -> Option<Resolution> {
        if !self.client.is_available() && !self.client.refresh_availability().await {
            debug!("reasoning client unavailable, skipping live call");
            return None;
        }
        let prompt = build_prompt(event_type, file_path);
        let params = &self.config.generation;
        let reply = tokio::time::timeout(params.timeout, self.client.generate(&prompt, params))
            .await
            .unwrap_or_else(|_| Err(DecisionError::Timeout(params.timeout)));
        let resolution = match reply {
            Ok(reply) => match parse_decision(&reply) {
                Some(decision) => Resolution::new(decision, ResolutionSource::Live),
                None => {
                    warn!(reply = %reply.trim(), "unparseable reasoning reply");
                    Resolution::fallback()
                }
            },
            Err(err) => {
                warn!(%err, "reasoning call failed");
                Resolution::fallback()
            }
        };
        Some(resolution)
    }

    async fn handle(&self, bus: &MessageBus, payload: &Payload) {
        let Payload::FileEvent(event) = payload else {
            warn!(kind = payload.kind(), "decision ignoring unexpected payload");
            return;
        };
        let resolution = self.resolve(event.event_type, &event.file_path).await;
        self.counters.record(resolution.source);
        info!(
            event_type = %event.event_type,
            file_path = %event.file_path,
            decision = %resolution.decision,
            source = resolution.source.label(),
            "decision made"
        );
        let _ = self.telemetry.log(
            LogLevel::Info,
            "decision.resolved",
            json!({
                "event_type": event.event_type.label(),
                "file_path": event.file_path,
                "decision": resolution.decision.label(),
                "source": resolution.source,
            }),
        );
        bus.publish_payload(
            SERVICE_NAME,
            Payload::Decision(DecisionPayload {
                event_type: event.event_type,
                file_path: event.file_path.clone(),
                decision: resolution.decision,
            }),
        );
    }
}

/// Consumes `file_event` messages and publishes one `decision` per event.
pub struct DecisionService {
    bus: MessageBus,
    resolver: Arc<Resolver>,
    workers: Workers,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for DecisionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionService")
            .field("config", &self.resolver.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DecisionService {
    /// Creates the service. Without a cache backend, rate limiting and caching
    /// are skipped.
    #[must_use]
    pub fn new(
        config: DecisionConfig,
        bus: MessageBus,
        client: Arc<dyn ReasoningClient>,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Self {
        Self {
            bus,
            resolver: Arc::new(Resolver {
                config,
                client,
                cache,
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
        if let Some(resolver) = Arc::get_mut(&mut self.resolver) {
            resolver.telemetry = telemetry.for_component(SERVICE_NAME);
        }
        self
    }

    /// Resolves a decision for one event without publishing it.
    pub async fn resolve(&self, event_type: EventType, file_path: &str) -> Resolution {
        self.resolver.resolve(event_type, file_path).await
    }

    /// Resolutions recorded so far.
    #[must_use]
    pub fn stats(&self) -> DecisionStats {
        self.resolver.counters.snapshot()
    }
}

#[async_trait]
impl Service for DecisionService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self, token: CancellationToken) -> Result<(), ServiceError> {
        if !self.resolver.config.enabled {
            info!("decision disabled");
            return Ok(());
        }
        let token = token.child_token();
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_some() {
                return Err(ServiceError::AlreadyRunning(SERVICE_NAME.into()));
            }
            *shutdown = Some(token.clone());
        }

        let subscription = self.bus.subscribe(kinds::FILE_EVENT);
        self.workers.spawn(
            "consume",
            consume(
                subscription,
                self.bus.clone(),
                Arc::clone(&self.resolver),
                token,
            ),
        );
        info!(
            model = %self.resolver.config.generation.model,
            cached = self.resolver.cache.is_some(),
            "decision started"
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
        self.workers.join().await?;
        info!(stats = ?self.stats(), "decision stopped");
        Ok(())
    }
}

async fn consume(
    mut subscription: Subscription,
    bus: MessageBus,
    resolver: Arc<Resolver>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = subscription.recv() => match next {
                Some(message) => resolver.handle(&bus, &message.payload).await,
                None => break,
            },
        }
    }
    bus.unsubscribe(kinds::FILE_EVENT, subscription.id());
    debug!("decision consume loop exited");
}

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use proactive_decision::{
    CacheBackend, DecisionService, DecisionStats, HttpReasoningClient, MemoryCacheBackend,
    OfflineReasoningClient, ReasoningClient,
};
use proactive_execution::{
    CommandRunner, ExecutionService, ExecutionStats, ProcessCommandRunner,
};
use proactive_perception::{
    ChangeSource, NotifyChangeSource, PerceptionService, PerceptionStats,
};
use proactive_skeleton::{
    CancellationToken, ServiceManager, ServiceState, ServiceTelemetry,
};
use serde::Serialize;
use shared_event_bus::{BusMetrics, MessageBus, MessageJournal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AgentConfig;

/// Snapshot of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeReport {
    /// Lifecycle state per service.
    pub services: Vec<(String, ServiceState)>,
    /// Bus counters and queue depths.
    pub bus: BusMetrics,
    /// Perception counters.
    pub perception: PerceptionStats,
    /// Decision resolutions per source.
    pub decision: DecisionStats,
    /// Execution counters.
    pub execution: ExecutionStats,
}

/// Collaborators injected into the runtime.
pub struct Components {
    /// Raw filesystem changes.
    pub source: Box<dyn ChangeSource>,
    /// Reasoning service.
    pub client: Arc<dyn ReasoningClient>,
    /// Cache and rate-limit backend; `None` disables both.
    pub cache: Option<Arc<dyn CacheBackend>>,
    /// Process runner.
    pub runner: Arc<dyn CommandRunner>,
}

/// Owns the bus, the journal and the service manager.
pub struct AgentRuntime {
    bus: MessageBus,
    manager: ServiceManager,
    perception: Arc<PerceptionService>,
    decision: Arc<DecisionService>,
    execution: Arc<ExecutionService>,
    journal: Option<MessageJournal>,
    journal_task: Option<JoinHandle<()>>,
    journal_token: CancellationToken,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("manager", &self.manager)
            .field("journal", &self.journal)
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Builds production collaborators from `config` and wires the pipeline.
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let source = NotifyChangeSource::new(config.bus.buffer_size)
            .context("creating filesystem watcher")?;

        let client: Arc<dyn ReasoningClient> = if config.llm.enabled {
            let http = HttpReasoningClient::new(
                config.llm.endpoint.clone(),
                config.llm.api_key.clone(),
                Duration::from_secs(config.llm.timeout_secs),
            )
            .context("building reasoning client")?
            .with_reprobe_interval(Duration::from_secs(config.llm.reprobe_interval_secs));
            if !http.probe().await {
                warn!(endpoint = %http.endpoint(), "reasoning service offline, decisions default to monitor");
            }
            Arc::new(http)
        } else {
            info!("llm disabled, decisions default to monitor");
            Arc::new(OfflineReasoningClient)
        };

        let cache: Option<Arc<dyn CacheBackend>> = if config.cache.enabled {
            info!(
                max_interval_minutes = config.max_interval_minutes(),
                expiry_minutes = config.cache.expiry_minutes,
                "decision cache and rate limiter enabled"
            );
            Some(Arc::new(MemoryCacheBackend::new()))
        } else {
            None
        };

        Self::with_components(
            config,
            Components {
                source: Box::new(source),
                client,
                cache,
                runner: Arc::new(ProcessCommandRunner),
            },
        )
    }

    /// Wires the pipeline over the given collaborators.
    pub fn with_components(config: &AgentConfig, components: Components) -> Result<Self> {
        let telemetry = match &config.logging.file {
            Some(path) => ServiceTelemetry::builder("agent")
                .log_path(path)
                .build()
                .with_context(|| format!("opening pipeline log {}", path.display()))?,
            None => ServiceTelemetry::disabled("agent"),
        };
        let journal = config
            .bus
            .journal_path
            .as_ref()
            .map(MessageJournal::new)
            .transpose()
            .context("preparing message journal")?;

        let bus = MessageBus::new(config.bus.buffer_size);
        let perception = Arc::new(
            PerceptionService::new(config.perception_config(), bus.clone(), components.source)
                .with_telemetry(&telemetry),
        );
        let decision = Arc::new(
            DecisionService::new(
                config.decision_config(),
                bus.clone(),
                components.client,
                components.cache,
            )
            .with_telemetry(&telemetry),
        );
        let execution = Arc::new(
            ExecutionService::new(config.execution_config(), bus.clone(), components.runner)
                .with_telemetry(&telemetry),
        );

        let mut manager = ServiceManager::new();
        manager.add_service(execution.clone());
        manager.add_service(decision.clone());
        manager.add_service(perception.clone());

        Ok(Self {
            bus,
            manager,
            perception,
            decision,
            execution,
            journal,
            journal_task: None,
            journal_token: CancellationToken::new(),
        })
    }

    /// Shared bus handle.
    #[must_use]
    pub const fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Starts the journal, the bus and every service.
    pub fn start(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.take() {
            info!(path = %journal.path().display(), "journaling messages");
            self.journal_task = Some(journal.spawn(&self.bus, self.journal_token.clone()));
        }
        self.bus.start().context("starting message bus")?;
        self.manager.start_all();
        info!("agent running");
        Ok(())
    }

    /// Current pipeline snapshot.
    #[must_use]
    pub fn report(&self) -> RuntimeReport {
        RuntimeReport {
            services: self.manager.states(),
            bus: self.bus.metrics(),
            perception: self.perception.stats(),
            decision: self.decision.stats(),
            execution: self.execution.stats(),
        }
    }

    /// Stops services, then the bus, then the journal, and returns the final
    /// snapshot.
    pub async fn shutdown(mut self) -> RuntimeReport {
        self.manager.stop_all().await;
        self.bus.stop().await;
        self.journal_token.cancel();
        if let Some(task) = self.journal_task.take() {
            if let Err(err) = task.await {
                warn!(%err, "journal task failed");
            }
        }
        let report = self.report();
        info!(
            published = report.bus.published,
            dropped = report.bus.dropped_inbound + report.bus.dropped_subscriber,
            "agent stopped"
        );
        report
    }
}

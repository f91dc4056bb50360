use std::{
    path::PathBuf,
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
    kinds, DecisionKind, DecisionPayload, ExecutionResultPayload, MessageBus, Payload,
    Subscription,
};
use shared_logging::LogLevel;
use tracing::{debug, info, warn};

use crate::{
    command::{derive_command, CommandPolicy},
    runner::{CommandRunner, Invocation},
};

const SERVICE_NAME: &str = "execution";

/// Settings for [`ExecutionService`].
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// When false the service starts and stops without doing anything.
    pub enabled: bool,
    /// Program names that may run.
    pub allowed_commands: Vec<String>,
    /// Per-command deadline.
    pub timeout: Duration,
    /// Working directory for every command.
    pub working_directory: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_commands: vec!["cat".into(), "ls".into()],
            timeout: Duration::from_secs(30),
            working_directory: None,
        }
    }
}

/// Execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Commands that ran and exited successfully.
    pub executed: u64,
    /// Commands that failed, timed out or exited non-zero.
    pub failed: u64,
    /// Commands refused by the allow-list.
    pub denied: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    failed: AtomicU64,
    denied: AtomicU64,
}

struct Executor {
    config: ExecutionConfig,
    policy: CommandPolicy,
    runner: Arc<dyn CommandRunner>,
    telemetry: ServiceTelemetry,
    counters: Counters,
}

impl Executor {
    async fn handle(&self, bus: &MessageBus, payload: &Payload) {
        let Payload::Decision(decision) = payload else {
            warn!(kind = payload.kind(), "execution ignoring unexpected payload");
            return;
        };
        if decision.decision != DecisionKind::Execute {
            debug!(decision = %decision.decision, file_path = %decision.file_path, "nothing to execute");
            return;
        }
        if let Some(result) = self.execute(decision).await {
            bus.publish_payload(SERVICE_NAME, Payload::ExecutionResult(result));
        }
    }

    async fn execute(&self, decision: &DecisionPayload) -> Option<ExecutionResultPayload> {
        let (program, args) = derive_command(&decision.file_path);
        if !self.policy.permits(&program) {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            warn!(command = %program, file_path = %decision.file_path, "command not allowed");
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "execution.denied",
                json!({ "command": program, "file_path": decision.file_path }),
            );
            return None;
        }

        let invocation = Invocation {
            program,
            args,
            timeout: self.config.timeout,
            working_directory: self.config.working_directory.clone(),
        };
        let (result, error_msg) = match self.runner.run(&invocation).await {
            Ok(outcome) if outcome.success => (outcome.output, None),
            Ok(outcome) => {
                let detail = outcome.exit_code.map_or_else(
                    || "terminated by signal".to_string(),
                    |code| format!("exit status {code}"),
                );
                (outcome.output, Some(detail))
            }
            Err(err) => (String::new(), Some(err.to_string())),
        };

        let error = error_msg.is_some();
        if error {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(command = %invocation.program, error = ?error_msg, "command failed");
        } else {
            self.counters.executed.fetch_add(1, Ordering::Relaxed);
            info!(command = %invocation.program, file_path = %decision.file_path, "command executed");
        }
        let _ = self.telemetry.log(
            if error { LogLevel::Warn } else { LogLevel::Info },
            "execution.completed",
            json!({
                "command": invocation.program,
                "args": invocation.args,
                "error": error,
                "output_bytes": result.len(),
            }),
        );

        Some(ExecutionResultPayload {
            file_path: decision.file_path.clone(),
            command: invocation.program,
            args: invocation.args,
            result,
            error,
            error_msg,
        })
    }
}

/// Runs the derived command for each `execute` decision.
pub struct ExecutionService {
    bus: MessageBus,
    executor: Arc<Executor>,
    workers: Workers,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("config", &self.executor.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ExecutionService {
    /// Creates the service.
    #[must_use]
    pub fn new(config: ExecutionConfig, bus: MessageBus, runner: Arc<dyn CommandRunner>) -> Self {
        let policy = CommandPolicy::new(config.allowed_commands.iter().cloned());
        Self {
            bus,
            executor: Arc::new(Executor {
                config,
                policy,
                runner,
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
        if let Some(executor) = Arc::get_mut(&mut self.executor) {
            executor.telemetry = telemetry.for_component(SERVICE_NAME);
        }
        self
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ExecutionStats {
        let counters = &self.executor.counters;
        ExecutionStats {
            executed: counters.executed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            denied: counters.denied.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Service for ExecutionService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self, token: CancellationToken) -> Result<(), ServiceError> {
        if !self.executor.config.enabled {
            info!("execution disabled");
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

        let subscription = self.bus.subscribe(kinds::DECISION);
        self.workers.spawn(
            "consume",
            consume(
                subscription,
                self.bus.clone(),
                Arc::clone(&self.executor),
                token,
            ),
        );
        info!(allowed = ?self.executor.policy.allowed(), "execution started");
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
        info!(stats = ?self.stats(), "execution stopped");
        Ok(())
    }
}

async fn consume(
    mut subscription: Subscription,
    bus: MessageBus,
    executor: Arc<Executor>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = subscription.recv() => match next {
                Some(message) => executor.handle(&bus, &message.payload).await,
                None => break,
            },
        }
    }
    bus.unsubscribe(kinds::DECISION, subscription.id());
    debug!("execution consume loop exited");
}

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use proactive_decision::{DecisionConfig, GenerationParams};
use proactive_execution::ExecutionConfig;
use proactive_perception::PerceptionConfig;
use serde::{Deserialize, Serialize};

/// Environment variable consulted when `llm.api_key` is not set.
pub const API_KEY_ENV: &str = "PROACTIVE_LLM_API_KEY";

/// Rate-limit window used when `[decision_control]` is disabled.
pub const DEFAULT_MAX_INTERVAL_MINUTES: u64 = 5;

/// Upper bound for minute-valued settings (one week).
pub const MAX_MINUTES: u64 = 7 * 24 * 60;

/// Upper bound for second-valued settings (one day).
pub const MAX_SECS: u64 = 24 * 60 * 60;

/// Full agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Message bus settings.
    pub bus: BusSection,
    /// Filesystem perception.
    pub perception: PerceptionSection,
    /// Decision generation.
    pub decision: DecisionSection,
    /// Rate-limit window override.
    pub decision_control: DecisionControlSection,
    /// Decision cache and rate-limit backend.
    pub cache: CacheSection,
    /// Reasoning service endpoint.
    pub llm: LlmSection,
    /// Command execution.
    pub execution: ExecutionSection,
    /// Logging.
    pub logging: LoggingSection,
}

/// `[bus]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    /// Bound shared by the inbound buffer and every subscriber queue.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Optional JSONL journal of every routed message.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            journal_path: None,
        }
    }
}

/// `[perception]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionSection {
    /// Whether the watcher runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Watch roots; `~` expands to the home directory.
    #[serde(default = "default_watch_paths")]
    pub watch_paths: Vec<String>,
    /// Extension allow-list; empty admits every file.
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
    /// Poll loop period in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for PerceptionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_paths: default_watch_paths(),
            file_extensions: default_file_extensions(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// `[decision]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSection {
    /// Whether file events are resolved.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Model identifier forwarded to the reasoning service.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion length cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DecisionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// `[decision_control]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionControlSection {
    /// Whether `max_interval_minutes` replaces the five-minute default. The
    /// limiter itself runs whenever the cache backend does.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum spacing between live calls, in minutes.
    #[serde(default = "default_max_interval_minutes")]
    pub max_interval_minutes: u64,
}

impl Default for DecisionControlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_interval_minutes: default_max_interval_minutes(),
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// Whether the cache and rate-limit backend is used at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lifetime of cached decisions, in minutes.
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_minutes: default_expiry_minutes(),
        }
    }
}

/// `[llm]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    /// Whether a reasoning service is used at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Generation endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Sent as `x-api-key`. Falls back to `PROACTIVE_LLM_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Connect timeout in seconds.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds between probes while the service is unreachable.
    #[serde(default = "default_reprobe_interval_secs")]
    pub reprobe_interval_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_endpoint(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            reprobe_interval_secs: default_reprobe_interval_secs(),
        }
    }
}

/// `[execution]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Whether execute decisions run commands.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Program names that may run.
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    /// Per-command deadline in seconds.
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
    /// Working directory for commands.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_commands: default_allowed_commands(),
            max_execution_time_secs: default_max_execution_time_secs(),
            working_directory: None,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Console filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    /// JSONL file for pipeline milestones.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
        }
    }
}

impl AgentConfig {
    /// Loads and validates a TOML file. Relative paths are resolved against
    /// the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml_str(&raw, &base).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates TOML text, resolving relative paths against `base`.
    pub fn from_toml_str(raw: &str, base: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        config.resolve_paths(base);
        config.llm.api_key = config
            .llm
            .api_key
            .take()
            .filter(|key| !key.is_empty())
            .or_else(|| env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty()));
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bus.buffer_size == 0 {
            bail!("bus.buffer_size must be positive");
        }
        if !(0.0..=2.0).contains(&self.decision.temperature) {
            bail!(
                "decision.temperature {} outside 0.0..=2.0",
                self.decision.temperature
            );
        }
        if self.decision_control.enabled && self.decision_control.max_interval_minutes == 0 {
            bail!("decision_control.max_interval_minutes must be positive");
        }
        if self.cache.enabled && self.cache.expiry_minutes == 0 {
            bail!("cache.expiry_minutes must be positive");
        }
        if self.llm.enabled && self.llm.endpoint.trim().is_empty() {
            bail!("llm.endpoint is required when llm is enabled");
        }
        for (name, minutes) in [
            (
                "decision_control.max_interval_minutes",
                self.decision_control.max_interval_minutes,
            ),
            ("cache.expiry_minutes", self.cache.expiry_minutes),
        ] {
            if minutes > MAX_MINUTES {
                bail!("{name} {minutes} exceeds {MAX_MINUTES}");
            }
        }
        for (name, secs) in [
            ("perception.poll_interval_secs", self.perception.poll_interval_secs),
            ("decision.timeout_secs", self.decision.timeout_secs),
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("llm.reprobe_interval_secs", self.llm.reprobe_interval_secs),
            (
                "execution.max_execution_time_secs",
                self.execution.max_execution_time_secs,
            ),
        ] {
            if secs == 0 {
                bail!("{name} must be positive");
            }
            if secs > MAX_SECS {
                bail!("{name} {secs} exceeds {MAX_SECS}");
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.bus.journal_path,
            &mut self.logging.file,
            &mut self.execution.working_directory,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Copy safe to print: the API key is masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some("***".into());
        }
        copy
    }

    /// Settings for the perception service.
    #[must_use]
    pub fn perception_config(&self) -> PerceptionConfig {
        PerceptionConfig {
            enabled: self.perception.enabled,
            watch_paths: self.perception.watch_paths.clone(),
            file_extensions: self.perception.file_extensions.clone(),
            poll_interval: Duration::from_secs(self.perception.poll_interval_secs),
        }
    }

    /// Rate-limit window in effect: the configured one when
    /// `[decision_control]` is enabled, five minutes otherwise.
    #[must_use]
    pub const fn max_interval_minutes(&self) -> u64 {
        if self.decision_control.enabled {
            self.decision_control.max_interval_minutes
        } else {
            DEFAULT_MAX_INTERVAL_MINUTES
        }
    }

    /// Settings for the decision service.
    #[must_use]
    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            enabled: self.decision.enabled,
            generation: GenerationParams {
                model: self.decision.model.clone(),
                temperature: self.decision.temperature,
                max_tokens: self.decision.max_tokens,
                timeout: Duration::from_secs(self.decision.timeout_secs),
            },
            max_interval: minutes(self.max_interval_minutes()),
            cache_ttl: minutes(self.cache.expiry_minutes),
        }
    }

    /// Settings for the execution service.
    #[must_use]
    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            enabled: self.execution.enabled,
            allowed_commands: self.execution.allowed_commands.clone(),
            timeout: Duration::from_secs(self.execution.max_execution_time_secs),
            working_directory: self.execution.working_directory.clone(),
        }
    }
}

const fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

const fn default_true() -> bool {
    true
}

const fn default_buffer_size() -> usize {
    100
}

fn default_watch_paths() -> Vec<String> {
    vec!["~/Documents".into()]
}

fn default_file_extensions() -> Vec<String> {
    vec![".txt".into(), ".md".into()]
}

const fn default_poll_interval_secs() -> u64 {
    60
}

fn default_model() -> String {
    "gpt-3.5-turbo".into()
}

const fn default_temperature() -> f32 {
    0.3
}

const fn default_max_tokens() -> u32 {
    16
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_interval_minutes() -> u64 {
    DEFAULT_MAX_INTERVAL_MINUTES
}

const fn default_expiry_minutes() -> u64 {
    10
}

fn default_endpoint() -> String {
    "http://127.0.0.1:9000/generate".into()
}

const fn default_llm_timeout_secs() -> u64 {
    10
}

const fn default_reprobe_interval_secs() -> u64 {
    30
}

fn default_allowed_commands() -> Vec<String> {
    vec!["cat".into(), "ls".into()]
}

const fn default_max_execution_time_secs() -> u64 {
    30
}

fn default_level() -> String {
    "info".into()
}

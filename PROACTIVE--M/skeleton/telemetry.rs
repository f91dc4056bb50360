use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Builder for service telemetry sinks.
pub struct ServiceTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
}

impl ServiceTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            min_level: LogLevel::Debug,
        }
    }

    /// Sets the JSONL log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ServiceTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(JsonLogger::with_min_level(path, self.min_level)?)),
            None => None,
        };
        Ok(ServiceTelemetry {
            component: self.component,
            logger,
        })
    }
}

/// Structured milestone log shared by the pipeline services.
///
/// Handles derived with [`for_component`](Self::for_component) share one file.
#[derive(Clone)]
pub struct ServiceTelemetry {
    component: String,
    logger: Option<Arc<JsonLogger>>,
}

impl fmt::Debug for ServiceTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTelemetry")
            .field("component", &self.component)
            .field("enabled", &self.logger.is_some())
            .finish()
    }
}

impl ServiceTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> ServiceTelemetryBuilder {
        ServiceTelemetryBuilder::new(component)
    }

    /// Telemetry that records nothing.
    #[must_use]
    pub fn disabled(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            logger: None,
        }
    }

    /// Same sink, different component label.
    #[must_use]
    pub fn for_component(&self, component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            logger: self.logger.clone(),
        }
    }

    /// Component label written on every record.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.logger {
            let record = LogRecord::new(&self.component, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }
}

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::BusError;

/// Subscription kind that receives every message regardless of its kind.
pub const WILDCARD: &str = "*";

/// Well-known message kinds.
pub mod kinds {
    /// Filesystem change observed by perception.
    pub const FILE_EVENT: &str = "file_event";
    /// Resolved decision for a file event.
    pub const DECISION: &str = "decision";
    /// Outcome of an executed command.
    pub const EXECUTION_RESULT: &str = "execution_result";
    /// Manual perception trigger injected by an external caller.
    pub const PERCEPTION_TRIGGER: &str = "perception_trigger";
    /// Manual command request injected by an external caller.
    pub const COMMAND_EXECUTION: &str = "command_execution";
}

/// Kind of filesystem operation carried by a `file_event`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// File or directory created.
    Create,
    /// File contents written.
    Write,
    /// File removed.
    Remove,
    /// File renamed or moved.
    Rename,
    /// Permissions or metadata changed.
    Chmod,
    /// Operation the watcher could not classify.
    Unknown,
}

impl EventType {
    /// Returns the wire label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Write => "write",
            Self::Remove => "remove",
            Self::Rename => "rename",
            Self::Chmod => "chmod",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EventType {
    type Err = BusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "create" => Ok(Self::Create),
            "write" => Ok(Self::Write),
            "remove" => Ok(Self::Remove),
            "rename" => Ok(Self::Rename),
            "chmod" => Ok(Self::Chmod),
            "unknown" => Ok(Self::Unknown),
            other => Err(BusError::InvalidPayload {
                kind: kinds::FILE_EVENT.into(),
                reason: format!("unknown event type '{other}'"),
            }),
        }
    }
}

/// Policy outcome chosen for a file event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    /// Observe only. Also the safe default whenever resolution fails.
    #[default]
    Monitor,
    /// Inspect the file content.
    Analyze,
    /// Raise a notification.
    Notify,
    /// Run a whitelisted command against the file.
    Execute,
    /// Do nothing at all.
    Ignore,
}

impl DecisionKind {
    /// Every decision, in prompt order.
    pub const ALL: [Self; 5] = [
        Self::Monitor,
        Self::Analyze,
        Self::Notify,
        Self::Execute,
        Self::Ignore,
    ];

    /// Returns the wire label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Analyze => "analyze",
            Self::Notify => "notify",
            Self::Execute => "execute",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DecisionKind {
    type Err = BusError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.label() == raw)
            .ok_or_else(|| BusError::InvalidPayload {
                kind: kinds::DECISION.into(),
                reason: format!("unknown decision '{raw}'"),
            })
    }
}

/// Payload of a `file_event` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEventPayload {
    /// Observed operation.
    pub event_type: EventType,
    /// Absolute path of the affected file.
    pub file_path: String,
}

/// Payload of a `decision` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionPayload {
    /// Operation of the originating file event.
    pub event_type: EventType,
    /// Path of the originating file event.
    pub file_path: String,
    /// Resolved decision.
    pub decision: DecisionKind,
}

/// Payload of an `execution_result` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResultPayload {
    /// File the command was derived from.
    pub file_path: String,
    /// Executed program.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Captured stdout followed by stderr.
    pub result: String,
    /// Whether the run failed, timed out, or exited non-zero.
    pub error: bool,
    /// Failure detail when `error` is set.
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// Payload of a `perception_trigger` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerceptionTriggerPayload {
    /// Path the caller wants inspected.
    pub path: String,
}

/// Payload of a `command_execution` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandExecutionPayload {
    /// Requested program.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Closed set of payloads; the variant determines the message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `file_event`.
    FileEvent(FileEventPayload),
    /// `decision`.
    Decision(DecisionPayload),
    /// `execution_result`.
    ExecutionResult(ExecutionResultPayload),
    /// `perception_trigger`.
    PerceptionTrigger(PerceptionTriggerPayload),
    /// `command_execution`.
    CommandExecution(CommandExecutionPayload),
    /// Producer-defined kind with an opaque JSON body.
    Custom {
        /// Producer-defined kind.
        kind: String,
        /// Opaque body.
        data: Value,
    },
}

impl Payload {
    /// Kind used for routing.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::FileEvent(_) => kinds::FILE_EVENT,
            Self::Decision(_) => kinds::DECISION,
            Self::ExecutionResult(_) => kinds::EXECUTION_RESULT,
            Self::PerceptionTrigger(_) => kinds::PERCEPTION_TRIGGER,
            Self::CommandExecution(_) => kinds::COMMAND_EXECUTION,
            Self::Custom { kind, .. } => kind,
        }
    }

    /// Encodes the payload body as JSON.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Self::FileEvent(body) => serde_json::to_value(body),
            Self::Decision(body) => serde_json::to_value(body),
            Self::ExecutionResult(body) => serde_json::to_value(body),
            Self::PerceptionTrigger(body) => serde_json::to_value(body),
            Self::CommandExecution(body) => serde_json::to_value(body),
            Self::Custom { data, .. } => return data.clone(),
        };
        encoded.unwrap_or_default()
    }

    /// Decodes an untyped body, enforcing the contract of known kinds.
    ///
    /// Unknown kinds become [`Payload::Custom`]. The wildcard and the empty
    /// string are reserved and rejected.
    pub fn from_value(kind: &str, data: Value) -> Result<Self, BusError> {
        fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, BusError> {
            serde_json::from_value(data).map_err(|err| BusError::InvalidPayload {
                kind: kind.into(),
                reason: err.to_string(),
            })
        }

        match kind {
            "" | WILDCARD => Err(BusError::InvalidKind(kind.into())),
            kinds::FILE_EVENT => decode(kind, data).map(Self::FileEvent),
            kinds::DECISION => decode(kind, data).map(Self::Decision),
            kinds::EXECUTION_RESULT => decode(kind, data).map(Self::ExecutionResult),
            kinds::PERCEPTION_TRIGGER => decode(kind, data).map(Self::PerceptionTrigger),
            kinds::COMMAND_EXECUTION => decode(kind, data).map(Self::CommandExecution),
            other => Ok(Self::Custom {
                kind: other.into(),
                data,
            }),
        }
    }
}

/// Immutable unit of communication routed by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique identifier, diagnostic only.
    pub id: Uuid,
    /// Producing component, diagnostic only.
    pub origin: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Typed body.
    pub payload: Payload,
}

impl Message {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(origin: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Kind used for routing.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    /// Flattens the message into its JSON record form.
    #[must_use]
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            id: self.id.to_string(),
            origin: self.origin.clone(),
            kind: self.kind().to_string(),
            timestamp: self.timestamp,
            payload: self.payload.to_value(),
        }
    }

    /// Rebuilds a typed message from a JSON record.
    pub fn from_record(record: EventRecord) -> Result<Self, BusError> {
        let payload = Payload::from_value(&record.kind, record.payload)?;
        Ok(Self {
            id: Uuid::parse_str(&record.id).unwrap_or_else(|_| Uuid::new_v4()),
            origin: record.origin,
            timestamp: record.timestamp,
            payload,
        })
    }
}

/// Flat JSON form of a [`Message`], used by the journal and external callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier (uuid).
    pub id: String,
    /// Producing component.
    pub origin: String,
    /// Message kind.
    pub kind: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Payload body.
    #[serde(default)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_kind_requires_contract_fields() {
        let err = Payload::from_value(kinds::FILE_EVENT, json!({ "event_type": "create" }))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidPayload { .. }));

        let err = Payload::from_value(
            kinds::DECISION,
            json!({ "event_type": "create", "file_path": "/a", "decision": "launch" }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("decision"));
    }

    #[test]
    fn unknown_kind_becomes_custom_and_wildcard_is_reserved() {
        let payload = Payload::from_value("calendar_tick", json!({ "slot": 3 })).unwrap();
        assert_eq!(payload.kind(), "calendar_tick");
        assert_eq!(payload.to_value(), json!({ "slot": 3 }));
        assert!(matches!(
            Payload::from_value(WILDCARD, Value::Null),
            Err(BusError::InvalidKind(_))
        ));
    }

    #[test]
    fn record_keeps_kind_and_body() {
        let message = Message::new(
            "perception",
            Payload::FileEvent(FileEventPayload {
                event_type: EventType::Write,
                file_path: "/data/report.txt".into(),
            }),
        );
        let record = message.to_record();
        assert_eq!(record.kind, "file_event");
        assert_eq!(record.payload["event_type"], "write");

        let rebuilt = Message::from_record(record).unwrap();
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn parses_labels() {
        assert_eq!("chmod".parse::<EventType>().unwrap(), EventType::Chmod);
        assert!("touch".parse::<EventType>().is_err());
        assert_eq!("execute".parse::<DecisionKind>().unwrap(), DecisionKind::Execute);
        assert_eq!(DecisionKind::default(), DecisionKind::Monitor);
    }
}

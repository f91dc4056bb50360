use std::path::{Path, PathBuf};

use tokio::{fs::OpenOptions, io::AsyncWriteExt, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    bus::MessageBus,
    message::{Message, WILDCARD},
    BusError,
};

/// Appends every routed message to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct MessageJournal {
    path: PathBuf,
}

impl MessageJournal {
    /// Creates a journal writing to `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Journal file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a single message as one JSON line.
    pub async fn append(&self, message: &Message) -> Result<(), BusError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let data = serde_json::to_vec(&message.to_record())?;
        file.write_all(&data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Subscribes to every kind and journals until `token` is cancelled or the
    /// subscription is closed.
    #[must_use]
    pub fn spawn(self, bus: &MessageBus, token: CancellationToken) -> JoinHandle<()> {
        let mut subscription = bus.subscribe(WILDCARD);
        let bus = bus.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(message) => {
                            if let Err(err) = self.append(&message).await {
                                warn!(%err, path = %self.path.display(), "journal write failed");
                            }
                        }
                        None => break,
                    },
                }
            }
            bus.unsubscribe(WILDCARD, subscription.id());
            while let Some(message) = subscription.try_recv() {
                if let Err(err) = self.append(&message).await {
                    warn!(%err, "journal write failed during shutdown");
                }
            }
            debug!(path = %self.path.display(), "journal stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{kinds, DecisionKind, DecisionPayload, EventRecord, EventType, Payload};
    use tempfile::tempdir;

    #[tokio::test]
    async fn journals_every_kind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal/messages.jsonl");
        let bus = MessageBus::new(16);
        let token = CancellationToken::new();
        let handle = MessageJournal::new(&path)
            .unwrap()
            .spawn(&bus, token.clone());
        bus.start().unwrap();

        bus.publish_payload(
            "decision",
            Payload::Decision(DecisionPayload {
                event_type: EventType::Write,
                file_path: "/data/notes.txt".into(),
                decision: DecisionKind::Notify,
            }),
        );
        bus.publish_json("heartbeat", "test", serde_json::json!({ "n": 1 }))
            .unwrap();
        bus.stop().await;
        token.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<EventRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, kinds::DECISION);
        assert_eq!(records[0].payload["decision"], "notify");
        assert_eq!(records[1].kind, "heartbeat");
        assert_eq!(bus.subscriber_count(), 0);
    }
}

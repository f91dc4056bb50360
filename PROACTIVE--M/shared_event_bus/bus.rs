use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    message::{Message, Payload, WILDCARD},
    BusError,
};

/// Inbound buffer and per-subscriber queue size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Handle identifying one subscription within its kind.
pub type SubscriptionId = u64;

/// Receiving end of a bounded subscriber queue.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    kind: String,
    receiver: mpsc::Receiver<Arc<Message>>,
}

impl Subscription {
    /// Identifier to pass to [`MessageBus::unsubscribe`].
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Kind this subscription was registered under.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Waits for the next message; `None` once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.receiver.recv().await
    }

    /// Returns a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.receiver.try_recv().ok()
    }
}

/// Depth of a single subscriber queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    /// Kind the queue is registered under.
    pub kind: String,
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Messages waiting to be drained.
    pub depth: usize,
    /// Queue bound.
    pub capacity: usize,
}

/// Point-in-time counters for the bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    /// Messages accepted into the inbound buffer.
    pub published: u64,
    /// Successful enqueues into subscriber queues.
    pub delivered: u64,
    /// Messages dropped because the inbound buffer was full or closed.
    pub dropped_inbound: u64,
    /// Deliveries dropped because a subscriber queue was full or closed.
    pub dropped_subscriber: u64,
    /// Untyped payloads refused by [`MessageBus::publish_json`].
    pub rejected: u64,
    /// Messages waiting in the inbound buffer.
    pub inbound_depth: usize,
    /// Per-subscriber queue depths.
    pub queues: Vec<QueueDepth>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_inbound: AtomicU64,
    dropped_subscriber: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug)]
struct SubscriberSlot {
    id: SubscriptionId,
    sender: mpsc::Sender<Arc<Message>>,
}

struct BusInner {
    buffer_size: usize,
    inbound_tx: mpsc::Sender<Arc<Message>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    subscribers: RwLock<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
    counters: Counters,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn dispatch(&self, message: &Arc<Message>) {
        let subscribers = self.subscribers.read();
        let kind = message.kind();
        let exact = if kind == WILDCARD {
            None
        } else {
            subscribers.get(kind)
        };
        let targets = exact
            .into_iter()
            .chain(subscribers.get(WILDCARD))
            .flatten();

        for slot in targets {
            match slot.sender.try_send(Arc::clone(message)) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.counters
                        .dropped_subscriber
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        kind,
                        subscription = slot.id,
                        "subscriber queue full, message discarded"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.counters
                        .dropped_subscriber
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(kind, subscription = slot.id, "subscriber gone, message discarded");
                }
            }
        }
    }
}

/// Central in-process router. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("buffer_size", &self.inner.buffer_size)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl MessageBus {
    /// Creates a stopped bus whose inbound buffer and subscriber queues hold
    /// `buffer_size` messages each.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        Self {
            inner: Arc::new(BusInner {
                buffer_size,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Spawns the dispatch loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        let receiver = self
            .inner
            .inbound_rx
            .lock()
            .take()
            .ok_or(BusError::AlreadyStarted)?;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_dispatch(inner, receiver));
        *self.inner.dispatcher.lock() = Some(handle);
        info!(buffer_size = self.inner.buffer_size, "message bus started");
        Ok(())
    }

    /// Stops the dispatch loop after it has routed everything already buffered.
    ///
    /// Messages published after this call are dropped.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(%err, "dispatch loop terminated abnormally");
            }
            info!("message bus stopped");
        }
    }

    /// Whether [`stop`](Self::stop) has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Enqueues a message without waiting. Drops it when the inbound buffer is
    /// full or the bus has stopped.
    pub fn publish(&self, message: Message) {
        match self.inner.inbound_tx.try_send(Arc::new(message)) {
            Ok(()) => {
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(message)) => {
                self.inner
                    .counters
                    .dropped_inbound
                    .fetch_add(1, Ordering::Relaxed);
                warn!(kind = message.kind(), "message bus buffer full, message discarded");
            }
            Err(TrySendError::Closed(message)) => {
                self.inner
                    .counters
                    .dropped_inbound
                    .fetch_add(1, Ordering::Relaxed);
                debug!(kind = message.kind(), "message bus stopped, message discarded");
            }
        }
    }

    /// Wraps `payload` in a fresh message from `origin` and publishes it.
    pub fn publish_payload(&self, origin: impl Into<String>, payload: Payload) {
        self.publish(Message::new(origin, payload));
    }

    /// Publishes an untyped payload on behalf of an external caller.
    ///
    /// Known kinds are validated against their contract; a violation is
    /// returned to the caller and nothing is published.
    pub fn publish_json(
        &self,
        kind: &str,
        origin: impl Into<String>,
        payload: Value,
    ) -> Result<(), BusError> {
        match Payload::from_value(kind, payload) {
            Ok(payload) => {
                self.publish_payload(origin, payload);
                Ok(())
            }
            Err(err) => {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(kind, %err, "rejected injected message");
                Err(err)
            }
        }
    }

    /// Registers a new bounded queue under `kind` (or [`WILDCARD`]).
    #[must_use]
    pub fn subscribe(&self, kind: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.buffer_size);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self.inner.subscribers.write();
            let slots = subscribers.entry(kind.to_string()).or_default();
            slots.retain(|slot| !slot.sender.is_closed());
            slots.push(SubscriberSlot { id, sender });
        }
        debug!(kind, subscription = id, "subscription registered");
        Subscription {
            id,
            kind: kind.to_string(),
            receiver,
        }
    }

    /// Removes a queue and closes it. Returns whether it was registered.
    ///
    /// Messages already in the queue can still be drained by its owner.
    pub fn unsubscribe(&self, kind: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(slots) = subscribers.get_mut(kind) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            subscribers.remove(kind);
        }
        if removed {
            debug!(kind, subscription = id, "subscription removed");
        }
        removed
    }

    /// Number of registered subscriber queues across all kinds.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().values().map(Vec::len).sum()
    }

    /// Snapshot of counters and queue depths.
    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        let counters = &self.inner.counters;
        let queues = self
            .inner
            .subscribers
            .read()
            .iter()
            .flat_map(|(kind, slots)| {
                slots.iter().map(move |slot| QueueDepth {
                    kind: kind.clone(),
                    id: slot.id,
                    depth: slot.sender.max_capacity() - slot.sender.capacity(),
                    capacity: slot.sender.max_capacity(),
                })
            })
            .collect();
        BusMetrics {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped_inbound: counters.dropped_inbound.load(Ordering::Relaxed),
            dropped_subscriber: counters.dropped_subscriber.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            inbound_depth: self.inner.buffer_size - self.inner.inbound_tx.capacity(),
            queues,
        }
    }
}

async fn run_dispatch(inner: Arc<BusInner>, mut inbound: mpsc::Receiver<Arc<Message>>) {
    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            next = inbound.recv() => match next {
                Some(message) => inner.dispatch(&message),
                None => break,
            },
        }
    }

    inbound.close();
    while let Ok(message) = inbound.try_recv() {
        inner.dispatch(&message);
    }
    debug!("dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::{kinds, EventType, FileEventPayload};
    use serde_json::json;

    fn file_event(path: &str) -> Message {
        Message::new(
            "test",
            Payload::FileEvent(FileEventPayload {
                event_type: EventType::Create,
                file_path: path.into(),
            }),
        )
    }

    fn custom(kind: &str) -> Message {
        Message::new(
            "test",
            Payload::Custom {
                kind: kind.into(),
                data: json!({}),
            },
        )
    }

    fn path_of(message: &Message) -> &str {
        match &message.payload {
            Payload::FileEvent(body) => &body.file_path,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn routes_by_kind_and_wildcard() {
        let bus = MessageBus::new(16);
        let mut files = bus.subscribe(kinds::FILE_EVENT);
        let mut decisions = bus.subscribe(kinds::DECISION);
        let mut all = bus.subscribe(WILDCARD);
        bus.start().unwrap();

        bus.publish(file_event("/data/a.txt"));
        bus.publish(custom("heartbeat"));
        bus.stop().await;

        assert_eq!(path_of(&files.recv().await.unwrap()), "/data/a.txt");
        assert!(files.try_recv().is_none());
        assert!(decisions.try_recv().is_none());
        assert_eq!(all.recv().await.unwrap().kind(), kinds::FILE_EVENT);
        assert_eq!(all.recv().await.unwrap().kind(), "heartbeat");
    }

    #[tokio::test]
    async fn preserves_publish_order_per_subscriber() {
        let bus = MessageBus::new(32);
        let mut sub = bus.subscribe(kinds::FILE_EVENT);
        bus.start().unwrap();
        for n in 0..10 {
            bus.publish(file_event(&format!("/data/{n}.txt")));
        }
        bus.stop().await;

        for n in 0..10 {
            let message = sub.recv().await.unwrap();
            assert_eq!(path_of(&message), format!("/data/{n}.txt"));
        }
    }

    #[tokio::test]
    async fn full_subscriber_only_loses_its_own_delivery() {
        let bus = MessageBus::new(4);
        let mut stalled = bus.subscribe(kinds::FILE_EVENT);
        let mut healthy = bus.subscribe(kinds::FILE_EVENT);
        bus.start().unwrap();

        for n in 0..4 {
            bus.publish(file_event(&format!("/first/{n}")));
        }
        settle().await;
        for _ in 0..4 {
            healthy.recv().await.unwrap();
        }
        for n in 0..4 {
            bus.publish(file_event(&format!("/second/{n}")));
        }
        bus.stop().await;

        let metrics = bus.metrics();
        assert_eq!(metrics.dropped_subscriber, 4);
        for n in 0..4 {
            assert_eq!(path_of(&healthy.recv().await.unwrap()), format!("/second/{n}"));
            assert_eq!(path_of(&stalled.recv().await.unwrap()), format!("/first/{n}"));
        }
        assert!(stalled.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_inbound_buffer_drops_newest() {
        let bus = MessageBus::new(2);
        let mut sub = bus.subscribe(kinds::FILE_EVENT);
        bus.publish(file_event("/a"));
        bus.publish(file_event("/b"));
        bus.publish(file_event("/c"));
        assert_eq!(bus.metrics().inbound_depth, 2);

        bus.start().unwrap();
        bus.stop().await;

        let metrics = bus.metrics();
        assert_eq!(metrics.published, 2);
        assert_eq!(metrics.dropped_inbound, 1);
        assert_eq!(path_of(&sub.recv().await.unwrap()), "/a");
        assert_eq!(path_of(&sub.recv().await.unwrap()), "/b");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_closes_queue() {
        let bus = MessageBus::new(8);
        let mut sub = bus.subscribe(kinds::DECISION);
        bus.start().unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(kinds::DECISION, sub.id()));
        assert!(!bus.unsubscribe(kinds::DECISION, sub.id()));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
        bus.stop().await;
    }

    #[tokio::test]
    async fn stopped_bus_discards_and_cannot_restart() {
        let bus = MessageBus::new(8);
        bus.start().unwrap();
        assert!(matches!(bus.start(), Err(BusError::AlreadyStarted)));
        bus.stop().await;
        assert!(bus.is_stopped());

        bus.publish(file_event("/late"));
        assert_eq!(bus.metrics().dropped_inbound, 1);
        assert!(matches!(bus.start(), Err(BusError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn publish_json_validates_known_kinds() {
        let bus = MessageBus::new(8);
        let mut sub = bus.subscribe(kinds::COMMAND_EXECUTION);
        bus.start().unwrap();

        let err = bus
            .publish_json(kinds::FILE_EVENT, "api", json!({ "event_type": "write" }))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidPayload { .. }));
        bus.publish_json(
            kinds::COMMAND_EXECUTION,
            "api",
            json!({ "command": "ls", "args": ["-l"] }),
        )
        .unwrap();
        bus.stop().await;

        let message = sub.recv().await.unwrap();
        assert_eq!(message.origin, "api");
        match &message.payload {
            Payload::CommandExecution(body) => assert_eq!(body.args, vec!["-l".to_string()]),
            other => panic!("unexpected payload {other:?}"),
        }
        let metrics = bus.metrics();
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.published, 1);
    }

    #[tokio::test]
    async fn metrics_report_queue_depth() {
        let bus = MessageBus::new(8);
        let sub = bus.subscribe(kinds::FILE_EVENT);
        bus.start().unwrap();
        bus.publish(file_event("/x"));
        bus.publish(file_event("/y"));
        bus.stop().await;

        let metrics = bus.metrics();
        assert_eq!(metrics.delivered, 2);
        let queue = metrics.queues.iter().find(|q| q.id == sub.id()).unwrap();
        assert_eq!(queue.depth, 2);
        assert_eq!(queue.capacity, 8);
    }
}

//! Event bus shared by the job orchestrator, its resource sampler and
//! whoever watches them (status line, logs, tests).
//!
//! Publishers never wait on subscribers: a slow subscriber lags and skips
//! events instead of stalling the sampler. Closing the bus lets each
//! subscriber drain what is already buffered before it sees the end of the
//! stream, so nothing is delivered after shutdown completes.
//!
//! The composition root owns the only bus and hands out clones.

pub mod topics;

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// One notification on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Random v4 id.
    pub id: String,
    /// Publisher, one of [`sources`].
    pub source: String,
    /// Routing key, one of [`topics`].
    pub topic: String,
    /// Serialized `ResourceUsage`, `JobEvent` or message object.
    pub payload: Value,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    /// Event stamped now.
    pub fn new(source: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Create an event from any serializable payload.
    ///
    /// Payloads that fail to serialize are replaced by `null`.
    pub fn from_payload<T: Serialize>(source: &str, topic: &str, payload: &T) -> Self {
        Self::new(
            source,
            topic,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    /// Event carrying `{"message": ..}`.
    pub fn with_string(source: &str, topic: &str, message: &str) -> Self {
        Self::new(source, topic, json!({ "message": message }))
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Whether the topic starts with `prefix` (e.g. `"job/"`).
    #[must_use]
    pub fn matches(&self, prefix: &str) -> bool {
        self.topic.starts_with(prefix)
    }
}

impl std::fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} -> {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.source,
            self.topic,
            self.payload
        )
    }
}

struct BusInner {
    tx: RwLock<Option<broadcast::Sender<RuntimeEvent>>>,
    capacity: usize,
}

/// Broadcast bus with explicit close.
///
/// After [`EventBus::close`] returns, `publish` is a no-op and every receiver
/// observes `Closed` once it has drained what was already buffered.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Bus buffering `capacity` events per subscriber (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                tx: RwLock::new(Some(tx)),
                capacity,
            }),
        }
    }

    /// Per-subscriber buffer size.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Deliver `event` to current subscribers; returns how many got it
    /// (0 when nobody listens or the bus is closed).
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let guard = self.inner.tx.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Build and publish in one call.
    pub fn emit(&self, source: &str, topic: &str, payload: Value) -> usize {
        self.publish(RuntimeEvent::new(source, topic, payload))
    }

    /// Receiver for events published from now on. Drop it to unsubscribe.
    /// On a closed bus the receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        let guard = self.inner.tx.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            tx.subscribe()
        } else {
            let (tx, rx) = broadcast::channel(1);
            drop(tx);
            rx
        }
    }

    /// Subscribe to events whose topic starts with `prefix`.
    pub fn subscribe_topic(&self, prefix: impl Into<String>) -> TopicSubscription {
        TopicSubscription {
            prefix: prefix.into(),
            rx: self.subscribe(),
        }
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        let guard = self.inner.tx.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or(0, broadcast::Sender::receiver_count)
    }

    /// Stop all further deliveries. Idempotent.
    pub fn close(&self) {
        let mut guard = self
            .inner
            .tx
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            tracing::debug!("event bus closed");
        }
    }

    /// Whether [`EventBus::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner
            .tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiver filtered to one topic prefix.
pub struct TopicSubscription {
    prefix: String,
    rx: broadcast::Receiver<RuntimeEvent>,
}

impl TopicSubscription {
    /// Wait for the next matching event.
    ///
    /// Lagged receivers skip the dropped events and keep going; `None` means
    /// the bus was closed.
    pub async fn recv(&mut self) -> Option<RuntimeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.matches(&self.prefix) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(prefix = %self.prefix, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Publisher names.
pub mod sources {
    /// Job orchestrator control loop.
    pub const ORCHESTRATOR: &str = "orchestrator";
    /// Resource sampler tick.
    pub const SAMPLER: &str = "sampler";
    /// Job process supervisor.
    pub const SUPERVISOR: &str = "supervisor";
}

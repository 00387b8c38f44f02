use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Build or volume lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataEvent {
    /// Event key (e.g., "build.cache.hit", "volume.attached")
    pub key: String,

    /// Structured details: step index, layer id, volume name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StrataEvent {
    /// Create an event from key/value fields
    pub fn with_fields<I, K>(key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        Self {
            key: key.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<StrataEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody subscribes.
    pub fn emit(&self, event: StrataEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StrataEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to one event family, e.g. `"volume."`.
    pub fn subscribe_prefix(&self, prefix: impl Into<String>) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            prefix: prefix.into(),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Events whose key starts with a prefix
pub struct EventStream {
    receiver: broadcast::Receiver<StrataEvent>,
    prefix: String,
}

impl EventStream {
    /// Next matching event; `None` once every emitter is gone. Events lost
    /// to a lagging receiver are skipped.
    pub async fn recv(&mut self) -> Option<StrataEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, prefix = %self.prefix, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Build events
    pub const BUILD_STARTED: &str = "build.started";
    pub const BUILD_STEP_STARTED: &str = "build.step.started";
    pub const BUILD_CACHE_HIT: &str = "build.cache.hit";
    pub const BUILD_CACHE_MISS: &str = "build.cache.miss";
    pub const BUILD_LAYER_COMMITTED: &str = "build.layer.committed";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";

    // Volume events
    pub const VOLUME_CREATED: &str = "volume.created";
    pub const VOLUME_ATTACHED: &str = "volume.attached";
    pub const VOLUME_DETACHED: &str = "volume.detached";
    pub const VOLUME_REMOVED: &str = "volume.removed";
}

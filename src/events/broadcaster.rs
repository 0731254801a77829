//! Topic-based status broadcaster.
//!
//! Subscribers own a bounded mpsc receiver and register interest in topics
//! (`task:{id}`, `execution:{id}`, `global`). Every event goes to its own
//! topic plus `global`. Delivery is best-effort: a full or closed channel
//! drops the event, and nothing is replayed to late subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Topic every event is mirrored to.
pub const GLOBAL_TOPIC: &str = "global";

/// Default per-subscriber buffer.
const DEFAULT_CAPACITY: usize = 256;

pub fn task_topic(id: Uuid) -> String {
    format!("task:{id}")
}

pub fn execution_topic(id: Uuid) -> String {
    format!("execution:{id}")
}

/// What kind of entity an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Execution,
    /// A step of an execution. `entity_id` is the execution id.
    Step,
}

/// A status transition pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub entity_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StatusEvent {
    pub fn task(id: Uuid, status: impl ToString, data: serde_json::Value) -> Self {
        Self::new(id, EntityKind::Task, status, data)
    }

    pub fn execution(id: Uuid, status: impl ToString, data: serde_json::Value) -> Self {
        Self::new(id, EntityKind::Execution, status, data)
    }

    pub fn step(
        execution_id: Uuid,
        step_id: &str,
        status: impl ToString,
        mut data: serde_json::Value,
    ) -> Self {
        match data.as_object_mut() {
            Some(map) => {
                map.insert("step_id".into(), step_id.into());
            }
            None => data = serde_json::json!({ "step_id": step_id }),
        }
        Self::new(execution_id, EntityKind::Step, status, data)
    }

    fn new(entity_id: Uuid, kind: EntityKind, status: impl ToString, data: serde_json::Value) -> Self {
        Self {
            entity_id,
            kind,
            status: status.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Topic this event is published on (besides `global`).
    pub fn topic(&self) -> String {
        match self.kind {
            EntityKind::Task => task_topic(self.entity_id),
            EntityKind::Execution | EntityKind::Step => execution_topic(self.entity_id),
        }
    }
}

/// Opaque handle for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    tx: mpsc::Sender<StatusEvent>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, Subscriber>,
    topics: HashMap<String, HashSet<SubscriberId>>,
}

impl Registry {
    fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(sub) = self.subscribers.remove(&id) else {
            return false;
        };
        for topic in sub.topics {
            if let Some(members) = self.topics.get_mut(&topic) {
                members.remove(&id);
                if members.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }
        true
    }
}

/// Fan-out of status events to topic subscribers.
pub struct EventBroadcaster {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broadcaster whose subscriber channels buffer `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber with no topics yet.
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<StatusEvent>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.registry.lock().subscribers.insert(
            id,
            Subscriber {
                tx,
                topics: HashSet::new(),
            },
        );
        debug!(subscriber = %id, "Subscriber connected");
        (id, rx)
    }

    /// Add `topic` to a subscriber. Idempotent. Returns false for unknown subscribers.
    pub fn subscribe(&self, id: SubscriberId, topic: &str) -> bool {
        let mut registry = self.registry.lock();
        let Some(sub) = registry.subscribers.get_mut(&id) else {
            return false;
        };
        sub.topics.insert(topic.to_string());
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id);
        true
    }

    /// Remove `topic` from a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId, topic: &str) {
        let mut registry = self.registry.lock();
        if let Some(sub) = registry.subscribers.get_mut(&id) {
            sub.topics.remove(topic);
        }
        if let Some(members) = registry.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                registry.topics.remove(topic);
            }
        }
    }

    /// Drop a subscriber and every registration it holds.
    pub fn disconnect(&self, id: SubscriberId) {
        if self.registry.lock().remove(id) {
            debug!(subscriber = %id, "Subscriber disconnected");
        }
    }

    /// Deliver `event` to its topic and to `global`. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: StatusEvent) -> usize {
        let topic = event.topic();
        let mut registry = self.registry.lock();

        let targets: HashSet<SubscriberId> = [topic.as_str(), GLOBAL_TOPIC]
            .iter()
            .filter_map(|t| registry.topics.get(*t))
            .flatten()
            .copied()
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for id in targets {
            let Some(sub) = registry.subscribers.get(&id) else {
                continue;
            };
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = %id, topic = %topic, "Subscriber buffer full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        for id in closed {
            registry.remove(id);
        }

        trace!(topic = %topic, status = %event.status, delivered, "Event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.registry.lock().topics.len()
    }
}

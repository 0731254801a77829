//! Real-time status events: topic broadcaster and its WebSocket endpoint.

pub mod broadcaster;
pub mod ws;

pub use broadcaster::{
    EntityKind, EventBroadcaster, GLOBAL_TOPIC, StatusEvent, SubscriberId, execution_topic,
    task_topic,
};

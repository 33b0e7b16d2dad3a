//! Table broadcast bus.
//!
//! Payloads travel as raw JSON text; decoding is left to the subscriber so a
//! malformed message surfaces where it is consumed.

pub mod realtime;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;

pub use realtime::RealtimePubSub;

/// Topic carrying `[index, state]` updates for a table.
pub fn diffs_topic(table_id: &str) -> String {
    format!("room:{table_id}:diffs")
}

/// Topic on which a replica announces the length of a freshly loaded snapshot.
pub fn snapshot_ack_topic(table_id: &str) -> String {
    format!("room:{table_id}:snapshotAck")
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pub/sub connection closed")]
    Closed,
    #[error("failed to encode payload for topic {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to connect to pub/sub backend: {0}")]
    Connect(String),
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, PubSubError>;
    async fn publish(&self, topic: &str, payload: String) -> Result<(), PubSubError>;
}

/// Process-local bus; every topic is a tokio broadcast channel.
pub struct InMemoryPubSub {
    topics: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl InMemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, PubSubError> {
        Ok(self.sender(topic).subscribe())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), PubSubError> {
        // No subscribers is not a failure for a broadcast bus.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_room_naming() {
        assert_eq!(diffs_topic("t1"), "room:t1:diffs");
        assert_eq!(snapshot_ack_topic("t1"), "room:t1:snapshotAck");
    }

    #[tokio::test]
    async fn in_memory_bus_fans_out_per_topic() {
        let bus = InMemoryPubSub::new(8);
        let mut a = bus.subscribe("room:a:diffs").await.unwrap();
        let mut a2 = bus.subscribe("room:a:diffs").await.unwrap();
        let mut b = bus.subscribe("room:b:diffs").await.unwrap();

        bus.publish("room:a:diffs", "[0,{}]".into()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "[0,{}]");
        assert_eq!(a2.recv().await.unwrap(), "[0,{}]");
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryPubSub::default();
        bus.publish("room:x:snapshotAck", "3".into()).await.unwrap();
    }
}

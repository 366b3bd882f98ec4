/// file: src/bus.rs
/// description: publish/subscribe message bus the sync core talks to the server through
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// The transport seen as a black box: topics in, topics out.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    /// Every message on every topic, in publish order. Batch control and cell
    /// updates travel on different topics and must not be reordered.
    fn subscribe_all(&self) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

pub fn publish_json<T: Serialize>(bus: &dyn Bus, topic: &str, message: &T) -> BusResult<()> {
    let payload =
        serde_json::to_vec(message).map_err(|e| BusError::Transport(e.to_string()))?;
    bus.publish(topic, Bytes::from(payload))
}

pub fn decode<T: DeserializeOwned>(message: &BusMessage) -> serde_json::Result<T> {
    serde_json::from_slice(&message.payload)
}

/// In-process bus; backs the simulator and the tests.
#[derive(Debug)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    all: broadcast::Sender<BusMessage>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            all: broadcast::channel(TOPIC_CAPACITY * 4).0,
        }
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn subscribe_all(&self) -> broadcast::Receiver<BusMessage> {
        self.all.subscribe()
    }

    /// Publishing to a topic nobody listens on is not an error.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        let _ = self.sender_for(topic).send(message.clone());
        let _ = self.all.send(message);
        Ok(())
    }
}

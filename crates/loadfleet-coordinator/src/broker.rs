//! In-process pub/sub for engine control messages.
//!
//! One topic per collection. Each subscriber gets an unbounded queue so a slow
//! socket never blocks a broadcast.

use loadfleet_core::{LoadfleetResult, Payload};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A live subscription on one topic.
#[derive(Debug)]
pub struct Subscription {
    /// Subscriber id, used to unsubscribe.
    pub id: Uuid,
    /// Topic the subscription listens on.
    pub topic: String,
    /// Serialized payloads in broadcast order.
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// In-process pub/sub hub. Engines subscribe over WebSocket, one topic per collection.
pub struct Broker {
    topics: RwLock<HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<String>>>>,
}

impl Broker {
    /// A shared, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new subscriber on `topic`.
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
        tracing::info!(topic, subscriber_id = %id, "Subscriber added");
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Drop subscriber `id`; an emptied topic is removed.
    pub async fn unsubscribe(&self, topic: &str, id: Uuid) {
        let mut topics = self.topics.write().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        tracing::info!(topic, subscriber_id = %id, "Subscriber removed");
    }

    /// Live subscribers on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|subs| subs.values().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Send a payload to every subscriber of `topic`.
    ///
    /// Returns how many subscribers it was handed to; zero is not an error.
    pub async fn broadcast(&self, topic: &str, payload: &Payload) -> LoadfleetResult<usize> {
        let message = payload.to_json()?;
        let delivered = {
            let topics = self.topics.read().await;
            topics
                .get(topic)
                .map(|subs| {
                    subs.values()
                        .filter(|tx| tx.send(message.clone()).is_ok())
                        .count()
                })
                .unwrap_or(0)
        };
        tracing::info!(topic, %payload, delivered, "Payload broadcast");
        Ok(delivered)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }
}

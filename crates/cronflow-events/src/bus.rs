//! Event bus: live subscribers and routing of published events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::events::BusEvent;

/// A registered observer. Dropping the receiver makes the next delivery fail,
/// which deregisters it.
pub struct Subscription {
    pub id: String,
    pub receiver: mpsc::UnboundedReceiver<BusEvent>,
    registration: u64,
}

impl Subscription {
    /// Identifies this registration among others made under the same ID.
    pub fn registration(&self) -> u64 {
        self.registration
    }
}

struct Subscriber {
    registration: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// Keyed publish/subscribe channel.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    next_registration: AtomicU64,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
        }
    }

    /// Register a subscriber under a generated ID.
    pub async fn subscribe(&self) -> Subscription {
        self.subscribe_as(uuid::Uuid::new_v4().to_string()).await
    }

    /// Register a subscriber under a caller-chosen ID, replacing any previous
    /// subscriber with that ID.
    pub async fn subscribe_as(&self, id: impl Into<String>) -> Subscription {
        let id = id.into();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .insert(id.clone(), Subscriber { registration, tx });
        debug!(subscriber = %id, registration, "Subscriber registered");
        Subscription {
            id,
            receiver: rx,
            registration,
        }
    }

    /// Remove `subscription`. A newer registration under the same ID is left
    /// in place. Returns whether anything was removed.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let owned = subscribers
            .get(&subscription.id)
            .is_some_and(|s| s.registration == subscription.registration);
        if owned {
            subscribers.remove(&subscription.id);
            debug!(subscriber = %subscription.id, "Subscriber removed");
        }
        owned
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Publish an event.
    ///
    /// If `client_id` names a registered subscriber only that subscriber
    /// receives it; otherwise it is broadcast to everyone. Subscribers whose
    /// channel is closed are dropped. Returns the number of deliveries.
    pub async fn publish(&self, client_id: Option<&str>, event: &str, payload: Value) -> usize {
        let event = BusEvent::new(event, payload);
        let mut dead = Vec::new();
        let mut delivered = 0;

        {
            let subscribers = self.subscribers.read().await;
            let targeted = client_id.and_then(|id| subscribers.get_key_value(id));

            match targeted {
                Some((id, subscriber)) => {
                    if subscriber.tx.send(event).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(id.clone());
                    }
                }
                None => {
                    for (id, subscriber) in subscribers.iter() {
                        if subscriber.tx.send(event.clone()).is_ok() {
                            delivered += 1;
                        } else {
                            dead.push(id.clone());
                        }
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                // Only drop it if it was not re-registered in the meantime.
                if subscribers.get(&id).is_some_and(|s| s.tx.is_closed()) {
                    subscribers.remove(&id);
                    debug!(subscriber = %id, "Dropped disconnected subscriber");
                }
            }
        }

        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_without_client_id() {
        let bus = EventBus::new();
        let mut a = bus.subscribe().await;
        let mut b = bus.subscribe().await;

        let delivered = bus.publish(None, "job:started", json!({"job_id": "x"})).await;
        assert_eq!(delivered, 2);
        assert_eq!(a.receiver.recv().await.unwrap().event, "job:started");
        assert_eq!(b.receiver.recv().await.unwrap().payload["job_id"], "x");
    }

    #[tokio::test]
    async fn test_targeted_delivery() {
        let bus = EventBus::new();
        let mut target = bus.subscribe_as("client-1").await;
        let mut other = bus.subscribe_as("client-2").await;

        let delivered = bus
            .publish(Some("client-1"), "task:progress", json!({"progress": 50}))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(target.receiver.recv().await.unwrap().payload["progress"], 50);
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_client_id_broadcasts() {
        let bus = EventBus::new();
        let mut a = bus.subscribe().await;
        let delivered = bus.publish(Some("gone"), "task:progress", json!({})).await;
        assert_eq!(delivered, 1);
        assert!(a.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dead_subscriber_deregistered() {
        let bus = EventBus::new();
        let alive = bus.subscribe().await;
        let dead = bus.subscribe().await;
        drop(dead);

        let delivered = bus.publish(None, "job:completed", json!({})).await;
        assert_eq!(delivered, 1);
        assert_eq!(bus.subscriber_count().await, 1);
        drop(alive);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let sub = bus.subscribe().await;
        assert!(bus.unsubscribe(&sub).await);
        assert!(!bus.unsubscribe(&sub).await);
        assert_eq!(bus.publish(None, "job:started", json!({})).await, 0);
    }

    #[tokio::test]
    async fn test_stale_unsubscribe_keeps_reconnected_client() {
        let bus = EventBus::new();
        let old = bus.subscribe_as("client-1").await;
        let mut new = bus.subscribe_as("client-1").await;
        assert_ne!(old.registration(), new.registration());

        assert!(!bus.unsubscribe(&old).await);
        assert_eq!(bus.subscriber_count().await, 1);

        let delivered = bus
            .publish(Some("client-1"), "task:progress", json!({"progress": 10}))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(new.receiver.recv().await.unwrap().payload["progress"], 10);

        assert!(bus.unsubscribe(&new).await);
        assert_eq!(bus.subscriber_count().await, 0);
    }
}

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Topic-addressed message bus used between sensors, the display, and operators.
//!
//! Topics are `/`-separated levels. Subscription filters follow the usual
//! broker conventions: `+` matches exactly one level and a trailing `#`
//! matches every remaining level.

use std::{collections::VecDeque, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

/// One message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Publication timestamp.
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            published_at: Utc::now(),
        }
    }

    /// Creates a message carrying a JSON document.
    pub fn json(topic: impl Into<String>, payload: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(payload)?))
    }

    /// Payload decoded as UTF-8 with surrounding whitespace removed.
    pub fn text(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.payload)?.trim())
    }
}

/// Returns whether `topic` is selected by the subscription `filter`.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Publishing side of the bus.
pub trait BusPublisher: Send + Sync {
    /// Publishes a message. Delivery is best-effort.
    fn publish(&self, message: BusMessage) -> Result<()>;
}

/// Establishes subscriptions; implemented by broker clients.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connects and subscribes to the given topic filters.
    async fn connect(&self, filters: &[String]) -> Result<BusSubscription>;
}

/// Live subscription yielding only messages selected by its filters.
#[derive(Debug)]
pub struct BusSubscription {
    filters: Vec<String>,
    receiver: broadcast::Receiver<BusMessage>,
    lagged: u64,
}

impl BusSubscription {
    /// Wraps a broadcast receiver.
    #[must_use]
    pub fn new(filters: Vec<String>, receiver: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            filters,
            receiver,
            lagged: 0,
        }
    }

    /// Waits for the next matching message. `None` means the connection is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => {
                    if self.selects(&message.topic) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => self.lagged += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Number of messages dropped because the subscriber fell behind.
    #[must_use]
    pub const fn lagged(&self) -> u64 {
        self.lagged
    }

    fn selects(&self, topic: &str) -> bool {
        self.filters.iter().any(|filter| topic_matches(filter, topic))
    }
}

/// In-process broadcast bus (local runs and tests).
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: Arc<Mutex<broadcast::Sender<BusMessage>>>,
    backlog: Arc<Mutex<VecDeque<BusMessage>>>,
    capacity: usize,
    offline: Arc<Mutex<bool>>,
}

impl MemoryBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(Mutex::new(sender)),
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            offline: Arc::new(Mutex::new(false)),
        }
    }

    /// Recent messages retained in memory, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BusMessage> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Recent messages on topics selected by `filter`.
    #[must_use]
    pub fn snapshot_matching(&self, filter: &str) -> Vec<BusMessage> {
        self.backlog
            .lock()
            .iter()
            .filter(|message| topic_matches(filter, &message.topic))
            .cloned()
            .collect()
    }

    /// Drops every live subscription, as a broker restart would.
    pub fn drop_connections(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        *self.sender.lock() = sender;
    }

    /// Marks the bus unreachable (`true`) or reachable again (`false`).
    /// Going offline also drops every live subscription.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
        if offline {
            self.drop_connections();
        }
    }
}

impl BusPublisher for MemoryBus {
    fn publish(&self, message: BusMessage) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(message.clone());
        }
        // No receivers is not an error for a broadcast bus.
        let _ = self.sender.lock().send(message);
        Ok(())
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self, filters: &[String]) -> Result<BusSubscription> {
        if *self.offline.lock() {
            bail!("memory bus offline");
        }
        let receiver = self.sender.lock().subscribe();
        Ok(BusSubscription::new(filters.to_vec(), receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_filters() {
        assert!(topic_matches("smartart/sensordata", "smartart/sensordata"));
        assert!(topic_matches("smartart/cmd/+", "smartart/cmd/mode"));
        assert!(topic_matches("smartart/#", "smartart/events/policy.cycle"));
        assert!(!topic_matches("smartart/cmd/+", "smartart/cmd"));
        assert!(!topic_matches("smartart/cmd/mode", "smartart/cmd/mode/extra"));
    }

    #[tokio::test]
    async fn subscription_filters_topics() {
        let bus = MemoryBus::new(16);
        let mut sub = bus.connect(&["smartart/cmd/mode".into()]).await.unwrap();
        bus.publish(BusMessage::new("smartart/sensordata", "{}")).unwrap();
        bus.publish(BusMessage::new("smartart/cmd/mode", " request \n")).unwrap();
        let message = sub.next().await.unwrap();
        assert_eq!(message.topic, "smartart/cmd/mode");
        assert_eq!(message.text().unwrap(), "request");
        assert_eq!(bus.snapshot().len(), 2);
        assert_eq!(bus.snapshot_matching("smartart/cmd/#").len(), 1);
    }

    #[tokio::test]
    async fn dropping_connections_closes_subscriptions() {
        let bus = MemoryBus::new(4);
        let mut sub = bus.connect(&["#".into()]).await.unwrap();
        bus.drop_connections();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn offline_bus_refuses_connections() {
        let bus = MemoryBus::new(4);
        bus.set_offline(true);
        assert!(bus.connect(&["#".into()]).await.is_err());
        bus.set_offline(false);
        assert!(bus.connect(&["#".into()]).await.is_ok());
    }
}

//! Publish/subscribe media the relay can run over

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Buffer between a medium subscription and the relay reading it
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Named-topic publish/subscribe transport carrying opaque payloads.
///
/// Delivery is fire-and-forget: a payload published while nobody is
/// subscribed is lost. A subscription's receiver ends when the medium is
/// closed or the underlying connection is lost.
#[async_trait]
pub trait PubSubMedium: Send + Sync {
    /// Publish `payload` on `topic`, returning how many subscribers it reached
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize>;

    /// Start receiving payloads published on `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Tear down the connection; open subscriptions end cleanly
    async fn close(&self);
}

/// In-process medium. Hubs sharing one `MemoryMedium` behave like server
/// instances sharing one Redis.
#[derive(Default)]
pub struct MemoryMedium {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
    closed: AtomicBool,
}

impl MemoryMedium {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl PubSubMedium for MemoryMedium {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut topics = self.topics.lock();
        let Some(senders) = topics.get_mut(topic) else {
            return Ok(0);
        };

        senders.retain(|tx| !tx.is_closed());
        let mut reached = 0;
        for tx in senders.iter() {
            match tx.try_send(payload.clone()) {
                Ok(()) => reached += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %topic, "Memory medium subscriber lagging, payload dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(reached)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic = %topic, "Memory medium subscription opened");
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders ends every open subscription
        self.topics.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_medium_fans_out_per_topic() {
        let medium = MemoryMedium::new();
        let mut a = medium.subscribe("changes").await.unwrap();
        let mut b = medium.subscribe("changes").await.unwrap();
        let mut other = medium.subscribe("other").await.unwrap();

        let reached = medium.publish("changes", b"hello".to_vec()).await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(a.recv().await.unwrap(), b"hello");
        assert_eq!(b.recv().await.unwrap(), b"hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_medium_publish_without_subscribers() {
        let medium = MemoryMedium::new();
        assert_eq!(medium.publish("nobody", Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_medium_close_ends_subscriptions() {
        let medium = MemoryMedium::new();
        let mut rx = medium.subscribe("changes").await.unwrap();

        medium.close().await;

        assert!(rx.recv().await.is_none());
        assert!(matches!(
            medium.publish("changes", Vec::new()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(medium.subscribe("changes").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_memory_medium_prunes_dropped_subscribers() {
        let medium = MemoryMedium::new();
        let rx = medium.subscribe("changes").await.unwrap();
        assert_eq!(medium.subscriber_count("changes"), 1);

        drop(rx);
        assert_eq!(medium.subscriber_count("changes"), 0);
        assert_eq!(medium.publish("changes", Vec::new()).await.unwrap(), 0);
    }
}

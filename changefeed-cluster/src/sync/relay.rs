use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use changefeed_core::metrics;
use changefeed_core::ChangeEvent;

use super::medium::PubSubMedium;
use crate::error::{Error, Result};

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Capacity of the channel handing decoded relay events to the hub
pub const RELAY_CHANNEL_CAPACITY: usize = 100;

/// Wire form of a relayed event: the event's own fields plus the id of the
/// relay that published it. Payloads from foreign producers may omit `origin`.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent<E> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
    #[serde(flatten)]
    event: E,
}

/// Result of decoding one payload received from the medium
#[derive(Debug)]
enum Inbound {
    Event(ChangeEvent),
    /// Published by this relay; already delivered locally
    Echo,
}

/// Bridges change events to and from a publish/subscribe medium so several
/// server instances see the same stream.
///
/// Events received through [`subscribe_remote`](Self::subscribe_remote) must
/// only be fed to a local broadcaster, never back into
/// [`publish_remote`](Self::publish_remote).
pub struct DistributedRelay {
    medium: Arc<dyn PubSubMedium>,
    topic: String,
    node_id: String,
    cancel_token: CancellationToken,
    malformed: AtomicU64,
}

impl DistributedRelay {
    pub fn new(
        medium: Arc<dyn PubSubMedium>,
        topic: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            medium,
            topic: topic.into(),
            node_id: node_id.into(),
            cancel_token: CancellationToken::new(),
            malformed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payloads skipped because they could not be decoded
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Serialize `event` and publish it for every other subscribing instance
    pub async fn publish_remote(&self, event: &ChangeEvent) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let payload = Self::encode(&self.node_id, event)?;

        match self.medium.publish(&self.topic, payload).await {
            Ok(receivers) => {
                debug!(
                    topic = %self.topic,
                    table = %event.table(),
                    operation = %event.operation(),
                    receivers = receivers,
                    "Event published to relay"
                );
                Ok(receivers)
            }
            Err(e) => {
                metrics::relay::PUBLISH_FAILURES.inc();
                error!(
                    error = %e,
                    topic = %self.topic,
                    table = %event.table(),
                    "Failed to publish event to relay"
                );
                Err(e)
            }
        }
    }

    /// Receive events published by other instances until `cancel` fires or
    /// the relay is closed.
    ///
    /// The first subscription is made before returning so its failure reaches
    /// the caller; later disconnects are retried with exponential backoff.
    pub async fn subscribe_remote(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let inbound = self.medium.subscribe(&self.topic).await?;
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);

        info!(topic = %self.topic, node_id = %self.node_id, "Relay subscription started");

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.run_subscriber(inbound, tx, cancel).await;
        });

        Ok(rx)
    }

    async fn run_subscriber(
        &self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<ChangeEvent>,
        cancel: CancellationToken,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            if !self.forward(&mut inbound, &tx, &cancel).await {
                return;
            }

            warn!(topic = %self.topic, "Relay subscription lost, reconnecting");

            // Reconnect until it succeeds or we are told to stop
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = self.cancel_token.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                match self.medium.subscribe(&self.topic).await {
                    Ok(rx) => {
                        info!(topic = %self.topic, "Relay subscription re-established");
                        inbound = rx;
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        break;
                    }
                    Err(Error::Closed) => return,
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Relay failed to resubscribe, retrying after backoff"
                        );
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    }
                }
            }
        }
    }

    /// Pump one medium subscription into `tx`.
    ///
    /// Returns true when the medium connection ended and a resubscribe should
    /// be attempted; false when the relay should stop.
    async fn forward(
        &self,
        inbound: &mut mpsc::Receiver<Vec<u8>>,
        tx: &mpsc::Sender<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let payload = tokio::select! {
                () = cancel.cancelled() => return false,
                () = self.cancel_token.cancelled() => return false,
                payload = inbound.recv() => payload,
            };

            let Some(payload) = payload else {
                return !self.is_closed() && !cancel.is_cancelled();
            };

            let event = match Self::decode(&self.node_id, &payload) {
                Ok(Inbound::Event(event)) => event,
                Ok(Inbound::Echo) => continue,
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    metrics::relay::MALFORMED_PAYLOADS.inc();
                    warn!(
                        error = %e,
                        topic = %self.topic,
                        payload = %String::from_utf8_lossy(&payload),
                        "Skipping malformed relay payload"
                    );
                    continue;
                }
            };

            tokio::select! {
                () = cancel.cancelled() => return false,
                () = self.cancel_token.cancelled() => return false,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        debug!(topic = %self.topic, "Relay consumer dropped");
                        return false;
                    }
                }
            }
        }
    }

    fn encode(node_id: &str, event: &ChangeEvent) -> Result<Vec<u8>> {
        let wire = WireEvent {
            origin: Some(node_id.to_string()),
            event,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode(node_id: &str, payload: &[u8]) -> Result<Inbound> {
        let wire: WireEvent<ChangeEvent> = serde_json::from_slice(payload)?;
        if wire.origin.as_deref() == Some(node_id) {
            return Ok(Inbound::Echo);
        }

        let mut event = wire.event;
        event.validate()?;
        event.backfill_timestamp(Utc::now());
        Ok(Inbound::Event(event))
    }

    /// Stop this relay's subscriptions and reject further publishes.
    ///
    /// The medium is left open; it may be shared with other relays and is
    /// closed by whoever created it.
    pub async fn close(&self) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        info!(topic = %self.topic, "Closing relay");
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::medium::MemoryMedium;
    use changefeed_core::Row;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Medium whose subscribe calls return prepared results in order, then
    /// fail with a timeout once the script runs out
    struct ScriptedMedium {
        script: Mutex<VecDeque<Result<mpsc::Receiver<Vec<u8>>>>>,
        subscribes: AtomicU64,
    }

    impl ScriptedMedium {
        fn new(script: Vec<Result<mpsc::Receiver<Vec<u8>>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                subscribes: AtomicU64::new(0),
            }
        }

        fn subscribes(&self) -> u64 {
            self.subscribes.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl PubSubMedium for ScriptedMedium {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<usize> {
            Ok(0)
        }

        async fn subscribe(&self, _topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Timeout("connection refused".to_string())))
        }

        async fn close(&self) {}
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn relay(medium: &Arc<MemoryMedium>, node_id: &str) -> Arc<DistributedRelay> {
        Arc::new(DistributedRelay::new(medium.clone(), "data_changes", node_id))
    }

    async fn next(rx: &mut mpsc::Receiver<ChangeEvent>) -> Option<ChangeEvent> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_wire_format_keeps_event_fields_at_top_level() {
        let event = ChangeEvent::insert("users", row(json!({"id": 1}))).unwrap();
        let payload = DistributedRelay::encode("node-a", &event).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["origin"], "node-a");
        assert_eq!(value["operation"], "INSERT");
        assert_eq!(value["table"], "users");
        assert_eq!(value["data"]["id"], 1);
    }

    #[test]
    fn test_decode_skips_own_echo() {
        let event = ChangeEvent::insert("users", Row::new()).unwrap();
        let payload = DistributedRelay::encode("node-a", &event).unwrap();

        assert!(matches!(
            DistributedRelay::decode("node-a", &payload).unwrap(),
            Inbound::Echo
        ));
        assert!(matches!(
            DistributedRelay::decode("node-b", &payload).unwrap(),
            Inbound::Event(_)
        ));
    }

    #[test]
    fn test_decode_accepts_payload_without_origin() {
        let payload = br#"{"operation":"DELETE","table":"orders","data":{"id":9}}"#;
        match DistributedRelay::decode("node-a", payload).unwrap() {
            Inbound::Event(event) => {
                assert_eq!(event.table(), "orders");
                assert!(event.timestamp().is_some());
            }
            Inbound::Echo => panic!("foreign payload treated as echo"),
        }
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(DistributedRelay::decode("n", b"{not json").is_err());
        assert!(DistributedRelay::decode("n", br#"{"operation":"INSERT","table":""}"#).is_err());
        assert!(DistributedRelay::decode("n", br#"{"table":"t"}"#).is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_backfills_missing_timestamp() {
        let medium = Arc::new(MemoryMedium::new());
        let a = relay(&medium, "node-a");
        let b = relay(&medium, "node-b");

        let mut rx = b.subscribe_remote(CancellationToken::new()).await.unwrap();

        let event = ChangeEvent::update(
            "accounts",
            row(json!({"balance": 100})),
            row(json!({"balance": 50})),
        )
        .unwrap();
        let published_at = Utc::now();
        assert_eq!(a.publish_remote(&event).await.unwrap(), 1);

        let received = next(&mut rx).await.unwrap();
        assert_eq!(received.operation(), event.operation());
        assert_eq!(received.table(), event.table());
        assert_eq!(received.data(), event.data());
        assert_eq!(received.old_data(), event.old_data());
        assert!(*received.timestamp().unwrap() >= published_at);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_existing_timestamp() {
        let medium = Arc::new(MemoryMedium::new());
        let a = relay(&medium, "node-a");
        let b = relay(&medium, "node-b");
        let mut rx = b.subscribe_remote(CancellationToken::new()).await.unwrap();

        let event = ChangeEvent::insert("users", row(json!({"id": 3})))
            .unwrap()
            .with_timestamp(Utc::now());
        a.publish_remote(&event).await.unwrap();

        assert_eq!(next(&mut rx).await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_end_subscription() {
        let medium = Arc::new(MemoryMedium::new());
        let b = relay(&medium, "node-b");
        let mut rx = b.subscribe_remote(CancellationToken::new()).await.unwrap();

        medium
            .publish("data_changes", b"garbage".to_vec())
            .await
            .unwrap();
        let good = ChangeEvent::insert("users", Row::new()).unwrap();
        relay(&medium, "node-a").publish_remote(&good).await.unwrap();

        assert_eq!(next(&mut rx).await.unwrap().table(), "users");
        assert_eq!(b.malformed_count(), 1);
    }

    #[tokio::test]
    async fn test_own_events_are_not_received() {
        let medium = Arc::new(MemoryMedium::new());
        let a = relay(&medium, "node-a");
        let mut rx = a.subscribe_remote(CancellationToken::new()).await.unwrap();

        a.publish_remote(&ChangeEvent::insert("own", Row::new()).unwrap())
            .await
            .unwrap();
        relay(&medium, "node-b")
            .publish_remote(&ChangeEvent::insert("peer", Row::new()).unwrap())
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.unwrap().table(), "peer");
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription_cleanly() {
        let medium = Arc::new(MemoryMedium::new());
        let b = relay(&medium, "node-b");
        let cancel = CancellationToken::new();
        let mut rx = b.subscribe_remote(cancel.clone()).await.unwrap();

        cancel.cancel();
        assert!(next(&mut rx).await.is_none());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_subscription_and_rejects_publish() {
        let medium = Arc::new(MemoryMedium::new());
        let b = relay(&medium, "node-b");
        let mut rx = b.subscribe_remote(CancellationToken::new()).await.unwrap();

        b.close().await;

        assert!(next(&mut rx).await.is_none());
        let event = ChangeEvent::insert("users", Row::new()).unwrap();
        assert!(matches!(b.publish_remote(&event).await, Err(Error::Closed)));
        assert!(matches!(
            b.subscribe_remote(CancellationToken::new()).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let medium = Arc::new(MemoryMedium::new());
        let a = relay(&medium, "node-a");
        medium.close().await;

        let event = ChangeEvent::insert("users", Row::new()).unwrap();
        assert!(a.publish_remote(&event).await.is_err());
    }

    #[tokio::test]
    async fn test_close_leaves_shared_medium_open() {
        let medium = Arc::new(MemoryMedium::new());
        let a = relay(&medium, "node-a");
        let b = relay(&medium, "node-b");
        let c = relay(&medium, "node-c");
        let mut on_a = a.subscribe_remote(CancellationToken::new()).await.unwrap();
        let mut on_c = c.subscribe_remote(CancellationToken::new()).await.unwrap();

        a.close().await;
        assert!(next(&mut on_a).await.is_none());

        let event = ChangeEvent::insert("orders", Row::new()).unwrap();
        assert_eq!(b.publish_remote(&event).await.unwrap(), 1);
        assert_eq!(next(&mut on_c).await.unwrap().table(), "orders");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_subscription_is_reestablished() {
        let (first_tx, first_rx) = mpsc::channel(4);
        let (second_tx, second_rx) = mpsc::channel(4);
        let medium = Arc::new(ScriptedMedium::new(vec![Ok(first_rx), Ok(second_rx)]));
        let b = Arc::new(DistributedRelay::new(medium.clone(), "data_changes", "node-b"));

        let mut rx = b.subscribe_remote(CancellationToken::new()).await.unwrap();
        assert_eq!(medium.subscribes(), 1);

        // Connection drops; the relay resubscribes after the first backoff
        drop(first_tx);
        let event = ChangeEvent::insert("users", Row::new()).unwrap();
        second_tx
            .send(DistributedRelay::encode("node-a", &event).unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.table(), "users");
        assert_eq!(medium.subscribes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resubscribe_backs_off_until_cancelled() {
        let (first_tx, first_rx) = mpsc::channel(4);
        let medium = Arc::new(ScriptedMedium::new(vec![Ok(first_rx)]));
        let b = Arc::new(DistributedRelay::new(medium.clone(), "data_changes", "node-b"));
        let cancel = CancellationToken::new();

        let mut rx = b.subscribe_remote(cancel.clone()).await.unwrap();
        drop(first_tx);

        // Retries at 1s, 3s and 7s; the next one is not due until 15s
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(medium.subscribes(), 4);

        cancel.cancel();
        assert!(rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(medium.subscribes(), 4);
    }
}

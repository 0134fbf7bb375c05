//! Composition root tying one registry, one broadcaster and an optional
//! relay together

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use changefeed_core::{metrics, ChangeEvent, ChangeSource};

use super::broadcaster::Broadcaster;
use super::registry::{SubscriberRegistry, DEFAULT_CHANNEL_CAPACITY};
use super::relay::DistributedRelay;
use super::session::{EventSink, StreamSession};
use crate::error::{Error, Result};

/// Relay publish queue length used when none is configured
pub const DEFAULT_RELAY_QUEUE_CAPACITY: usize = 1024;

/// Hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-subscriber queue capacity
    pub channel_capacity: usize,
    /// Identity of this hub on the relay
    pub node_id: String,
    /// Events a source pump may have waiting for the relay; overflow is dropped
    pub relay_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            node_id: format!("node_{}", nanoid::nanoid!(10)),
            relay_queue_capacity: DEFAULT_RELAY_QUEUE_CAPACITY,
        }
    }
}

impl From<&changefeed_core::config::HubConfig> for HubConfig {
    fn from(settings: &changefeed_core::config::HubConfig) -> Self {
        let mut config = Self {
            channel_capacity: settings.channel_capacity,
            relay_queue_capacity: settings.relay_queue_capacity,
            ..Self::default()
        };
        if !settings.node_id.is_empty() {
            config.node_id.clone_from(&settings.node_id);
        }
        config
    }
}

/// How a [`ChangeHub::run_source`] loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceExit {
    /// The source reported end of stream
    Ended,
    /// The source returned an error
    Failed(String),
    Cancelled,
}

/// Point-in-time counters for one hub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub relay_failures: u64,
}

/// Queue between a source pump and the task publishing its events to the
/// relay, so a slow or stalled medium never holds up local delivery.
struct RelayPublisher {
    queue: mpsc::Sender<Arc<ChangeEvent>>,
    task: JoinHandle<()>,
    cancel: CancellationToken,
    failures: Arc<AtomicU64>,
}

impl RelayPublisher {
    fn spawn(
        relay: Arc<DistributedRelay>,
        capacity: usize,
        failures: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, mut pending) = mpsc::channel::<Arc<ChangeEvent>>(capacity.max(1));

        let task = {
            let failures = failures.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        event = pending.recv() => event,
                    };
                    let Some(event) = event else { break };

                    let result = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        result = relay.publish_remote(&event) => result,
                    };
                    if result.is_err() {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                debug!(topic = %relay.topic(), "Relay publisher stopped");
            })
        };

        Self {
            queue,
            task,
            cancel,
            failures,
        }
    }

    /// Hand `event` to the publish task without waiting; a full queue drops it
    fn enqueue(&self, event: Arc<ChangeEvent>) {
        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::relay::PUBLISH_FAILURES.inc();
                warn!(
                    table = %event.table(),
                    operation = %event.operation(),
                    "Relay publish queue full, event not relayed"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Publish whatever is still queued, unless `cancel` fires first
    async fn finish(self, cancel: &CancellationToken) {
        let Self {
            queue,
            mut task,
            cancel: publisher_cancel,
            ..
        } = self;
        drop(queue);

        tokio::select! {
            _ = &mut task => {}
            () = cancel.cancelled() => publisher_cancel.cancel(),
        }
    }
}

/// Local fan-out hub with optional cross-instance relay.
///
/// Events read from a [`ChangeSource`] go to local subscribers and then to
/// the relay. Events received from the relay go to local subscribers only.
/// Several hubs may live in one process; they share nothing unless they
/// share a relay medium.
pub struct ChangeHub {
    node_id: String,
    registry: Arc<SubscriberRegistry>,
    broadcaster: Broadcaster,
    relay: Option<Arc<DistributedRelay>>,
    cancel_token: CancellationToken,
    relay_queue_capacity: usize,
    relay_failures: Arc<AtomicU64>,
}

impl ChangeHub {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(SubscriberRegistry::new(config.channel_capacity));
        let broadcaster = Broadcaster::new(registry.clone());

        info!(
            node_id = %config.node_id,
            channel_capacity = registry.capacity(),
            "Change hub created"
        );

        Self {
            node_id: config.node_id,
            registry,
            broadcaster,
            relay: None,
            cancel_token: CancellationToken::new(),
            relay_queue_capacity: config.relay_queue_capacity,
            relay_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_relay(config: HubConfig, relay: Arc<DistributedRelay>) -> Self {
        let mut hub = Self::new(config);
        info!(node_id = %hub.node_id, topic = %relay.topic(), "Relay attached to hub");
        hub.relay = Some(relay);
        hub
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    #[must_use]
    pub const fn relay(&self) -> Option<&Arc<DistributedRelay>> {
        self.relay.as_ref()
    }

    /// Pump events from `source` until it ends, fails, or is cancelled.
    ///
    /// Each event is timestamped if needed, delivered locally, then queued
    /// for the relay. Relay publishing runs on its own task: a full queue or
    /// a failed publish is counted in [`HubStats::relay_failures`] and never
    /// delays the next local delivery. Queued events are flushed before this
    /// returns unless `cancel` fires.
    pub async fn run_source<S: ChangeSource>(
        &self,
        mut source: S,
        cancel: CancellationToken,
    ) -> SourceExit {
        let name = source.name().to_string();
        info!(source = %name, "Source pump started");

        let publisher = self.relay.as_ref().map(|relay| {
            RelayPublisher::spawn(
                relay.clone(),
                self.relay_queue_capacity,
                self.relay_failures.clone(),
                self.cancel_token.child_token(),
            )
        });

        let exit = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break SourceExit::Cancelled,
                () = self.cancel_token.cancelled() => break SourceExit::Cancelled,
                next = source.next_event() => next,
            };

            let mut event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(source = %name, error = %e, "Source failed");
                    break SourceExit::Failed(e.to_string());
                }
                None => break SourceExit::Ended,
            };

            event.backfill_timestamp(Utc::now());
            let event = Arc::new(event);
            self.broadcaster.publish(Arc::clone(&event));

            if let Some(publisher) = &publisher {
                publisher.enqueue(event);
            }
        };

        if let Some(publisher) = publisher {
            publisher.finish(&cancel).await;
        }

        info!(source = %name, exit = ?exit, "Source pump stopped");
        exit
    }

    /// Deliver events published by other instances to local subscribers.
    ///
    /// Fails immediately when no relay is attached or the first subscription
    /// cannot be made.
    pub async fn run_relay(&self, cancel: CancellationToken) -> Result<()> {
        let Some(relay) = &self.relay else {
            return Err(Error::Configuration("hub has no relay attached".to_string()));
        };

        let mut events = relay.subscribe_remote(cancel.clone()).await?;
        info!(node_id = %self.node_id, "Relay pump started");

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                () = self.cancel_token.cancelled() => break,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                debug!(node_id = %self.node_id, "Relay stream ended");
                break;
            };

            // Never handed back to the relay
            self.broadcaster.publish(event);
        }

        info!(node_id = %self.node_id, "Relay pump stopped");
        Ok(())
    }

    /// Create a session for one consumer bound to this hub
    pub fn open_session<S: EventSink>(&self, sink: S) -> StreamSession<S> {
        StreamSession::new(self.registry.clone(), sink)
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); sessions can derive
    /// their own tokens from it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Stop the pumps, close this hub's relay, and end every open session.
    /// A shared medium stays open for the other hubs using it.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "Shutting down change hub");
        self.cancel_token.cancel();

        if let Some(relay) = &self.relay {
            relay.close().await;
        }

        let removed = self.registry.clear();
        if removed > 0 {
            warn!(count = removed, "Open sessions closed by shutdown");
        }
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let stats = self.broadcaster.stats();
        HubStats {
            subscribers: self.registry.len(),
            published: stats.published(),
            delivered: stats.delivered(),
            dropped: stats.dropped(),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
        }
    }
}

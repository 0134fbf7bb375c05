use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use changefeed_core::metrics;
use changefeed_core::ChangeEvent;

use super::registry::{SubscriberRegistry, SubscriptionId};

/// Outcome of a single [`Broadcaster::publish`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers whose channel accepted the event
    pub delivered: usize,
    /// Subscribers whose channel was full
    pub dropped: usize,
    /// Subscribers whose reader had gone away; they are deregistered
    pub closed: usize,
}

/// Running totals for one broadcaster
#[derive(Debug, Default)]
pub struct BroadcastStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BroadcastStats {
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out of change events to every live subscription.
///
/// A full subscriber channel drops the event for that subscriber only; the
/// producer is never blocked and never sees an error. Any number of
/// producers may call [`publish`](Self::publish) concurrently.
///
/// Nothing is logged while the registry lock is held; per-subscriber drop
/// warnings are emitted after the pass, and only when a subscriber's drop
/// total reaches a power of two.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    stats: Arc<BroadcastStats>,
}

impl Broadcaster {
    #[must_use]
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(BroadcastStats::default()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stats(&self) -> &BroadcastStats {
        &self.stats
    }

    /// Deliver `event` to every subscription live at call time, stamping it
    /// with the current time first if it carries no timestamp
    pub fn publish(&self, event: impl Into<Arc<ChangeEvent>>) -> PublishReport {
        let mut event = event.into();
        if event.timestamp().is_none() {
            Arc::make_mut(&mut event).backfill_timestamp(Utc::now());
        }

        let mut report = PublishReport::default();
        let mut closed: Vec<SubscriptionId> = Vec::new();
        let mut full: Vec<(SubscriptionId, u64)> = Vec::new();

        self.registry.for_each_live(|id, sender, dropped| {
            match sender.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    full.push((id, total));
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    closed.push(id);
                }
            }
        });

        for (id, total) in full {
            if total.is_power_of_two() {
                warn!(
                    subscription_id = %id,
                    table = %event.table(),
                    operation = %event.operation(),
                    dropped_total = total,
                    "Subscriber channel full, dropping events"
                );
            } else {
                debug!(subscription_id = %id, dropped_total = total, "Subscriber channel full");
            }
        }

        // Readers that vanished without deregistering
        for id in closed {
            debug!(subscription_id = %id, "Subscriber channel closed, cleaning up");
            self.registry.deregister(id);
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        metrics::hub::EVENTS_PUBLISHED.inc();
        metrics::hub::EVENTS_DROPPED.inc_by(report.dropped as u64);

        if report.delivered > 0 {
            debug!(
                table = %event.table(),
                operation = %event.operation(),
                delivered = report.delivered,
                "Event broadcast complete"
            );
        }

        report
    }
}

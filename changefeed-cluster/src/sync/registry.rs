use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use changefeed_core::metrics;
use changefeed_core::ChangeEvent;

/// Per-subscriber queue capacity used when none is configured
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Write end of a subscription channel
pub type EventSender = mpsc::Sender<Arc<ChangeEvent>>;

/// Read end of a subscription channel
pub type EventReceiver = mpsc::Receiver<Arc<ChangeEvent>>;

/// Identity of one registered delivery channel, unique within a registry
/// and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Live subscriber as seen by a snapshot
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub sender: EventSender,
}

struct Slot {
    sender: EventSender,
    dropped: Arc<AtomicU64>,
}

/// Returned by [`SubscriberRegistry::register`]; owned by one session
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    receiver: EventReceiver,
    dropped: Arc<AtomicU64>,
}

impl SubscriptionHandle {
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Events dropped for this subscriber because its channel was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.receiver.try_recv().ok()
    }

    pub fn receiver_mut(&mut self) -> &mut EventReceiver {
        &mut self.receiver
    }
}

/// Set of live subscriptions for one hub.
///
/// Membership changes take the write lock. Delivery walks the set under the
/// read lock and only ever performs non-blocking sends, so once
/// [`deregister`](Self::deregister) returns no further event can reach the
/// removed channel.
pub struct SubscriberRegistry {
    slots: RwLock<BTreeMap<SubscriptionId, Slot>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create a bounded channel and add it to the live set
    pub fn register(&self) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let total = {
            let mut slots = self.slots.write();
            slots.insert(
                id,
                Slot {
                    sender: tx,
                    dropped: dropped.clone(),
                },
            );
            slots.len()
        };
        metrics::hub::ACTIVE_SUBSCRIPTIONS.inc();

        info!(subscription_id = %id, total_subscriptions = total, "Subscriber registered");

        SubscriptionHandle {
            id,
            receiver: rx,
            dropped,
        }
    }

    /// Remove a subscription and close its channel. Unknown ids are ignored.
    ///
    /// Returns true when a subscription was removed.
    pub fn deregister(&self, id: SubscriptionId) -> bool {
        let removed = self.slots.write().remove(&id);

        // The sender is dropped here, after the write lock is released,
        // which closes the channel for the reader.
        match removed {
            Some(slot) => {
                metrics::hub::ACTIVE_SUBSCRIPTIONS.dec();
                info!(
                    subscription_id = %id,
                    dropped = slot.dropped.load(Ordering::Relaxed),
                    "Subscriber deregistered"
                );
                drop(slot);
                true
            }
            None => {
                debug!(subscription_id = %id, "Subscriber already deregistered");
                false
            }
        }
    }

    /// Current write ends in registration order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.slots
            .read()
            .iter()
            .map(|(id, slot)| Subscriber {
                id: *id,
                sender: slot.sender.clone(),
            })
            .collect()
    }

    /// Visit every live subscription while holding the read lock.
    ///
    /// `visit` must not block: the lock is held for the whole pass.
    pub(crate) fn for_each_live<F>(&self, mut visit: F)
    where
        F: FnMut(SubscriptionId, &EventSender, &AtomicU64),
    {
        let slots = self.slots.read();
        for (id, slot) in slots.iter() {
            visit(*id, &slot.sender, &slot.dropped);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.slots.is_locked()
    }

    /// Drop count for a live subscription
    #[must_use]
    pub fn dropped(&self, id: SubscriptionId) -> Option<u64> {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.dropped.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.slots.read().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Remove every subscription, closing all channels
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(&mut *self.slots.write());
        let count = removed.len();
        if count > 0 {
            metrics::hub::ACTIVE_SUBSCRIPTIONS.sub(count as i64);
            info!(count = count, "All subscribers removed");
        }
        count
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_core::Row;

    fn event(table: &str) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent::insert(table, Row::new()).unwrap())
    }

    #[test]
    fn test_register_and_deregister() {
        let registry = SubscriberRegistry::default();
        let handle = registry.register();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(handle.id()));

        assert!(registry.deregister(handle.id()));
        assert!(registry.is_empty());
        assert!(!registry.contains(handle.id()));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = SubscriberRegistry::default();
        let handle = registry.register();

        assert!(registry.deregister(handle.id()));
        assert!(!registry.deregister(handle.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let registry = SubscriberRegistry::default();
        let first = registry.register();
        let second = registry.register();
        registry.deregister(first.id());
        let third = registry.register();

        assert_ne!(first.id(), second.id());
        assert_ne!(first.id(), third.id());
        assert!(second.id() < third.id());

        let ids: Vec<_> = registry.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id(), third.id()]);
    }

    #[tokio::test]
    async fn test_deregister_closes_channel() {
        let registry = SubscriberRegistry::default();
        let mut handle = registry.register();

        registry.deregister(handle.id());
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_senders_reach_subscriber() {
        let registry = SubscriberRegistry::new(4);
        let mut handle = registry.register();

        for subscriber in registry.snapshot() {
            subscriber.sender.try_send(event("t")).unwrap();
        }
        assert_eq!(handle.recv().await.unwrap().table(), "t");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let registry = SubscriberRegistry::new(0);
        assert_eq!(registry.capacity(), 1);
        let _handle = registry.register();
    }

    #[tokio::test]
    async fn test_clear_closes_every_channel() {
        let registry = SubscriberRegistry::default();
        let mut a = registry.register();
        let mut b = registry.register();

        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }
}

//! Notification subscriptions.
//!
//! Subscriptions are bucketed by the wire ID of the event they listen for.
//! Every subscriber receives its own freshly decoded copy of the event.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use vppapi_protocol::{Codec, Message};

/// Type-erased delivery target of one subscription.
trait NotificationSink: Send + Sync {
    fn deliver(&self, msg_id: u16, data: &[u8]);
}

struct TypedSink<E> {
    tx: mpsc::Sender<E>,
}

impl<E: Message + Default> NotificationSink for TypedSink<E> {
    fn deliver(&self, msg_id: u16, data: &[u8]) {
        let mut event = E::default();
        if let Err(e) = Codec::decode_msg(data, &mut event) {
            tracing::warn!("failed to decode notification {} (ID {}): {}", event.name(), msg_id, e);
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    "notification queue full, dropping {} (ID {})",
                    event.name(),
                    msg_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("notification receiver gone for ID {}", msg_id);
            }
        }
    }
}

struct Subscription {
    id: u64,
    sink: Box<dyn NotificationSink>,
}

/// Connection-owned table of subscriptions keyed by event wire ID.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    buckets: RwLock<HashMap<u16, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber for events with wire ID `msg_id`.
    pub fn subscribe<E: Message + Default>(
        self: &Arc<Self>,
        msg_id: u16,
        tx: mpsc::Sender<E>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let sink = TypedSink { tx };
        self.buckets
            .write()
            .entry(msg_id)
            .or_default()
            .push(Subscription {
                id,
                sink: Box::new(sink),
            });
        tracing::debug!("subscription {} added for message ID {}", id, msg_id);

        SubscriptionHandle {
            id,
            msg_id,
            table: Arc::downgrade(self),
        }
    }

    fn remove(&self, msg_id: u16, id: u64) -> bool {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(&msg_id) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|s| s.id != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            buckets.remove(&msg_id);
        }
        removed
    }

    /// Returns whether anyone listens for `msg_id`.
    pub fn contains(&self, msg_id: u16) -> bool {
        self.buckets.read().contains_key(&msg_id)
    }

    /// Hands a raw event to every subscriber of `msg_id`. Returns the number
    /// of subscribers it was offered to.
    pub fn dispatch(&self, msg_id: u16, data: &[u8]) -> usize {
        let buckets = self.buckets.read();
        let Some(bucket) = buckets.get(&msg_id) else {
            return 0;
        };
        for subscription in bucket {
            subscription.sink.deliver(msg_id, data);
        }
        bucket.len()
    }

    /// Removes every subscription, closing all delivery queues.
    pub fn clear(&self) {
        self.buckets.write().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.read().values().map(Vec::len).sum()
    }
}

/// Handle to an active subscription.
///
/// Dropping the handle keeps the subscription alive; call
/// [`unsubscribe`](Self::unsubscribe) to end it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    msg_id: u16,
    table: Weak<SubscriptionTable>,
}

impl SubscriptionHandle {
    /// Wire ID of the subscribed event.
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Removes the subscription and closes its delivery queue.
    ///
    /// Returns `false` if it was already gone (e.g. after a disconnect).
    pub fn unsubscribe(self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let removed = table.remove(self.msg_id, self.id);
        tracing::debug!(
            "subscription {} for message ID {} removed: {}",
            self.id,
            self.msg_id,
            removed
        );
        removed
    }
}

//! Change notification fan-out.
//!
//! Subscribers receive a [`ChangeEvent`] after every committed write, delete,
//! drop and sync import. Re-running queries in response is the subscriber's
//! business; this registry only delivers the events. Fan-out takes the
//! registry's own shard locks and never the worker, and a closed receiver
//! is simply pruned.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Something that changed in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeEvent {
    /// A document was inserted or replaced.
    Updated { collection: String, key: String },
    /// A document was removed; `expired` marks auto-delete sweeps.
    Deleted {
        collection: String,
        key: String,
        expired: bool,
    },
    /// A collection was dropped.
    Dropped { collection: String },
    /// A sync file was applied; any query may have new results.
    #[serde(rename_all = "camelCase")]
    SyncApplied {
        source_db: String,
        last_sequence: i64,
    },
}

impl ChangeEvent {
    /// The collection the event concerns, if it concerns only one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            ChangeEvent::Updated { collection, .. }
            | ChangeEvent::Deleted { collection, .. }
            | ChangeEvent::Dropped { collection } => Some(collection),
            ChangeEvent::SyncApplied { .. } => None,
        }
    }
}

type EventSender = mpsc::UnboundedSender<ChangeEvent>;

/// A live subscription. Dropping the receiver ends it.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Registry of active subscriptions.
///
/// Thread-safe; owned by one store instance.
#[derive(Debug, Default)]
pub struct Subscriptions {
    senders: DashMap<String, EventSender>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id.clone(), tx);

        tracing::debug!(subscription = %id, "Subscription registered");

        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.senders.remove(id).is_some();
        if removed {
            tracing::debug!(subscription = %id, "Subscription removed");
        }
        removed
    }

    /// Deliver an event to every subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut sent_count = 0;
        let mut closed = Vec::new();

        for entry in self.senders.iter() {
            if entry.value().send(event.clone()).is_ok() {
                sent_count += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            self.senders.remove(&id);
        }

        tracing::trace!(event = ?event, recipients = sent_count, "Published change");

        sent_count
    }

    /// Get the number of active subscriptions.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

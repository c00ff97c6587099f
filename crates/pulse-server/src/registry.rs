//! Registry of active subscribers.
//!
//! Owned exclusively by the hub's control loop, so it needs no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::subscription::SubscriberId;

/// Sender half of a subscriber's outbox. Payloads are shared between subscribers.
pub type Outbox = mpsc::Sender<Arc<str>>;

/// A registered subscriber.
#[derive(Debug)]
pub struct SubscriberEntry {
    /// The subscriber's connection.
    pub connection: Arc<Connection>,
    /// Queue drained by the subscriber's dispatch task.
    pub outbox: Outbox,
    /// When the subscriber was registered.
    pub registered_at: Instant,
    /// Number of events queued for this subscriber.
    pub events_sent: u64,
}

impl SubscriberEntry {
    /// Create a new entry.
    pub fn new(connection: Arc<Connection>, outbox: Outbox) -> Self {
        Self {
            connection,
            outbox,
            registered_at: Instant::now(),
            events_sent: 0,
        }
    }

    /// Get the subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.connection.id()
    }

    /// How long the subscriber has been registered.
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Increment the events sent counter.
    pub fn record_event(&mut self) {
        self.events_sent += 1;
    }
}

/// Mapping from subscriber ID to subscriber.
#[derive(Debug, Default)]
pub struct Registry {
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscriber, returning any previous entry with the same ID.
    pub fn insert(&mut self, entry: SubscriberEntry) -> Option<SubscriberEntry> {
        self.subscribers.insert(entry.id(), entry)
    }

    /// Remove a subscriber. Removing an absent ID is a no-op.
    pub fn remove(&mut self, id: SubscriberId) -> Option<SubscriberEntry> {
        self.subscribers.remove(&id)
    }

    /// Check whether a subscriber is registered.
    #[cfg(test)]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Iterate mutably over all subscribers, in no particular order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubscriberEntry> {
        self.subscribers.values_mut()
    }

    /// Remove and return all subscribers.
    pub fn drain(&mut self) -> impl Iterator<Item = SubscriberEntry> + '_ {
        self.subscribers.drain().map(|(_, entry)| entry)
    }
}

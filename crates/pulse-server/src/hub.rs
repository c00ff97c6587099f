//! Fan-out hub.
//!
//! The hub is the only owner of the subscriber [`Registry`]. Registrations,
//! removals and change events all arrive through channels and are processed
//! one at a time by [`Hub::run`], so the registry is never touched
//! concurrently.
//!
//! ```text
//! Listener ──events──┐
//!                    ▼
//! HubHandle ──cmds──► Hub ──outbox──► dispatch task ──► Connection
//!     ▲                                   │
//!     └──────────── unregister ───────────┘  (on write failure)
//! ```
//!
//! Each subscriber gets a bounded outbox drained by a single dispatch task,
//! so writes to one subscriber happen in hub order and never overlap, while
//! different subscribers are written to in parallel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use pulse_proto::ChangeEvent;

use crate::connection::Connection;
use crate::registry::{Registry, SubscriberEntry};
use crate::subscription::SubscriberId;

/// Sender for decoded change events, held by the listener.
pub type EventSender = mpsc::Sender<ChangeEvent>;

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the event queue between the listener and the hub.
    pub event_queue_capacity: usize,
    /// Events buffered per subscriber before it is evicted as too slow.
    pub outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1_024,
            outbox_capacity: 256,
        }
    }
}

/// Returned when the hub's control loop is no longer running.
#[derive(Debug, Error)]
#[error("hub is not running")]
pub struct HubStopped;

/// Control inputs to the hub.
#[derive(Debug)]
pub enum HubCommand {
    /// Add a subscriber.
    Register(Arc<Connection>),
    /// Remove a subscriber. Idempotent.
    Unregister(SubscriberId),
    /// Report the number of registered subscribers.
    SubscriberCount(oneshot::Sender<usize>),
}

/// Cloneable handle for talking to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Allocate a new subscriber ID.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a subscriber connection.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), HubStopped> {
        self.commands
            .send(HubCommand::Register(connection))
            .map_err(|_| HubStopped)
    }

    /// Unregister a subscriber. Unknown IDs and a stopped hub are ignored.
    pub fn unregister(&self, id: SubscriberId) {
        let _ = self.commands.send(HubCommand::Unregister(id));
    }

    /// Number of registered subscribers, or `None` if the hub has stopped.
    pub async fn subscriber_count(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(HubCommand::SubscriberCount(tx)).ok()?;
        rx.await.ok()
    }
}

/// The fan-out hub's control loop state.
pub struct Hub {
    registry: Registry,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    events: mpsc::Receiver<ChangeEvent>,
    /// Handed to dispatch tasks so they can funnel evictions back through the loop.
    handle: HubHandle,
    config: HubConfig,
}

impl Hub {
    /// Create a hub, a handle for registering subscribers, and the event sender
    /// for the listener.
    pub fn new(config: HubConfig) -> (Self, HubHandle, EventSender) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));

        let handle = HubHandle {
            commands: commands_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let hub = Self {
            registry: Registry::new(),
            commands: commands_rx,
            events: events_rx,
            handle: handle.clone(),
            config,
        };

        (hub, handle, events_tx)
    }

    /// Run the control loop until `shutdown` is cancelled.
    ///
    /// Commands are preferred over events when both are ready, so a pending
    /// eviction is applied before the next event is evaluated.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("fan-out hub started");
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.dispatch(&event),
                    None => {
                        events_open = false;
                        info!("event queue closed, no further change events will arrive");
                    }
                },
                else => break,
            }
        }

        let remaining = self.registry.len();
        for entry in self.registry.drain() {
            entry.connection.begin_closing();
        }
        info!(remaining, "fan-out hub stopped");
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(connection) => self.register(connection),
            HubCommand::Unregister(id) => {
                if let Some(entry) = self.registry.remove(id) {
                    entry.connection.begin_closing();
                    debug!(
                        subscriber_id = id,
                        events_sent = entry.events_sent,
                        age_secs = entry.age().as_secs(),
                        subscribers = self.registry.len(),
                        "subscriber removed"
                    );
                }
            }
            HubCommand::SubscriberCount(reply) => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    fn register(&mut self, connection: Arc<Connection>) {
        let id = connection.id();
        if connection.is_closing() {
            debug!(subscriber_id = id, "ignoring registration of closing subscriber");
            return;
        }

        let (outbox, rx) = mpsc::channel(self.config.outbox_capacity.max(1));
        tokio::spawn(dispatch_loop(connection.clone(), rx, self.handle.clone()));

        if let Some(previous) = self.registry.insert(SubscriberEntry::new(connection, outbox)) {
            warn!(subscriber_id = id, "replaced subscriber with duplicate id");
            previous.connection.begin_closing();
        }

        debug!(subscriber_id = id, subscribers = self.registry.len(), "subscriber registered");
    }

    /// Queue an event for every matching subscriber.
    fn dispatch(&mut self, event: &ChangeEvent) {
        let payload: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(table = %event.table, error = %e, "failed to encode change event");
                return;
            }
        };

        let mut evicted = Vec::new();
        let mut matched = 0usize;

        for entry in self.registry.iter_mut() {
            let id = entry.id();
            if entry.connection.is_closing() {
                evicted.push(id);
                continue;
            }
            if !entry.connection.filter().matches(event) {
                continue;
            }

            match entry.outbox.try_send(payload.clone()) {
                Ok(()) => {
                    entry.record_event();
                    matched += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber_id = id,
                        capacity = self.config.outbox_capacity,
                        "subscriber outbox full, evicting slow subscriber"
                    );
                    entry.connection.begin_closing();
                    evicted.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    entry.connection.begin_closing();
                    evicted.push(id);
                }
            }
        }

        for id in evicted {
            if let Some(entry) = self.registry.remove(id) {
                debug!(
                    subscriber_id = id,
                    events_sent = entry.events_sent,
                    "evicted closing subscriber"
                );
            }
        }

        trace!(
            operation = %event.operation,
            table = %event.table,
            row_id = ?event.row_id,
            matched,
            "dispatched change event"
        );
    }
}

/// Drain one subscriber's outbox into its connection, in order.
///
/// Stops at the first failed write; the subscriber is then marked closing
/// and its removal is requested through the hub.
async fn dispatch_loop(
    connection: Arc<Connection>,
    mut outbox: mpsc::Receiver<Arc<str>>,
    hub: HubHandle,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = connection.cancelled() => break,
            payload = outbox.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        if let Err(e) = connection.send(&payload).await {
            if connection.begin_closing() {
                warn!(subscriber_id = connection.id(), error = %e, "dispatch failed, evicting subscriber");
                hub.unregister(connection.id());
            }
            break;
        }
    }
}

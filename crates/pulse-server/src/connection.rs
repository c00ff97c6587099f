//! Subscriber connections.
//!
//! A [`Connection`] owns one transport, serializes writes to it through an
//! exclusive guard, and tracks whether the subscriber is closing. The
//! [`serve`] function drives a connection's whole lifetime: registration with
//! the hub, keepalive pings, and teardown once the peer goes away or a write
//! fails.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::hub::HubHandle;
use crate::subscription::{Filter, SubscriberId};

/// Reason sent with the close frame when the server ends a connection.
pub const CLOSE_REASON: &str = "server closing websocket";

/// Text frame sent right before the server closes a connection it evicted.
pub const CLOSING_NOTICE: &str = "closing";

/// Errors reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer already closed the connection.
    #[error("connection closed")]
    Closed,

    /// The write failed.
    #[error("transport error: {0}")]
    Io(String),
}

/// Errors delivering to a single subscriber. Never affects other subscribers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The subscriber is closing and must not be written to.
    #[error("subscriber is closing")]
    Closing,

    /// The write did not complete within the write deadline.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    /// The transport rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Write side of a duplex subscriber connection.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one text message.
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Send a lightweight liveness check.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection with a reason.
    async fn close(&mut self, reason: &str) -> Result<(), TransportError>;
}

/// Read side of a duplex subscriber connection, watched for control signals only.
#[async_trait]
pub trait ControlSignals: Send + 'static {
    /// Resolve once the peer has closed the connection or the read side failed.
    async fn closed(&mut self);
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// Deadline for a single write.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// One live subscriber connection.
pub struct Connection {
    id: SubscriberId,
    filter: Filter,
    /// Exclusive write guard; at most one write is in flight per connection.
    transport: Mutex<Box<dyn Transport>>,
    closing: AtomicBool,
    /// Cancelled when the connection starts closing or the server shuts down.
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl Connection {
    /// Create a new connection.
    pub fn new(
        id: SubscriberId,
        filter: Filter,
        transport: impl Transport,
        cancel: CancellationToken,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            filter,
            transport: Mutex::new(Box::new(transport)),
            closing: AtomicBool::new(false),
            cancel,
            write_timeout,
        }
    }

    /// Get the subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the subscriber's filter.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Check whether the connection is closing.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Mark the connection as closing.
    ///
    /// Returns `true` only for the caller that performed the transition, which
    /// makes that caller responsible for unregistering the subscriber.
    pub fn begin_closing(&self) -> bool {
        let transitioned = self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            self.cancel.cancel();
        }
        transitioned
    }

    /// Future that resolves once the connection is closing or the server shuts down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Send a text message to the subscriber.
    ///
    /// Does nothing and returns [`DispatchError::Closing`] once the connection
    /// is closing.
    pub async fn send(&self, text: &str) -> Result<(), DispatchError> {
        let mut transport = self.transport.lock().await;
        if self.is_closing() {
            return Err(DispatchError::Closing);
        }
        self.bounded(transport.send_text(text)).await
    }

    /// Send a keepalive ping.
    pub async fn ping(&self) -> Result<(), DispatchError> {
        let mut transport = self.transport.lock().await;
        if self.is_closing() {
            return Err(DispatchError::Closing);
        }
        self.bounded(transport.ping()).await
    }

    /// Apply the write deadline and cancellation to a single write.
    async fn bounded<F>(&self, write: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DispatchError::Closing),
            result = tokio::time::timeout(self.write_timeout, write) => match result {
                Ok(result) => result.map_err(DispatchError::from),
                Err(_) => Err(DispatchError::Timeout(self.write_timeout)),
            },
        }
    }

    /// Ping the subscriber every `interval` until the connection is cancelled.
    ///
    /// Returns `Ok(())` on cancellation and the ping error otherwise.
    pub async fn keepalive(&self, interval: Duration) -> Result<(), DispatchError> {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => match self.ping().await {
                    Ok(()) => {}
                    Err(DispatchError::Closing) => return Ok(()),
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Close the transport, best effort.
    ///
    /// With `notify` set, a [`CLOSING_NOTICE`] text frame goes out first.
    pub async fn close(&self, notify: bool) {
        let mut transport = self.transport.lock().await;

        if notify {
            if let Ok(Err(e)) =
                tokio::time::timeout(self.write_timeout, transport.send_text(CLOSING_NOTICE)).await
            {
                debug!(subscriber_id = self.id, error = %e, "failed to send closing notice");
            }
        }

        match tokio::time::timeout(self.write_timeout, transport.close(CLOSE_REASON)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(subscriber_id = self.id, error = %e, "failed to close transport"),
            Err(_) => debug!(subscriber_id = self.id, "timed out closing transport"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Why a connection's lifetime ended.
#[derive(Debug)]
enum Teardown {
    PeerClosed,
    Cancelled,
    KeepaliveFailed(DispatchError),
}

/// Drive one subscriber connection from registration to teardown.
///
/// Returns once the peer closes the connection, a keepalive ping fails, the
/// hub evicts the subscriber, or the server shuts down.
pub async fn serve<T, S>(
    hub: &HubHandle,
    filter: Filter,
    transport: T,
    mut signals: S,
    config: &ConnectionConfig,
    shutdown: &CancellationToken,
) where
    T: Transport,
    S: ControlSignals,
{
    let id = hub.next_subscriber_id();
    let connection = Arc::new(Connection::new(
        id,
        filter,
        transport,
        shutdown.child_token(),
        config.write_timeout,
    ));

    if hub.register(connection.clone()).is_err() {
        warn!(subscriber_id = id, "hub is not running, rejecting subscriber");
        connection.begin_closing();
        connection.close(true).await;
        return;
    }

    info!(subscriber_id = id, filter = %connection.filter(), "subscriber connected");

    let teardown = tokio::select! {
        _ = signals.closed() => Teardown::PeerClosed,
        result = connection.keepalive(config.keepalive_interval) => match result {
            Ok(()) => Teardown::Cancelled,
            Err(e) => Teardown::KeepaliveFailed(e),
        },
    };

    if let Teardown::KeepaliveFailed(e) = &teardown {
        warn!(subscriber_id = id, error = %e, "keepalive failed");
    }

    if connection.begin_closing() {
        hub.unregister(id);
    }
    connection
        .close(!matches!(teardown, Teardown::PeerClosed))
        .await;

    info!(subscriber_id = id, reason = ?teardown, "subscriber disconnected");
}

//! Change source listener.
//!
//! Holds the single subscription to the database's notification channel,
//! decodes each payload and forwards the resulting events to the hub in
//! stream order. Stream failures are retried after a fixed backoff; only
//! failures that retrying cannot fix end the listener with an error.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pulse_proto::{decode, ChangeEvent};

use crate::config::{DEFAULT_CHANNEL, DEFAULT_LISTENER_BACKOFF_MS};
use crate::error::{Error, Result};
use crate::hub::EventSender;

/// Errors from the notification stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying connection was lost; the subscription must be re-established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A failed wait on an otherwise healthy subscription.
    #[error("transient stream error: {0}")]
    Transient(String),

    /// The subscription can never succeed, e.g. a rejected LISTEN command.
    #[error("fatal stream error: {0}")]
    Fatal(String),
}

impl StreamError {
    /// Whether backing off and trying again can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StreamError::Fatal(_))
    }
}

/// A stream of raw change notification payloads.
#[async_trait]
pub trait ChangeSource: Send + 'static {
    /// (Re)establish the subscription to `channel`, replacing any previous one.
    async fn subscribe(&mut self, channel: &str) -> std::result::Result<(), StreamError>;

    /// Wait for the next raw payload.
    async fn next_payload(&mut self) -> std::result::Result<String, StreamError>;
}

/// PostgreSQL `LISTEN` based change source.
pub struct PgChangeSource {
    pool: PgPool,
    listener: Option<PgListener>,
}

impl PgChangeSource {
    /// Create a change source that takes its dedicated connection from `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            listener: None,
        }
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn subscribe(&mut self, channel: &str) -> std::result::Result<(), StreamError> {
        self.listener = None;
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(classify)?;
        listener.listen(channel).await.map_err(classify)?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn next_payload(&mut self) -> std::result::Result<String, StreamError> {
        let listener = self
            .listener
            .as_mut()
            .ok_or_else(|| StreamError::ConnectionLost("not subscribed".to_string()))?;

        let notification = listener.recv().await.map_err(classify)?;
        Ok(notification.payload().to_string())
    }
}

/// Sort a database error into retryable and fatal stream errors.
fn classify(err: sqlx::Error) -> StreamError {
    match &err {
        sqlx::Error::Configuration(_) | sqlx::Error::PoolClosed => {
            StreamError::Fatal(err.to_string())
        }
        // Class 42: syntax error or access rule violation.
        sqlx::Error::Database(db) if db.code().is_some_and(|code| code.starts_with("42")) => {
            StreamError::Fatal(err.to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut => StreamError::ConnectionLost(err.to_string()),
        _ => StreamError::Transient(err.to_string()),
    }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Notification channel to subscribe to.
    pub channel: String,
    /// Delay before retrying after a stream failure.
    pub backoff: Duration,
    /// How long to wait for room in the hub's event queue before dropping an event.
    pub delivery_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            backoff: Duration::from_millis(DEFAULT_LISTENER_BACKOFF_MS),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of handing one event to the hub.
enum Delivery {
    Delivered,
    Dropped,
    Stop,
}

/// Feeds decoded change events from a [`ChangeSource`] into the hub.
pub struct Listener<S> {
    source: S,
    events: EventSender,
    config: ListenerConfig,
}

impl<S: ChangeSource> Listener<S> {
    /// Create a listener.
    pub fn new(source: S, events: EventSender, config: ListenerConfig) -> Self {
        Self {
            source,
            events,
            config,
        }
    }

    /// Run until `shutdown` is cancelled or the hub goes away.
    ///
    /// Returns an error only for a stream failure that retrying cannot fix.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let channel = self.config.channel.clone();
        info!(channel = %channel, "change listener starting");
        let mut subscribed = false;

        loop {
            if !subscribed {
                let result = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    result = self.source.subscribe(&channel) => result,
                };

                match result {
                    Ok(()) => {
                        subscribed = true;
                        info!(channel = %channel, "listening for change notifications");
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            channel = %channel,
                            error = %e,
                            backoff_ms = self.config.backoff.as_millis() as u64,
                            "failed to subscribe, retrying"
                        );
                        if !backoff(self.config.backoff, &shutdown).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        error!(channel = %channel, error = %e, "cannot subscribe to change notifications");
                        return Err(Error::Stream(e));
                    }
                }
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.source.next_payload() => next,
            };

            match next {
                Ok(payload) => match decode(payload.as_bytes()) {
                    Ok(event) => match deliver(&self.events, &self.config, event, &shutdown).await {
                        Delivery::Delivered | Delivery::Dropped => {}
                        Delivery::Stop => break,
                    },
                    Err(e) => {
                        warn!(error = %e, payload_len = payload.len(), "discarding undecodable notification");
                    }
                },
                Err(e) if !e.is_retryable() => {
                    error!(channel = %channel, error = %e, "change notification stream failed");
                    return Err(Error::Stream(e));
                }
                Err(e) => {
                    if matches!(e, StreamError::ConnectionLost(_)) {
                        subscribed = false;
                    }
                    warn!(
                        channel = %channel,
                        error = %e,
                        resubscribe = !subscribed,
                        "change notification stream error"
                    );
                    if !backoff(self.config.backoff, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(channel = %channel, "change listener stopped");
        Ok(())
    }
}

/// Sleep for the backoff interval. Returns `false` if shutdown was requested.
async fn backoff(interval: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

async fn deliver(
    events: &EventSender,
    config: &ListenerConfig,
    event: ChangeEvent,
    shutdown: &CancellationToken,
) -> Delivery {
    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Delivery::Stop,
        result = events.send_timeout(event, config.delivery_timeout) => result,
    };

    match result {
        Ok(()) => Delivery::Delivered,
        Err(SendTimeoutError::Timeout(event)) => {
            warn!(
                operation = %event.operation,
                table = %event.table,
                timeout_ms = config.delivery_timeout.as_millis() as u64,
                "hub queue full, dropping change event"
            );
            Delivery::Dropped
        }
        Err(SendTimeoutError::Closed(_)) => {
            info!("hub is gone, stopping change listener");
            Delivery::Stop
        }
    }
}

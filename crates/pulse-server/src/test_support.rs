//! In-memory transports and change sources for unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::connection::{ControlSignals, Transport, TransportError};
use crate::listener::{ChangeSource, StreamError};

#[derive(Default)]
struct Recorded {
    sent: Mutex<Vec<String>>,
    close_reason: Mutex<Option<String>>,
    attempts: AtomicUsize,
    pings: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Transport that records everything written to it.
pub(crate) struct RecordingTransport {
    recorded: Arc<Recorded>,
    fail_after: Option<usize>,
    fail_pings: bool,
    delay: Option<Duration>,
}

/// Read access to what a [`RecordingTransport`] saw.
#[derive(Clone)]
pub(crate) struct TransportRecord {
    recorded: Arc<Recorded>,
}

impl RecordingTransport {
    pub(crate) fn new() -> (Self, TransportRecord) {
        let recorded = Arc::new(Recorded::default());
        let transport = Self {
            recorded: recorded.clone(),
            fail_after: None,
            fail_pings: false,
            delay: None,
        };
        (transport, TransportRecord { recorded })
    }

    /// Fail every text write after the first `n` succeed.
    pub(crate) fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub(crate) fn failing_pings(mut self) -> Self {
        self.fail_pings = true;
        self
    }

    /// Make every text write take `delay`.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        let attempt = self.recorded.attempts.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.recorded.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorded
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.recorded.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_after.is_some_and(|n| attempt >= n) {
            return Err(TransportError::Io("broken pipe".to_string()));
        }
        self.recorded.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.fail_pings {
            return Err(TransportError::Io("ping failed".to_string()));
        }
        self.recorded.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        *self.recorded.close_reason.lock().unwrap() = Some(reason.to_string());
        Ok(())
    }
}

impl TransportRecord {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.recorded.sent.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.recorded.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn pings(&self) -> usize {
        self.recorded.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.recorded.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.recorded.close_reason.lock().unwrap().clone()
    }
}

/// Control signals that report a peer close on demand.
pub(crate) struct ScriptedSignals {
    closed: Option<oneshot::Receiver<()>>,
}

/// Closes the peer side of a [`ScriptedSignals`]. Dropping it also counts as a close.
pub(crate) struct PeerHandle {
    tx: oneshot::Sender<()>,
}

impl ScriptedSignals {
    pub(crate) fn new() -> (Self, PeerHandle) {
        let (tx, rx) = oneshot::channel();
        (Self { closed: Some(rx) }, PeerHandle { tx })
    }
}

impl PeerHandle {
    pub(crate) fn close(self) {
        let _ = self.tx.send(());
    }
}

#[async_trait]
impl ControlSignals for ScriptedSignals {
    async fn closed(&mut self) {
        match self.closed.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// One step of a [`ScriptedSource`] script.
pub(crate) enum Step {
    Payload(String),
    Fail(StreamError),
}

/// Change source that replays a fixed script, then waits forever.
pub(crate) struct ScriptedSource {
    subscribe_results: VecDeque<Result<(), StreamError>>,
    steps: VecDeque<Step>,
    subscribes: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            subscribe_results: VecDeque::new(),
            steps: steps.into_iter().collect(),
            subscribes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Results returned by successive `subscribe` calls; `Ok` once exhausted.
    pub(crate) fn with_subscribe_results(
        mut self,
        results: impl IntoIterator<Item = Result<(), StreamError>>,
    ) -> Self {
        self.subscribe_results = results.into_iter().collect();
        self
    }

    pub(crate) fn subscribe_counter(&self) -> Arc<AtomicUsize> {
        self.subscribes.clone()
    }
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn subscribe(&mut self, _channel: &str) -> Result<(), StreamError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.subscribe_results.pop_front().unwrap_or(Ok(()))
    }

    async fn next_payload(&mut self) -> Result<String, StreamError> {
        match self.steps.pop_front() {
            Some(Step::Payload(payload)) => Ok(payload),
            Some(Step::Fail(err)) => Err(err),
            None => std::future::pending().await,
        }
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

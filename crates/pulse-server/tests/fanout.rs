//! End-to-end fan-out: listener → hub → subscriber connections, with
//! in-memory notification source and transports.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pulse_server::connection::{
    serve, ConnectionConfig, ControlSignals, Transport, TransportError, CLOSE_REASON,
    CLOSING_NOTICE,
};
use pulse_server::hub::{Hub, HubConfig, HubHandle};
use pulse_server::listener::{ChangeSource, Listener, ListenerConfig, StreamError};
use pulse_server::subscription::Filter;

/// Notification source fed by the test, one payload or stream failure at a time.
struct ChannelSource {
    payloads: mpsc::UnboundedReceiver<Result<String, StreamError>>,
    subscribes: Arc<AtomicUsize>,
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn subscribe(&mut self, _channel: &str) -> Result<(), StreamError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_payload(&mut self) -> Result<String, StreamError> {
        match self.payloads.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct Log {
    texts: Mutex<Vec<String>>,
    close_reason: Mutex<Option<String>>,
}

impl Log {
    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<Value> {
        self.texts()
            .iter()
            .filter(|t| t.as_str() != CLOSING_NOTICE)
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().unwrap().clone()
    }
}

struct LogTransport {
    log: Arc<Log>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LogTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Io("connection reset".to_string()));
        }
        self.log.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        *self.log.close_reason.lock().unwrap() = Some(reason.to_string());
        Ok(())
    }
}

struct PeerSignals(Option<oneshot::Receiver<()>>);

#[async_trait]
impl ControlSignals for PeerSignals {
    async fn closed(&mut self) {
        match self.0.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending().await,
        }
    }
}

struct Subscriber {
    log: Arc<Log>,
    broken: Arc<AtomicBool>,
    peer: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Subscriber {
    fn close_from_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            let _ = peer.send(());
        }
    }
}

struct Relay {
    hub: HubHandle,
    payloads: mpsc::UnboundedSender<Result<String, StreamError>>,
    subscribes: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    hub_task: JoinHandle<()>,
    listener_task: JoinHandle<pulse_server::Result<()>>,
}

impl Relay {
    fn start() -> Self {
        let shutdown = CancellationToken::new();
        let (hub, handle, events) = Hub::new(HubConfig::default());
        let hub_task = tokio::spawn(hub.run(shutdown.clone()));

        let (payloads, rx) = mpsc::unbounded_channel();
        let subscribes = Arc::new(AtomicUsize::new(0));
        let listener = Listener::new(
            ChannelSource {
                payloads: rx,
                subscribes: subscribes.clone(),
            },
            events,
            ListenerConfig::default(),
        );
        let listener_task = tokio::spawn(listener.run(shutdown.clone()));

        Self {
            hub: handle,
            payloads,
            subscribes,
            shutdown,
            hub_task,
            listener_task,
        }
    }

    fn subscribe(&self, table: Option<&str>, row: Option<&str>) -> Subscriber {
        let log = Arc::new(Log::default());
        let broken = Arc::new(AtomicBool::new(false));
        let (peer, peer_rx) = oneshot::channel();

        let transport = LogTransport {
            log: log.clone(),
            broken: broken.clone(),
        };
        let filter = Filter::from_segments(table, row);
        let hub = self.hub.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            serve(
                &hub,
                filter,
                transport,
                PeerSignals(Some(peer_rx)),
                &ConnectionConfig::default(),
                &shutdown,
            )
            .await
        });

        Subscriber {
            log,
            broken,
            peer: Some(peer),
            task,
        }
    }

    fn notify(&self, operation: &str, table: &str, id: i64) {
        let payload = json!({
            "operation": operation,
            "table": table,
            "data": {"id": id, "table": table},
        });
        self.payloads.send(Ok(payload.to_string())).unwrap();
    }

    fn send_raw(&self, payload: &str) {
        self.payloads.send(Ok(payload.to_string())).unwrap();
    }

    fn drop_stream(&self) {
        self.payloads
            .send(Err(StreamError::ConnectionLost("server closed the connection".to_string())))
            .unwrap();
    }

    async fn wait_for_subscribers(&self, n: usize) {
        wait_until(|| {
            let hub = self.hub.clone();
            async move { hub.subscriber_count().await == Some(n) }
        })
        .await;
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_events(subscriber: &Subscriber, n: usize) {
    wait_until(|| {
        let log = subscriber.log.clone();
        async move { log.events().len() >= n }
    })
    .await;
}

fn summary(events: &[Value]) -> Vec<(String, String, String)> {
    events
        .iter()
        .map(|e| {
            (
                e["operation"].as_str().unwrap().to_string(),
                e["table"].as_str().unwrap().to_string(),
                e["id"].as_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

fn row(operation: &str, table: &str, id: &str) -> (String, String, String) {
    (operation.to_string(), table.to_string(), id.to_string())
}

#[tokio::test]
async fn test_events_reach_matching_subscribers() {
    let relay = Relay::start();
    let all = relay.subscribe(None, None);
    let orders = relay.subscribe(Some("orders"), None);
    let order_42 = relay.subscribe(Some("orders"), Some("42"));
    relay.wait_for_subscribers(3).await;

    relay.notify("UPDATE", "orders", 42);
    relay.notify("INSERT", "invoices", 1);
    relay.notify("INSERT", "orders", 7);
    relay.notify("DELETE", "orders", 42);

    wait_for_events(&all, 4).await;
    wait_for_events(&orders, 3).await;
    wait_for_events(&order_42, 2).await;

    assert_eq!(
        summary(&all.log.events()),
        vec![
            row("update", "orders", "42"),
            row("insert", "invoices", "1"),
            row("insert", "orders", "7"),
            row("delete", "orders", "42"),
        ]
    );
    assert_eq!(
        summary(&orders.log.events()),
        vec![
            row("update", "orders", "42"),
            row("insert", "orders", "7"),
            row("delete", "orders", "42"),
        ]
    );
    assert_eq!(
        summary(&order_42.log.events()),
        vec![row("update", "orders", "42"), row("delete", "orders", "42")]
    );

    let first = &all.log.events()[0];
    assert_eq!(first["data"], json!({"id": 42, "table": "orders"}));

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_peer_close_removes_only_that_subscriber() {
    let relay = Relay::start();
    let mut leaving = relay.subscribe(Some("orders"), None);
    let staying = relay.subscribe(Some("orders"), None);
    relay.wait_for_subscribers(2).await;

    relay.notify("insert", "orders", 1);
    wait_for_events(&leaving, 1).await;

    leaving.close_from_peer();
    leaving.task.await.unwrap();
    relay.wait_for_subscribers(1).await;

    relay.notify("insert", "orders", 2);
    wait_for_events(&staying, 2).await;

    assert_eq!(leaving.log.events().len(), 1);
    assert!(!leaving.log.texts().contains(&CLOSING_NOTICE.to_string()));
    assert_eq!(leaving.log.close_reason().as_deref(), Some(CLOSE_REASON));

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_broken_subscriber_is_evicted_without_stalling_others() {
    let relay = Relay::start();
    let broken = relay.subscribe(None, None);
    let healthy = relay.subscribe(None, None);
    relay.wait_for_subscribers(2).await;

    relay.notify("insert", "orders", 1);
    wait_for_events(&broken, 1).await;

    broken.broken.store(true, Ordering::SeqCst);
    relay.notify("insert", "orders", 2);
    relay.wait_for_subscribers(1).await;
    broken.task.await.unwrap();

    relay.notify("insert", "orders", 3);
    wait_for_events(&healthy, 3).await;

    assert_eq!(broken.log.events().len(), 1);
    assert_eq!(broken.log.close_reason().as_deref(), Some(CLOSE_REASON));
    assert_eq!(
        summary(&healthy.log.events()),
        vec![
            row("insert", "orders", "1"),
            row("insert", "orders", "2"),
            row("insert", "orders", "3"),
        ]
    );

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_notifications_are_skipped() {
    let relay = Relay::start();
    let all = relay.subscribe(None, None);
    relay.wait_for_subscribers(1).await;

    relay.send_raw("{not json");
    relay.send_raw(&json!({"table": "orders", "data": {}}).to_string());
    relay.notify("insert", "orders", 5);

    wait_for_events(&all, 1).await;
    assert_eq!(summary(&all.log.events()), vec![row("insert", "orders", "5")]);

    relay.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_stream_outage_keeps_subscribers() {
    let relay = Relay::start();
    let all = relay.subscribe(None, None);
    let orders = relay.subscribe(Some("orders"), None);
    relay.wait_for_subscribers(2).await;

    relay.notify("insert", "orders", 1);
    wait_for_events(&all, 1).await;
    assert_eq!(relay.subscribes.load(Ordering::SeqCst), 1);

    let dropped_at = tokio::time::Instant::now();
    relay.drop_stream();
    relay.notify("update", "orders", 1);
    relay.notify("insert", "invoices", 2);
    relay.notify("delete", "orders", 1);

    wait_for_events(&all, 4).await;
    wait_for_events(&orders, 3).await;

    assert!(dropped_at.elapsed() >= ListenerConfig::default().backoff);
    assert_eq!(relay.subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(relay.hub.subscriber_count().await, Some(2));
    assert_eq!(
        summary(&all.log.events()),
        vec![
            row("insert", "orders", "1"),
            row("update", "orders", "1"),
            row("insert", "invoices", "2"),
            row("delete", "orders", "1"),
        ]
    );
    assert_eq!(
        summary(&orders.log.events()),
        vec![
            row("insert", "orders", "1"),
            row("update", "orders", "1"),
            row("delete", "orders", "1"),
        ]
    );
    assert!(all.log.close_reason().is_none());
    assert!(orders.log.close_reason().is_none());

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let relay = Relay::start();
    let subscribers = vec![
        relay.subscribe(None, None),
        relay.subscribe(Some("orders"), None),
        relay.subscribe(Some("orders"), Some("1")),
    ];
    relay.wait_for_subscribers(3).await;

    relay.shutdown.cancel();

    for subscriber in subscribers {
        subscriber.task.await.unwrap();
        assert_eq!(subscriber.log.close_reason().as_deref(), Some(CLOSE_REASON));
    }
    relay.hub_task.await.unwrap();
    assert!(relay.listener_task.await.unwrap().is_ok());
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use keel_core::{Interval, Price};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Combined-stream frame carrying a single kline update.
pub fn kline_frame(symbol: &str, interval: Interval, open_ms: i64, close: Price) -> String {
    let close_ms = open_ms + interval.as_duration().num_milliseconds() - 1;
    let topic = format!("{}@kline_{}", symbol.to_lowercase(), interval.to_binance());
    let close = close.normalize().to_string();
    json!({
        "stream": topic,
        "data": {
            "e": "kline",
            "E": open_ms,
            "s": symbol.to_uppercase(),
            "k": {
                "t": open_ms,
                "T": close_ms,
                "s": symbol.to_uppercase(),
                "i": interval.to_binance(),
                "o": close,
                "h": close,
                "l": close,
                "c": close,
                "v": "1",
                "x": false,
            }
        }
    })
    .to_string()
}

#[derive(Default)]
struct Connections {
    senders: Vec<Option<mpsc::UnboundedSender<Message>>>,
    subscriptions: Vec<Vec<String>>,
}

struct Shared {
    connections: StdMutex<Connections>,
    accepted: AtomicUsize,
    kill: watch::Sender<u64>,
}

impl Shared {
    fn connections(&self) -> std::sync::MutexGuard<'_, Connections> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, tx: mpsc::UnboundedSender<Message>) -> usize {
        let mut connections = self.connections();
        connections.senders.push(Some(tx));
        connections.subscriptions.push(Vec::new());
        self.accepted.fetch_add(1, Ordering::SeqCst);
        connections.senders.len() - 1
    }

    fn unregister(&self, index: usize) {
        if let Some(slot) = self.connections().senders.get_mut(index) {
            slot.take();
        }
    }
}

/// Local stand-in for a combined-stream endpoint.
///
/// Records the topics each connection subscribes to, acknowledges every
/// request, and lets tests push frames or sever all live connections.
pub struct MockStreamServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (kill, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            connections: StdMutex::new(Connections::default()),
            accepted: AtomicUsize::new(0),
            kill,
        });
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _peer)) => {
                                let shared = accept_shared.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = handle_socket(shared, stream).await {
                                        warn!(error = %err, "mock stream connection ended with error");
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "failed to accept websocket connection");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Connections accepted since spawn, including closed ones.
    pub fn connection_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Topics currently subscribed on the `index`-th accepted connection.
    pub fn subscriptions(&self, index: usize) -> Vec<String> {
        self.shared
            .connections()
            .subscriptions
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Polls until the `index`-th connection holds at least `count` topics.
    pub async fn wait_for_subscriptions(
        &self,
        index: usize,
        count: usize,
        timeout: Duration,
    ) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let topics = self.subscriptions(index);
            if topics.len() >= count || Instant::now() >= deadline {
                return topics;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Sends a raw frame to every live connection; returns how many got it.
    pub fn push(&self, frame: impl Into<String>) -> usize {
        let frame = frame.into();
        self.shared
            .connections()
            .senders
            .iter()
            .flatten()
            .filter(|tx| tx.send(Message::Text(frame.clone())).is_ok())
            .count()
    }

    /// Severs every live connection without a close handshake.
    pub fn drop_connections(&self) {
        self.shared.kill.send_modify(|generation| *generation += 1);
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.drop_connections();
        self.handle.abort();
    }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.drop_connections();
        self.handle.abort();
    }
}

async fn handle_socket(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
    let captured_path = Arc::new(StdMutex::new(String::new()));
    let path_clone = captured_path.clone();
    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if let Ok(mut path) = path_clone.lock() {
            *path = req.uri().path().to_string();
        }
        Ok(resp)
    })
    .await?;
    let path = captured_path
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_else(|_| "/".to_string());
    if path != "/stream" {
        warn!(path = %path, "received websocket connection for unknown path");
        return Ok(());
    }

    let mut kill = shared.kill.subscribe();
    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let index = shared.register(tx.clone());
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = kill.changed() => break Ok(()),
            msg = source.next() => match msg {
                None => break Ok(()),
                Some(Err(err)) => break Err(err.into()),
                Some(Ok(Message::Text(text))) => handle_command(&shared, index, &tx, &text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Ok(_)) => {}
            },
        }
    };
    shared.unregister(index);
    drop(tx);
    writer.abort();
    result
}

fn handle_command(
    shared: &Shared,
    index: usize,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!(frame = %text, "mock stream received malformed command");
        return;
    };
    let topics: Vec<String> = value
        .get("params")
        .and_then(Value::as_array)
        .map(|params| {
            params
                .iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    {
        let mut connections = shared.connections();
        let Some(subscribed) = connections.subscriptions.get_mut(index) else {
            return;
        };
        match value.get("method").and_then(Value::as_str) {
            Some("SUBSCRIBE") => {
                for topic in topics {
                    if !subscribed.contains(&topic) {
                        subscribed.push(topic);
                    }
                }
            }
            Some("UNSUBSCRIBE") => subscribed.retain(|topic| !topics.contains(topic)),
            _ => return,
        }
    }
    let ack = json!({ "result": Value::Null, "id": value.get("id") });
    let _ = tx.send(Message::Text(ack.to_string()));
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::ShutdownSignal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::TopicRegistry;
use crate::{
    NoopObserver, ResubscribeObserver, StreamConnector, StreamError, StreamProtocol,
    StreamResult, StreamSettings, StreamTransport,
};

enum Command {
    Send(String),
}

enum PumpExit {
    Shutdown,
    Failed(String),
}

struct Shared {
    settings: StreamSettings,
    connector: Arc<dyn StreamConnector>,
    protocol: Arc<dyn StreamProtocol>,
    observer: Arc<dyn ResubscribeObserver>,
    registry: TopicRegistry,
    shutdown: ShutdownSignal,
    connected: AtomicBool,
    request_id: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn dispatch(&self, frame: &str) {
        match self.protocol.route(frame) {
            Some(routed) => self.registry.deliver(&routed.topic, routed.payload),
            None => debug!(frame_len = frame.len(), "ignoring non-data frame"),
        }
    }
}

/// Owns one multiplexed market-data connection and its topic registry.
///
/// Consumers call [`bind`](Self::bind) to obtain a channel for a topic and
/// [`subscribe`](Self::subscribe) to ask the provider for it. A background
/// supervisor reads frames, routes them to consumers, and on any read failure
/// redials after a fixed backoff, indefinitely, replaying the whole registry
/// on every fresh connection.
///
/// Control frames issued while the connection is down are queued and sent
/// after the replay on the next connection, so a topic bound mid-reconnect
/// still reaches the provider.
pub struct StreamSubscriptionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl StreamSubscriptionManager {
    /// Dial the provider and start the supervisor.
    ///
    /// Failing to establish this first connection is reported to the caller;
    /// every later failure is handled by the supervisor.
    pub async fn connect(
        connector: Arc<dyn StreamConnector>,
        protocol: Arc<dyn StreamProtocol>,
        settings: StreamSettings,
    ) -> StreamResult<Self> {
        Self::connect_with_observer(connector, protocol, settings, Arc::new(NoopObserver)).await
    }

    pub async fn connect_with_observer(
        connector: Arc<dyn StreamConnector>,
        protocol: Arc<dyn StreamProtocol>,
        settings: StreamSettings,
        observer: Arc<dyn ResubscribeObserver>,
    ) -> StreamResult<Self> {
        let transport = connector.connect().await?;
        let shared = Arc::new(Shared {
            settings,
            connector,
            protocol,
            observer,
            registry: TopicRegistry::default(),
            shutdown: ShutdownSignal::new(),
            connected: AtomicBool::new(false),
            request_id: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(supervise(shared.clone(), transport, command_rx));
        info!("market data stream connected");
        Ok(Self {
            shared,
            commands: command_tx,
            supervisor: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Register a consumer for `topic`, replacing any previous consumer.
    ///
    /// Bound topics form the registry replayed after every reconnect.
    pub fn bind(&self, topic: &str) -> StreamResult<mpsc::Receiver<String>> {
        self.shared
            .registry
            .bind(topic, self.shared.settings.channel_capacity)
    }

    /// Send subscribe frames for `topics`, `batch_size` topics per frame and
    /// `batch_delay` between frames.
    pub async fn subscribe(&self, topics: &[String]) -> StreamResult<()> {
        self.send_batched(topics, |protocol, batch, id| {
            protocol.subscribe_frame(batch, id)
        })
        .await?;
        info!(count = topics.len(), "subscribed to stream topics");
        Ok(())
    }

    /// Drop the consumers for `topics` and ask the provider to stop sending them.
    pub async fn unsubscribe(&self, topics: &[String]) -> StreamResult<()> {
        for topic in topics {
            self.shared.registry.unbind(topic);
        }
        self.send_batched(topics, |protocol, batch, id| {
            protocol.unsubscribe_frame(batch, id)
        })
        .await
    }

    async fn send_batched<F>(&self, topics: &[String], build: F) -> StreamResult<()>
    where
        F: Fn(&dyn StreamProtocol, &[String], u64) -> String,
    {
        if self.shared.shutdown.triggered() {
            return Err(StreamError::Closed);
        }
        if !self.is_connected() {
            debug!(count = topics.len(), "stream reconnecting; queueing control frames");
        }
        let batch_size = self.shared.settings.batch_size.max(1);
        for (index, batch) in topics.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.shared.settings.batch_delay).await;
            }
            let frame = build(
                self.shared.protocol.as_ref(),
                batch,
                self.shared.next_request_id(),
            );
            self.commands
                .send(Command::Send(frame))
                .map_err(|_| StreamError::Closed)?;
        }
        Ok(())
    }

    /// Currently bound topics in lexical order.
    pub fn topics(&self) -> Vec<String> {
        self.shared.registry.topics()
    }

    pub fn is_bound(&self, topic: &str) -> bool {
        self.shared.registry.contains(topic)
    }

    /// Whether a connection is up and the registry has been replayed on it.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of successful reconnects since start.
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }

    /// Stop reconnecting, close the connection, and close every consumer
    /// channel. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.trigger();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "stream supervisor ended abnormally");
            }
        }
        let closed = self.shared.registry.close_all();
        info!(consumers = closed, "market data stream shut down");
    }
}

impl Drop for StreamSubscriptionManager {
    fn drop(&mut self) {
        self.shared.shutdown.trigger();
    }
}

async fn supervise(
    shared: Arc<Shared>,
    first: Box<dyn StreamTransport>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut next = Some(first);
    loop {
        // The first connection has nothing to replay: every subscribe issued
        // so far is still waiting in the command queue.
        let (mut transport, redialed) = match next.take() {
            Some(transport) => (transport, false),
            None => match redial(&shared).await {
                Some(transport) => (transport, true),
                None => break,
            },
        };

        // Queued commands are drained by the pump only after this replay.
        if redialed {
            if let Err(err) = replay_registry(&shared, transport.as_mut()).await {
                warn!(error = %err, "failed to replay subscriptions; reconnecting");
                transport.close().await;
                continue;
            }
        }
        shared.connected.store(true, Ordering::SeqCst);

        let exit = pump(&shared, transport.as_mut(), &mut commands).await;
        shared.connected.store(false, Ordering::SeqCst);
        transport.close().await;
        match exit {
            PumpExit::Shutdown => break,
            PumpExit::Failed(reason) => {
                warn!(
                    reason = %reason,
                    backoff_ms = shared.settings.reconnect_backoff.as_millis() as u64,
                    "market data stream disconnected"
                );
            }
        }
    }
    debug!("stream supervisor exited");
}

async fn pump(
    shared: &Shared,
    transport: &mut dyn StreamTransport,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> PumpExit {
    loop {
        tokio::select! {
            _ = shared.shutdown.wait() => return PumpExit::Shutdown,
            cmd = commands.recv() => match cmd {
                Some(Command::Send(frame)) => {
                    if let Err(err) = transport.send(frame).await {
                        return PumpExit::Failed(err.to_string());
                    }
                }
                None => return PumpExit::Shutdown,
            },
            frame = transport.recv() => match frame {
                Some(Ok(text)) => shared.dispatch(&text),
                Some(Err(err)) => return PumpExit::Failed(err.to_string()),
                None => return PumpExit::Failed("connection closed by peer".into()),
            },
        }
    }
}

/// Wait out the backoff and dial again until a connection is established or
/// shutdown is requested.
async fn redial(shared: &Shared) -> Option<Box<dyn StreamTransport>> {
    loop {
        if !shared.shutdown.sleep(shared.settings.reconnect_backoff).await {
            return None;
        }
        let attempt = tokio::select! {
            _ = shared.shutdown.wait() => return None,
            result = shared.connector.connect() => result,
        };
        match attempt {
            Ok(transport) => {
                let total = shared.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                info!(reconnects = total, "market data stream reconnected");
                return Some(transport);
            }
            Err(err) => warn!(error = %err, "market data reconnect failed; retrying"),
        }
    }
}

/// Re-issue subscribe frames for every bound topic on a fresh connection.
async fn replay_registry(shared: &Shared, transport: &mut dyn StreamTransport) -> StreamResult<()> {
    let topics = shared.registry.topics();
    if topics.is_empty() {
        return Ok(());
    }
    shared.observer.on_resubscribe(&topics);
    let batch_size = shared.settings.batch_size.max(1);
    for (index, batch) in topics.chunks(batch_size).enumerate() {
        if index > 0 && !shared.shutdown.sleep(shared.settings.batch_delay).await {
            return Err(StreamError::Closed);
        }
        let frame = shared
            .protocol
            .subscribe_frame(batch, shared.next_request_id());
        transport.send(frame).await?;
    }
    info!(count = topics.len(), "replayed stream subscriptions");
    Ok(())
}

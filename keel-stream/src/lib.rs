//! Multiplexed streaming subscriptions over a single duplex connection.
//!
//! [`StreamSubscriptionManager`] owns one connection, a registry of
//! topic→consumer bindings, and a supervisor task that reconnects after read
//! failures and replays every bound topic before the stream is reported live
//! again. Wire details are supplied by a [`StreamProtocol`]; dialing is
//! abstracted behind [`StreamConnector`] so the manager can run against an
//! in-memory transport in tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod manager;
mod registry;
pub mod ws;

pub use manager::StreamSubscriptionManager;
pub use ws::WsConnector;

/// Convenience alias for stream results.
pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream manager has shut down")]
    Closed,
}

/// A data frame split into the topic it belongs to and its raw payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedFrame {
    pub topic: String,
    pub payload: String,
}

/// Provider-specific framing of control and data messages.
pub trait StreamProtocol: Send + Sync + 'static {
    /// Build one subscribe control frame covering `topics`.
    fn subscribe_frame(&self, topics: &[String], request_id: u64) -> String;

    /// Build one unsubscribe control frame covering `topics`.
    fn unsubscribe_frame(&self, topics: &[String], request_id: u64) -> String;

    /// Extract the topic and payload of a data frame. Control acknowledgements
    /// and anything unrecognised return `None`.
    fn route(&self, frame: &str) -> Option<RoutedFrame>;
}

/// One established duplex connection.
#[async_trait]
pub trait StreamTransport: Send {
    async fn send(&mut self, frame: String) -> StreamResult<()>;

    /// Next text frame, or `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<StreamResult<String>>;

    async fn close(&mut self);
}

/// Dials new connections for the manager, initially and after failures.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self) -> StreamResult<Box<dyn StreamTransport>>;
}

/// Notified with the full topic registry right before it is replayed on a
/// fresh connection. Never called when the registry is empty.
pub trait ResubscribeObserver: Send + Sync + 'static {
    fn on_resubscribe(&self, topics: &[String]);
}

/// Observer that ignores every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ResubscribeObserver for NoopObserver {
    fn on_resubscribe(&self, _topics: &[String]) {}
}

/// Pacing and buffering knobs for a manager.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Maximum topics carried by one subscribe frame.
    pub batch_size: usize,
    /// Pause between consecutive subscribe frames.
    pub batch_delay: Duration,
    /// Fixed wait before each reconnect attempt.
    pub reconnect_backoff: Duration,
    /// Capacity of each consumer channel; frames beyond it are dropped.
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(3),
            channel_capacity: 100,
        }
    }
}

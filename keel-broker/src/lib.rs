//! Exchange-agnostic traits used by the rest of the workspace.
//!
//! Order placement and signing live behind [`ExchangeAdapter`]; historical
//! candle pulls live behind [`CandleSource`]. Both are consumed as opaque
//! collaborators and fail with [`ExchangeError`].

use async_trait::async_trait;
use keel_core::{
    AccountBalance, Candle, Interval, OrderId, PositionInfo, PositionSide, Price, Quantity,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for exchange results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Common error type returned by exchange adapters.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExchangeError {
    /// Represents transport-level failures (network, timeouts, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// Returned when authentication fails or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Returned when the request parameters are invalid for the target exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error (e.g., order rejected).
    #[error("exchange error: {0}")]
    Rejected(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Helper used by adapters when mapping any error type into an exchange error.
    pub fn from_display(err: impl std::fmt::Display, kind: ExchangeErrorKind) -> Self {
        match kind {
            ExchangeErrorKind::Transport => Self::Transport(err.to_string()),
            ExchangeErrorKind::Authentication => Self::Authentication(err.to_string()),
            ExchangeErrorKind::InvalidRequest => Self::InvalidRequest(err.to_string()),
            ExchangeErrorKind::Serialization => Self::Serialization(err.to_string()),
            ExchangeErrorKind::Rejected => Self::Rejected(err.to_string()),
            ExchangeErrorKind::Other => Self::Other(err.to_string()),
        }
    }
}

/// Enumerates the broad families of exchange errors.
#[derive(Debug, Clone, Copy)]
pub enum ExchangeErrorKind {
    Transport,
    Authentication,
    InvalidRequest,
    Serialization,
    Rejected,
    Other,
}

/// Acknowledgement returned after an order is accepted.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    /// Average fill price when the adapter knows it.
    #[serde(default)]
    pub avg_price: Option<Price>,
}

impl OrderAck {
    #[must_use]
    pub fn new(order_id: impl Into<OrderId>) -> Self {
        Self {
            order_id: order_id.into(),
            avg_price: None,
        }
    }
}

/// Order placement and account interface of a derivatives exchange.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Human-friendly name of the venue used for logging and fee lookups.
    fn name(&self) -> &str;

    /// Retrieve the current open positions.
    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>>;

    /// Retrieve the account balance summary.
    async fn balance(&self) -> ExchangeResult<AccountBalance>;

    async fn open_long(
        &self,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck>;

    async fn open_short(
        &self,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck>;

    async fn close_long(&self, symbol: &str, quantity: Quantity) -> ExchangeResult<OrderAck>;

    async fn close_short(&self, symbol: &str, quantity: Quantity) -> ExchangeResult<OrderAck>;

    /// Replace the protective stop for an open position.
    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()>;

    /// Replace the profit target for an open position.
    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()>;
}

/// Provides access to historical market data snapshots.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch the most recent `limit` candles, oldest first.
    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;
}

/// Helper trait used by adapters to (de)serialize exchange payloads.
pub trait PayloadExt: Sized {
    /// Deserialize JSON bytes into a strongly typed payload.
    fn from_json_bytes(bytes: &[u8]) -> ExchangeResult<Self>
    where
        Self: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|err| {
            ExchangeError::Serialization(format!("failed to deserialize payload: {err}"))
        })
    }
}

impl<T> PayloadExt for T where T: DeserializeOwned {}

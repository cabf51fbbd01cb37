//! Shared market-data state consumed by every trading account.
//!
//! [`MarketDataCache`] keeps the most recent candles per symbol/interval with
//! a freshness stamp and refuses to serve entries older than its staleness
//! threshold. [`KlineFeed`] keeps the cache current from a
//! [`keel_stream::StreamSubscriptionManager`].

use async_trait::async_trait;
use keel_broker::ExchangeError;
use keel_core::{Candle, Interval, Price};
use thiserror::Error;

mod cache;
mod feed;

pub use cache::{CacheKey, CacheSettings, EntryFreshness, MarketDataCache, SeedReport};
pub use feed::KlineFeed;

/// Convenience alias for market-data results.
pub type MarketDataResult<T> = Result<T, MarketDataError>;

/// Cached data for a key exceeded the freshness threshold.
///
/// Callers must skip the symbol for the current cycle instead of trading on it.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("market data for {symbol} {interval} is stale ({age_minutes:.1} minutes old)")]
pub struct StaleDataError {
    pub symbol: String,
    pub interval: Interval,
    pub age_minutes: f64,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum MarketDataError {
    #[error(transparent)]
    Stale(#[from] StaleDataError),
    #[error("candle pull failed: {0}")]
    Source(#[from] ExchangeError),
    #[error("no candles available for {symbol} {interval}")]
    Empty { symbol: String, interval: Interval },
}

/// Latest traded price lookup used when sizing and validating orders.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> MarketDataResult<Price>;
}

/// Asked by the cache to start streaming a key it just pulled on a miss.
#[async_trait]
pub trait SubscriptionRequester: Send + Sync {
    async fn ensure_subscribed(&self, symbol: &str, interval: Interval);
}

/// Provider-specific topic naming and payload decoding for candle streams.
pub trait KlineCodec: Send + Sync + 'static {
    fn topic(&self, symbol: &str, interval: Interval) -> String;

    /// Decode one routed payload. `None` for payloads that are not candles.
    fn decode(&self, payload: &str) -> Option<Candle>;
}

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_broker::{CandleSource, ExchangeError, ExchangeResult};
use keel_core::{Candle, Interval, Price};
use keel_markets::{MarketDataError, MarketDataResult, PriceSource};
use rust_decimal::Decimal;

/// `count` flat candles ending at the most recent interval boundary, all
/// closing at `close`.
pub fn candle_series(symbol: &str, interval: Interval, count: usize, close: Price) -> Vec<Candle> {
    let step = interval.as_duration();
    let step_ms = step.num_milliseconds().max(1);
    let now_ms = Utc::now().timestamp_millis();
    let last_open = now_ms - now_ms % step_ms;
    (0..count)
        .map(|i| {
            let open_ms = last_open - step_ms * (count - 1 - i) as i64;
            let open_time = DateTime::<Utc>::from_timestamp_millis(open_ms).unwrap_or_else(Utc::now);
            Candle {
                symbol: symbol.to_string(),
                interval,
                open_time,
                close_time: open_time + step,
                open: close,
                high: close,
                low: close,
                close,
                volume: Decimal::ONE,
            }
        })
        .collect()
}

/// [`CandleSource`] serving flat series at per-symbol prices.
#[derive(Clone, Default)]
pub struct StaticCandles {
    prices: Arc<Mutex<HashMap<String, Price>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    pulls: Arc<AtomicUsize>,
}

impl StaticCandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: &str, price: Price) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn set_price(&self, symbol: &str, price: Price) {
        self.prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), price);
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string());
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandleSource for StaticCandles {
    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(symbol)
        {
            return Err(ExchangeError::Transport(format!("pull failed for {symbol}")));
        }
        let price = self
            .prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidRequest(format!("unknown symbol {symbol}")))?;
        Ok(candle_series(symbol, interval, limit, price))
    }
}

/// [`PriceSource`] backed by a fixed table.
#[derive(Clone, Default)]
pub struct FixedPrices {
    prices: Arc<Mutex<HashMap<String, Price>>>,
}

impl FixedPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, symbol: &str, price: Price) -> Self {
        self.set(symbol, price);
        self
    }

    pub fn set(&self, symbol: &str, price: Price) {
        self.prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl PriceSource for FixedPrices {
    async fn latest_price(&self, symbol: &str) -> MarketDataResult<Price> {
        self.prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketDataError::Empty {
                symbol: symbol.to_string(),
                interval: Interval::ThreeMinutes,
            })
    }
}

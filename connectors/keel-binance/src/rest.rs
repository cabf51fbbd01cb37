use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use keel_broker::{CandleSource, ExchangeError, ExchangeResult};
use keel_core::{Candle, Interval};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::stream::timestamp_from_ms;

/// Pulls historical klines from `/fapi/v1/klines`.
#[derive(Clone)]
pub struct BinanceKlineClient {
    rest_url: String,
    http: Client,
}

impl BinanceKlineClient {
    pub fn new(rest_url: impl Into<String>) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ExchangeError::Other(err.to_string()))?;
        Ok(Self {
            rest_url: rest_url.into(),
            http,
        })
    }
}

#[async_trait]
impl CandleSource for BinanceKlineClient {
    async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let symbol = symbol.trim().to_uppercase();
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.rest_url.trim_end_matches('/'),
            symbol,
            interval.to_binance(),
            limit.clamp(1, 1500)
        );
        let rows = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ExchangeError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| ExchangeError::Transport(err.to_string()))?
            .json::<Vec<Vec<Value>>>()
            .await
            .map_err(|err| ExchangeError::Serialization(err.to_string()))?;
        rows.iter()
            .map(|row| parse_row(&symbol, interval, row))
            .collect()
    }
}

/// `[open_time, open, high, low, close, volume, close_time, ...]`
fn parse_row(symbol: &str, interval: Interval, row: &[Value]) -> ExchangeResult<Candle> {
    let invalid = || ExchangeError::Serialization(format!("malformed kline row for {symbol}"));
    let millis = |idx: usize| {
        row.get(idx)
            .and_then(Value::as_i64)
            .and_then(timestamp_from_ms)
            .ok_or_else(invalid)
    };
    let decimal = |idx: usize| {
        row.get(idx)
            .and_then(Value::as_str)
            .and_then(|raw| Decimal::from_str(raw).ok())
            .ok_or_else(invalid)
    };
    Ok(Candle {
        symbol: symbol.to_string(),
        interval,
        open_time: millis(0)?,
        close_time: millis(6)?,
        open: decimal(1)?,
        high: decimal(2)?,
        low: decimal(3)?,
        close: decimal(4)?,
        volume: decimal(5)?,
    })
}

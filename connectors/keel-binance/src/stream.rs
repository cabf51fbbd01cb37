use std::str::FromStr;

use chrono::{DateTime, Utc};
use keel_core::{Candle, Interval};
use keel_markets::KlineCodec;
use keel_stream::{RoutedFrame, StreamProtocol};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Topic for a symbol's kline stream, e.g. `btcusdt@kline_3m`.
pub fn kline_topic(symbol: &str, interval: Interval) -> String {
    format!(
        "{}@kline_{}",
        symbol.trim().to_lowercase(),
        interval.to_binance()
    )
}

/// Framing for `/stream` combined connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinanceCombinedProtocol;

impl StreamProtocol for BinanceCombinedProtocol {
    fn subscribe_frame(&self, topics: &[String], request_id: u64) -> String {
        json!({
            "method": "SUBSCRIBE",
            "params": topics,
            "id": request_id,
        })
        .to_string()
    }

    fn unsubscribe_frame(&self, topics: &[String], request_id: u64) -> String {
        json!({
            "method": "UNSUBSCRIBE",
            "params": topics,
            "id": request_id,
        })
        .to_string()
    }

    fn route(&self, frame: &str) -> Option<RoutedFrame> {
        let value: Value = serde_json::from_str(frame).ok()?;
        let Some(topic) = value.get("stream").and_then(Value::as_str) else {
            if value.get("result").is_some() {
                debug!(id = ?value.get("id"), "subscription acknowledged");
            }
            return None;
        };
        let payload = value.get("data")?;
        Some(RoutedFrame {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct KlineEvent {
    k: KlinePayload,
}

#[derive(Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
}

/// Topic naming and `kline` event decoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinanceKlineCodec;

impl KlineCodec for BinanceKlineCodec {
    fn topic(&self, symbol: &str, interval: Interval) -> String {
        kline_topic(symbol, interval)
    }

    fn decode(&self, payload: &str) -> Option<Candle> {
        let event: KlineEvent = serde_json::from_str(payload).ok()?;
        convert_kline(event.k)
    }
}

fn convert_kline(kline: KlinePayload) -> Option<Candle> {
    Some(Candle {
        symbol: kline.symbol.to_uppercase(),
        interval: Interval::from_str(&kline.interval).ok()?,
        open_time: timestamp_from_ms(kline.open_time)?,
        close_time: timestamp_from_ms(kline.close_time)?,
        open: Decimal::from_str(&kline.open).ok()?,
        high: Decimal::from_str(&kline.high).ok()?,
        low: Decimal::from_str(&kline.low).ok()?,
        close: Decimal::from_str(&kline.close).ok()?,
        volume: Decimal::from_str(&kline.volume).unwrap_or(Decimal::ZERO),
    })
}

pub(crate) fn timestamp_from_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLINE_FRAME: &str = r#"{"stream":"btcusdt@kline_3m","data":{"e":"kline","E":1700000001000,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000179999,"s":"BTCUSDT","i":"3m","f":1,"L":2,"o":"50000.1","c":"50100.5","h":"50200","l":"49900","v":"12.5","n":10,"x":false,"q":"0","V":"0","Q":"0","B":"0"}}}"#;

    #[test]
    fn subscribe_frame_lists_topics() {
        let frame = BinanceCombinedProtocol.subscribe_frame(
            &["btcusdt@kline_3m".to_string(), "ethusdt@kline_4h".to_string()],
            7,
        );
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        assert_eq!(value["params"][1], "ethusdt@kline_4h");
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn combined_frame_routes_and_decodes() {
        let routed = BinanceCombinedProtocol.route(KLINE_FRAME).unwrap();
        assert_eq!(routed.topic, "btcusdt@kline_3m");

        let candle = BinanceKlineCodec.decode(&routed.payload).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.interval, Interval::ThreeMinutes);
        assert_eq!(candle.close, Decimal::from_str("50100.5").unwrap());
        assert_eq!(candle.open_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn acknowledgements_are_not_routed() {
        assert!(BinanceCombinedProtocol
            .route(r#"{"result":null,"id":3}"#)
            .is_none());
        assert!(BinanceCombinedProtocol.route("not json").is_none());
    }

    #[test]
    fn topic_is_lowercase_symbol_and_interval() {
        assert_eq!(kline_topic("BTCUSDT", Interval::FourHours), "btcusdt@kline_4h");
    }
}

//! Binance USDⓈ-M futures market data: combined-stream framing, kline
//! decoding, and the REST kline endpoint.

mod rest;
mod stream;

pub use rest::BinanceKlineClient;
pub use stream::{kline_topic, BinanceCombinedProtocol, BinanceKlineCodec};

/// Public combined-stream endpoint for USDⓈ-M futures.
pub const COMBINED_STREAM_URL: &str = "wss://fstream.binance.com/stream";
/// Public REST endpoint for USDⓈ-M futures.
pub const REST_URL: &str = "https://fapi.binance.com";

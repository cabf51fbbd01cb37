//! Utilities for standing up mock collaborators that exercise keel end-to-end flows.

pub mod advisor;
pub mod exchange;
pub mod market;
pub mod websocket;

pub use advisor::{RecordedPrompt, ScriptedAdvisor};
pub use exchange::{ExchangeCall, MockExchange, Operation};
pub use market::{candle_series, FixedPrices, StaticCandles};
pub use websocket::{kline_frame, MockStreamServer};

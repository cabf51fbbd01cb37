//! Keel aggregate crate that re-exports the main components for downstream users.

pub use keel_advisor as advisor;
pub use keel_binance as binance;
pub use keel_broker as broker;
pub use keel_config as config;
pub use keel_core as core;
pub use keel_execution as execution;
pub use keel_journal as journal;
pub use keel_markets as markets;
pub use keel_paper as paper;
pub use keel_portfolio as portfolio;
pub use keel_stream as stream;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use keel_advisor::{parse_decisions, Advisor, AdvisorError, RetryPolicy, RetryingAdvisor};
    pub use keel_broker::{CandleSource, ExchangeAdapter, ExchangeError, ExchangeResult, OrderAck};
    pub use keel_config::{load_config, AppConfig};
    pub use keel_core::*;
    pub use keel_execution::{DecisionExecutor, ExecutionConfig};
    pub use keel_journal::{analyze_performance, CycleRecord, DecisionJournal, PerformanceAnalysis};
    pub use keel_markets::{CacheSettings, KlineFeed, MarketDataCache, PriceSource};
    pub use keel_paper::{PaperConfig, PaperExchange};
    pub use keel_portfolio::{DrawdownConfig, DrawdownGuard, PositionTracker};
    pub use keel_stream::{StreamSettings, StreamSubscriptionManager};
}

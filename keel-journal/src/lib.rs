//! Decision-cycle persistence for live traders.
//!
//! Every cycle appends one [`CycleRecord`]. [`JsonlJournal`] writes them as
//! JSON lines, one file per trader, and [`analyze_performance`] rebuilds
//! round-trip trades from the recorded actions.

mod analysis;
mod store;

use chrono::{DateTime, Utc};
use keel_core::{DecisionAction, PositionInfo};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use analysis::{analyze_performance, taker_fee_rate, PerformanceAnalysis, TradeOutcome};
pub use store::{read_records, DecisionJournal, JsonlJournal, MemoryJournal};

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Account figures captured at the start of a cycle.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub position_count: usize,
    pub margin_used_pct: Decimal,
}

/// Everything one decision cycle saw and did.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CycleRecord {
    pub trader_id: String,
    #[serde(default)]
    pub exchange: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user_prompt: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default)]
    pub account: Option<AccountSnapshot>,
    #[serde(default)]
    pub positions: Vec<PositionInfo>,
    #[serde(default)]
    pub decisions: Vec<DecisionAction>,
}

impl CycleRecord {
    /// Empty, successful record for `cycle_number`; callers fill it in.
    #[must_use]
    pub fn new(trader_id: impl Into<String>, exchange: impl Into<String>, cycle_number: u64) -> Self {
        Self {
            trader_id: trader_id.into(),
            exchange: exchange.into(),
            cycle_number,
            timestamp: Utc::now(),
            success: true,
            error: None,
            user_prompt: String::new(),
            reasoning: String::new(),
            raw_response: String::new(),
            account: None,
            positions: Vec::new(),
            decisions: Vec::new(),
        }
    }

    /// Mark the cycle failed with `error`.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }
}

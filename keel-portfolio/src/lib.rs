//! Per-account position lifecycle bookkeeping.
//!
//! Both [`PositionTracker`] and [`DrawdownGuard`] are owned by a single
//! trading account and mutated only from that account's cycle, so neither
//! carries internal locking.

mod drawdown;
mod tracker;

pub use drawdown::{DrawdownConfig, DrawdownGuard, DrawdownVerdict, PeakPnlCache};
pub use tracker::{generate_auto_close_actions, infer_close_details, PositionTracker};

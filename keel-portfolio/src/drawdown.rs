use std::collections::HashMap;

use chrono::Utc;
use keel_broker::ExchangeAdapter;
use keel_core::{ActionKind, DecisionAction, PositionInfo, PositionSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Highest profit percentage seen per open position key.
#[derive(Clone, Debug, Default)]
pub struct PeakPnlCache {
    peaks: HashMap<String, Decimal>,
}

impl PeakPnlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stored peak for `key` if `pnl_pct` is higher; returns the peak.
    pub fn update(&mut self, key: &str, pnl_pct: Decimal) -> Decimal {
        let peak = self.peaks.entry(key.to_string()).or_insert(pnl_pct);
        if pnl_pct > *peak {
            *peak = pnl_pct;
        }
        *peak
    }

    pub fn get(&self, key: &str) -> Option<Decimal> {
        self.peaks.get(key).copied()
    }

    /// Forget `key`; returns whether a peak was stored.
    pub fn clear(&mut self, key: &str) -> bool {
        self.peaks.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, Decimal> {
        self.peaks.clone()
    }
}

/// Thresholds for the trailing-drawdown close.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DrawdownConfig {
    /// Minimum current profit percentage before the guard may act.
    pub min_profit_pct: Decimal,
    /// Retracement from peak, as a percentage of the peak, that forces a close.
    pub max_drawback_pct: Decimal,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            min_profit_pct: Decimal::from(5),
            max_drawback_pct: Decimal::from(40),
        }
    }
}

/// Outcome of evaluating one position against its peak.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawdownVerdict {
    pub key: String,
    pub current_pct: Decimal,
    pub peak_pct: Decimal,
    pub drawback_pct: Decimal,
    pub triggered: bool,
}

/// Closes positions whose profit has given back too much of its peak.
#[derive(Clone, Debug, Default)]
pub struct DrawdownGuard {
    config: DrawdownConfig,
    peaks: PeakPnlCache,
}

impl DrawdownGuard {
    pub fn new(config: DrawdownConfig) -> Self {
        Self {
            config,
            peaks: PeakPnlCache::new(),
        }
    }

    pub fn config(&self) -> DrawdownConfig {
        self.config
    }

    pub fn peaks(&self) -> &PeakPnlCache {
        &self.peaks
    }

    pub fn peaks_mut(&mut self) -> &mut PeakPnlCache {
        &mut self.peaks
    }

    /// Raise the peak for `position`, then decide whether it must be closed.
    pub fn evaluate(&mut self, position: &PositionInfo) -> DrawdownVerdict {
        let key = position.key();
        let current_pct = position.unrealized_pnl_pct();
        let peak_pct = self.peaks.update(&key, current_pct);
        let drawback_pct = if peak_pct > Decimal::ZERO {
            (peak_pct - current_pct) / peak_pct * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let triggered = current_pct >= self.config.min_profit_pct
            && drawback_pct >= self.config.max_drawback_pct;
        DrawdownVerdict {
            key,
            current_pct,
            peak_pct,
            drawback_pct,
            triggered,
        }
    }

    /// Evaluate every open position and close the ones that retraced too far.
    ///
    /// A failed position fetch is logged and yields no actions. A successful
    /// close clears the position's peak; a failed one keeps it so the next
    /// pass can retry against the same reference.
    pub async fn check(&mut self, exchange: &dyn ExchangeAdapter) -> Vec<DecisionAction> {
        let positions = match exchange.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(exchange = exchange.name(), error = %err, "drawdown check skipped: positions unavailable");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        for position in positions {
            let verdict = self.evaluate(&position);
            debug!(
                key = %verdict.key,
                current_pct = %verdict.current_pct.round_dp(2),
                peak_pct = %verdict.peak_pct.round_dp(2),
                drawback_pct = %verdict.drawback_pct.round_dp(2),
                "drawdown evaluated"
            );
            if !verdict.triggered {
                continue;
            }
            actions.push(self.close(exchange, &position, &verdict).await);
        }
        actions
    }

    async fn close(
        &mut self,
        exchange: &dyn ExchangeAdapter,
        position: &PositionInfo,
        verdict: &DrawdownVerdict,
    ) -> DecisionAction {
        info!(
            key = %verdict.key,
            current_pct = %verdict.current_pct.round_dp(2),
            peak_pct = %verdict.peak_pct.round_dp(2),
            drawback_pct = %verdict.drawback_pct.round_dp(2),
            "drawdown threshold reached, closing position"
        );
        let result = match position.side {
            PositionSide::Long => exchange.close_long(&position.symbol, position.quantity).await,
            PositionSide::Short => exchange.close_short(&position.symbol, position.quantity).await,
        };
        let mut action = DecisionAction {
            action: match position.side {
                PositionSide::Long => ActionKind::CloseLong,
                PositionSide::Short => ActionKind::CloseShort,
            },
            symbol: position.symbol.clone(),
            side: Some(position.side),
            quantity: position.quantity,
            leverage: position.leverage,
            price: position.mark_price,
            success: false,
            error: None,
            order_id: None,
            reason: Some(format!(
                "drawdown {}% from peak {}%",
                verdict.drawback_pct.round_dp(2),
                verdict.peak_pct.round_dp(2)
            )),
            timestamp: Utc::now(),
        };
        match result {
            Ok(ack) => {
                self.peaks.clear(&verdict.key);
                action.success = true;
                action.price = ack.avg_price.unwrap_or(position.mark_price);
                action.order_id = Some(ack.order_id);
            }
            Err(err) => {
                error!(key = %verdict.key, error = %err, "drawdown close failed, keeping peak");
                action.error = Some(err.to_string());
            }
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(mark: i64) -> PositionInfo {
        PositionInfo {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            entry_price: Decimal::from(50_000),
            mark_price: Decimal::from(mark),
            quantity: Decimal::new(1, 1),
            leverage: 10,
            stop_loss: None,
            take_profit: None,
            liquidation_price: None,
        }
    }

    #[test]
    fn peak_is_monotonic_until_cleared() {
        let mut cache = PeakPnlCache::new();
        assert_eq!(cache.update("BTCUSDT_long", Decimal::new(105, 1)), Decimal::new(105, 1));
        assert_eq!(cache.update("BTCUSDT_long", Decimal::from(15)), Decimal::from(15));
        assert_eq!(cache.update("BTCUSDT_long", Decimal::from(12)), Decimal::from(15));
        assert!(cache.clear("BTCUSDT_long"));
        assert!(!cache.clear("BTCUSDT_long"));
        assert_eq!(cache.get("BTCUSDT_long"), None);
    }

    #[test]
    fn forty_percent_retrace_from_ten_triggers() {
        let mut guard = DrawdownGuard::default();
        guard.peaks_mut().update("BTCUSDT_long", Decimal::from(10));
        // pnl 30 on 500 margin = 6%
        let verdict = guard.evaluate(&long(50_300));
        assert_eq!(verdict.current_pct, Decimal::from(6));
        assert_eq!(verdict.drawback_pct, Decimal::from(40));
        assert!(verdict.triggered);
    }

    #[test]
    fn thirty_six_percent_retrace_does_not_trigger() {
        let mut guard = DrawdownGuard::default();
        guard.peaks_mut().update("BTCUSDT_long", Decimal::from(10));
        let verdict = guard.evaluate(&long(50_320));
        assert_eq!(verdict.current_pct, Decimal::new(64, 1));
        assert!(!verdict.triggered);
        assert_eq!(guard.peaks().get("BTCUSDT_long"), Some(Decimal::from(10)));
    }

    #[test]
    fn small_profit_never_triggers() {
        let mut guard = DrawdownGuard::default();
        guard.peaks_mut().update("BTCUSDT_long", Decimal::from(10));
        // 0.3% profit, 97% below peak
        let verdict = guard.evaluate(&long(50_015));
        assert!(!verdict.triggered);
    }

    #[test]
    fn first_observation_seeds_peak() {
        let mut guard = DrawdownGuard::default();
        let verdict = guard.evaluate(&long(50_400));
        assert_eq!(verdict.peak_pct, Decimal::from(8));
        assert_eq!(verdict.drawback_pct, Decimal::ZERO);
        assert!(!verdict.triggered);
    }
}

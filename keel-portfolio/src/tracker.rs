use std::collections::HashMap;

use chrono::Utc;
use keel_core::{ActionKind, CloseReason, DecisionAction, PositionInfo, PositionSide, Price};
use rust_decimal::Decimal;
use tracing::info;

/// Band around the liquidation price, on the adverse side, that still counts
/// as a liquidation.
const LIQUIDATION_BAND: Decimal = Decimal::from_parts(2, 0, 0, false, 2);

/// Remembers last cycle's positions so vanished ones can be reported.
#[derive(Clone, Debug, Default)]
pub struct PositionTracker {
    previous: Option<HashMap<String, PositionInfo>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions present in the previous snapshot but missing from `current`,
    /// ordered by key. Empty until a first snapshot has been taken.
    pub fn detect_closed(&self, current: &[PositionInfo]) -> Vec<PositionInfo> {
        let Some(previous) = &self.previous else {
            return Vec::new();
        };
        let mut closed: Vec<PositionInfo> = previous
            .iter()
            .filter(|(key, _)| !current.iter().any(|position| &position.key() == *key))
            .map(|(_, position)| position.clone())
            .collect();
        closed.sort_by_key(PositionInfo::key);
        closed
    }

    /// Replace the stored snapshot wholesale.
    pub fn update_snapshot(&mut self, current: &[PositionInfo]) {
        self.previous = Some(
            current
                .iter()
                .map(|position| (position.key(), position.clone()))
                .collect(),
        );
    }

    /// Drop one position from the snapshot after the system itself closed it,
    /// so it is not later reported as an external close.
    pub fn forget(&mut self, key: &str) -> bool {
        self.previous
            .as_mut()
            .map_or(false, |previous| previous.remove(key).is_some())
    }

    pub fn snapshot(&self) -> Option<&HashMap<String, PositionInfo>> {
        self.previous.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.previous.is_some()
    }
}

/// Best guess at the price and reason behind an externally closed position.
///
/// Liquidation wins when the mark sits at, through, or within 2% of the
/// liquidation price on the adverse side. Stop-loss and take-profit are then
/// checked inclusively. The reported price is the triggering level, or the
/// mark when nothing matched.
pub fn infer_close_details(position: &PositionInfo) -> (Price, CloseReason) {
    let mark = position.mark_price;
    let long = position.side == PositionSide::Long;

    if let Some(liquidation) = position.liquidation_price.filter(|p| *p > Decimal::ZERO) {
        let hit = if long {
            mark <= liquidation * (Decimal::ONE + LIQUIDATION_BAND)
        } else {
            mark >= liquidation * (Decimal::ONE - LIQUIDATION_BAND)
        };
        if hit {
            return (liquidation, CloseReason::Liquidation);
        }
    }
    if let Some(stop) = position.stop_loss.filter(|p| *p > Decimal::ZERO) {
        let hit = if long { mark <= stop } else { mark >= stop };
        if hit {
            return (stop, CloseReason::StopLoss);
        }
    }
    if let Some(target) = position.take_profit.filter(|p| *p > Decimal::ZERO) {
        let hit = if long { mark >= target } else { mark <= target };
        if hit {
            return (target, CloseReason::TakeProfit);
        }
    }
    (mark, CloseReason::Unknown)
}

/// Reconciliation records for positions closed outside the system.
pub fn generate_auto_close_actions(closed: &[PositionInfo]) -> Vec<DecisionAction> {
    closed
        .iter()
        .map(|position| {
            let (price, reason) = infer_close_details(position);
            info!(
                symbol = %position.symbol,
                side = %position.side,
                price = %price,
                reason = %reason,
                "position closed outside the system"
            );
            DecisionAction {
                action: match position.side {
                    PositionSide::Long => ActionKind::AutoCloseLong,
                    PositionSide::Short => ActionKind::AutoCloseShort,
                },
                symbol: position.symbol.clone(),
                side: Some(position.side),
                quantity: position.quantity,
                leverage: position.leverage,
                price,
                success: true,
                error: None,
                order_id: None,
                reason: Some(reason.as_str().to_string()),
                timestamp: Utc::now(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, side: PositionSide, entry: i64, mark: i64) -> PositionInfo {
        PositionInfo {
            symbol: symbol.to_string(),
            side,
            entry_price: Decimal::from(entry),
            mark_price: Decimal::from(mark),
            quantity: Decimal::new(1, 1),
            leverage: 10,
            stop_loss: None,
            take_profit: None,
            liquidation_price: None,
        }
    }

    #[test]
    fn first_run_reports_nothing() {
        let tracker = PositionTracker::new();
        assert!(!tracker.has_snapshot());
        assert!(tracker.detect_closed(&[]).is_empty());
    }

    #[test]
    fn unchanged_positions_report_nothing() {
        let mut tracker = PositionTracker::new();
        let open = vec![
            position("BTCUSDT", PositionSide::Long, 50_000, 50_500),
            position("ETHUSDT", PositionSide::Short, 3_000, 2_950),
        ];
        tracker.update_snapshot(&open);
        assert!(tracker.detect_closed(&open).is_empty());
    }

    #[test]
    fn vanished_positions_are_reported() {
        let mut tracker = PositionTracker::new();
        let btc = position("BTCUSDT", PositionSide::Long, 50_000, 49_500);
        let eth = position("ETHUSDT", PositionSide::Short, 3_000, 3_050);
        tracker.update_snapshot(&[eth.clone(), btc.clone()]);

        let closed = tracker.detect_closed(&[]);
        assert_eq!(closed, vec![btc.clone(), eth]);

        let closed = tracker.detect_closed(&[btc]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].key(), "ETHUSDT_short");
    }

    #[test]
    fn same_symbol_opposite_side_is_a_different_position() {
        let mut tracker = PositionTracker::new();
        tracker.update_snapshot(&[position("BTCUSDT", PositionSide::Long, 50_000, 50_000)]);
        let closed = tracker.detect_closed(&[position("BTCUSDT", PositionSide::Short, 50_000, 50_000)]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].side, PositionSide::Long);
    }

    #[test]
    fn forgotten_positions_are_not_reported() {
        let mut tracker = PositionTracker::new();
        assert!(!tracker.forget("BTCUSDT_long"));
        tracker.update_snapshot(&[
            position("BTCUSDT", PositionSide::Long, 50_000, 50_000),
            position("ETHUSDT", PositionSide::Short, 3_000, 3_000),
        ]);

        assert!(tracker.forget("BTCUSDT_long"));
        assert!(!tracker.forget("BTCUSDT_long"));
        let closed = tracker.detect_closed(&[]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].key(), "ETHUSDT_short");
    }

    #[test]
    fn snapshot_is_replaced_not_merged() {
        let mut tracker = PositionTracker::new();
        tracker.update_snapshot(&[position("BTCUSDT", PositionSide::Long, 50_000, 50_000)]);
        tracker.update_snapshot(&[position("SOLUSDT", PositionSide::Long, 100, 101)]);
        let snapshot = tracker.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("SOLUSDT_long"));
    }

    #[test]
    fn liquidation_takes_precedence() {
        let mut pos = position("BTCUSDT", PositionSide::Long, 50_000, 45_500);
        pos.liquidation_price = Some(Decimal::from(45_000));
        pos.stop_loss = Some(Decimal::from(49_000));
        assert_eq!(
            infer_close_details(&pos),
            (Decimal::from(45_000), CloseReason::Liquidation)
        );

        let mut short = position("ETHUSDT", PositionSide::Short, 3_000, 3_250);
        short.liquidation_price = Some(Decimal::from(3_300));
        assert_eq!(infer_close_details(&short).1, CloseReason::Liquidation);
    }

    #[test]
    fn stop_loss_is_inclusive_per_side() {
        let mut long = position("BTCUSDT", PositionSide::Long, 50_000, 49_500);
        long.stop_loss = Some(Decimal::from(49_600));
        assert_eq!(
            infer_close_details(&long),
            (Decimal::from(49_600), CloseReason::StopLoss)
        );
        long.mark_price = Decimal::from(49_600);
        assert_eq!(infer_close_details(&long).1, CloseReason::StopLoss);

        let mut short = position("ETHUSDT", PositionSide::Short, 3_000, 3_150);
        short.stop_loss = Some(Decimal::from(3_100));
        assert_eq!(
            infer_close_details(&short),
            (Decimal::from(3_100), CloseReason::StopLoss)
        );
    }

    #[test]
    fn take_profit_per_side() {
        let mut long = position("BTCUSDT", PositionSide::Long, 50_000, 52_000);
        long.take_profit = Some(Decimal::from(51_900));
        assert_eq!(
            infer_close_details(&long),
            (Decimal::from(51_900), CloseReason::TakeProfit)
        );

        let mut short = position("ETHUSDT", PositionSide::Short, 3_000, 2_800);
        short.take_profit = Some(Decimal::from(2_810));
        assert_eq!(infer_close_details(&short).1, CloseReason::TakeProfit);
    }

    #[test]
    fn nothing_matched_reports_mark() {
        let mut pos = position("BTCUSDT", PositionSide::Long, 50_000, 50_500);
        pos.stop_loss = Some(Decimal::from(49_000));
        pos.take_profit = Some(Decimal::from(52_000));
        pos.liquidation_price = Some(Decimal::from(45_000));
        assert_eq!(
            infer_close_details(&pos),
            (Decimal::from(50_500), CloseReason::Unknown)
        );
    }

    #[test]
    fn auto_close_records_are_successful_reconciliations() {
        let mut btc = position("BTCUSDT", PositionSide::Long, 50_000, 49_500);
        btc.stop_loss = Some(Decimal::from(49_600));
        let eth = position("ETHUSDT", PositionSide::Short, 3_000, 2_990);

        let actions = generate_auto_close_actions(&[btc, eth]);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action, ActionKind::AutoCloseLong);
        assert_eq!(actions[0].price, Decimal::from(49_600));
        assert_eq!(actions[0].reason.as_deref(), Some("stop_loss"));
        assert_eq!(actions[0].quantity, Decimal::new(1, 1));
        assert_eq!(actions[0].leverage, 10);
        assert!(actions[0].success);

        assert_eq!(actions[1].action, ActionKind::AutoCloseShort);
        assert_eq!(actions[1].price, Decimal::from(2_990));
        assert_eq!(actions[1].reason.as_deref(), Some("unknown"));
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use keel_core::{margin_used, pnl_percentage, ActionKind, PositionSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::CycleRecord;

const RECENT_TRADES: usize = 10;

/// Taker fee charged on each leg by a venue.
#[must_use]
pub fn taker_fee_rate(exchange: &str) -> Decimal {
    match exchange.trim().to_lowercase().as_str() {
        "aster" => Decimal::new(35, 5),
        "hyperliquid" => Decimal::new(45, 5),
        _ => Decimal::new(5, 4),
    }
}

/// One completed round trip, fees included.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub leverage: u32,
    pub open_price: Decimal,
    /// Quantity-weighted average of every closing leg.
    pub close_price: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

/// Aggregate statistics over completed trades.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PerformanceAnalysis {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub total_pnl: Decimal,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    /// Gross wins over gross losses; zero when nothing lost.
    pub profit_factor: Decimal,
    /// Most recent trades first.
    pub recent_trades: Vec<TradeOutcome>,
}

struct OpenLeg {
    symbol: String,
    side: PositionSide,
    open_price: Decimal,
    opened: Decimal,
    remaining: Decimal,
    leverage: u32,
    open_time: DateTime<Utc>,
    pnl: Decimal,
    close_value: Decimal,
}

impl OpenLeg {
    fn close(&mut self, quantity: Decimal, price: Decimal, fee_rate: Decimal) {
        let quantity = quantity.min(self.remaining);
        let gross = (price - self.open_price) * quantity * self.side.sign();
        let fees = (self.open_price + price) * quantity * fee_rate;
        self.pnl += gross - fees;
        self.close_value += price * quantity;
        self.remaining -= quantity;
    }

    fn finish(self, close_time: DateTime<Utc>) -> TradeOutcome {
        let closed = self.opened - self.remaining.max(Decimal::ZERO);
        let close_price = if closed > Decimal::ZERO {
            self.close_value / closed
        } else {
            self.open_price
        };
        let margin = margin_used(self.opened, self.open_price, self.leverage);
        TradeOutcome {
            pnl_pct: pnl_percentage(self.pnl, margin),
            symbol: self.symbol,
            side: self.side,
            quantity: self.opened,
            leverage: self.leverage,
            open_price: self.open_price,
            close_price,
            pnl: self.pnl,
            open_time: self.open_time,
            close_time,
        }
    }
}

/// Pair successful opens with later closes and summarize the results.
///
/// Partial closes accumulate into a single trade. Full closes consume the
/// remaining quantity whatever size they report. A partial close without a
/// side matches whichever leg is open on that symbol.
pub fn analyze_performance(records: &[CycleRecord]) -> PerformanceAnalysis {
    let mut open: HashMap<String, OpenLeg> = HashMap::new();
    let mut trades = Vec::new();

    for record in records {
        let fee_rate = taker_fee_rate(&record.exchange);
        for action in record.decisions.iter().filter(|action| action.success) {
            match &action.action {
                ActionKind::OpenLong | ActionKind::OpenShort => {
                    let Some(side) = action.action.side() else {
                        continue;
                    };
                    open.insert(
                        format!("{}_{side}", action.symbol),
                        OpenLeg {
                            symbol: action.symbol.clone(),
                            side,
                            open_price: action.price,
                            opened: action.quantity,
                            remaining: action.quantity,
                            leverage: action.leverage,
                            open_time: action.timestamp,
                            pnl: Decimal::ZERO,
                            close_value: Decimal::ZERO,
                        },
                    );
                }
                ActionKind::CloseLong
                | ActionKind::CloseShort
                | ActionKind::AutoCloseLong
                | ActionKind::AutoCloseShort => {
                    let Some(side) = action.action.side() else {
                        continue;
                    };
                    let key = format!("{}_{side}", action.symbol);
                    if let Some(mut leg) = open.remove(&key) {
                        let remaining = leg.remaining;
                        leg.close(remaining, action.price, fee_rate);
                        trades.push(leg.finish(action.timestamp));
                    }
                }
                ActionKind::PartialClose => {
                    let key = match action.side {
                        Some(side) => format!("{}_{side}", action.symbol),
                        None => match open.values().find(|leg| leg.symbol == action.symbol) {
                            Some(leg) => format!("{}_{}", leg.symbol, leg.side),
                            None => continue,
                        },
                    };
                    let Some(leg) = open.get_mut(&key) else {
                        continue;
                    };
                    let quantity = if action.quantity > Decimal::ZERO {
                        action.quantity
                    } else {
                        leg.remaining
                    };
                    leg.close(quantity, action.price, fee_rate);
                    if leg.remaining <= Decimal::ZERO {
                        if let Some(leg) = open.remove(&key) {
                            trades.push(leg.finish(action.timestamp));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    summarize(trades)
}

fn summarize(trades: Vec<TradeOutcome>) -> PerformanceAnalysis {
    let mut analysis = PerformanceAnalysis {
        total_trades: trades.len(),
        ..PerformanceAnalysis::default()
    };
    let mut gross_win = Decimal::ZERO;
    let mut gross_loss = Decimal::ZERO;
    for trade in &trades {
        analysis.total_pnl += trade.pnl;
        if trade.pnl > Decimal::ZERO {
            analysis.winning_trades += 1;
            gross_win += trade.pnl;
        } else if trade.pnl < Decimal::ZERO {
            analysis.losing_trades += 1;
            gross_loss += trade.pnl.abs();
        }
    }
    if analysis.total_trades > 0 {
        analysis.win_rate = Decimal::from(analysis.winning_trades) / Decimal::from(analysis.total_trades)
            * Decimal::ONE_HUNDRED;
    }
    if analysis.winning_trades > 0 {
        analysis.average_win = gross_win / Decimal::from(analysis.winning_trades);
    }
    if analysis.losing_trades > 0 {
        analysis.average_loss = -gross_loss / Decimal::from(analysis.losing_trades);
    }
    if gross_loss > Decimal::ZERO {
        analysis.profit_factor = gross_win / gross_loss;
    }
    analysis.recent_trades = trades.into_iter().rev().take(RECENT_TRADES).collect();
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keel_core::DecisionAction;
    use std::str::FromStr;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    fn action(kind: &str, symbol: &str, quantity: &str, price: &str, at: DateTime<Utc>) -> DecisionAction {
        let action = ActionKind::from(kind);
        DecisionAction {
            side: action.side(),
            action,
            symbol: symbol.to_string(),
            quantity: dec(quantity),
            leverage: 10,
            price: dec(price),
            success: true,
            error: None,
            order_id: None,
            reason: None,
            timestamp: at,
        }
    }

    fn cycle(exchange: &str, n: u64, decisions: Vec<DecisionAction>) -> CycleRecord {
        let mut record = CycleRecord::new("t", exchange, n);
        record.decisions = decisions;
        record
    }

    #[test]
    fn fee_rates_by_venue() {
        assert_eq!(taker_fee_rate("aster"), dec("0.00035"));
        assert_eq!(taker_fee_rate("hyperliquid"), dec("0.00045"));
        assert_eq!(taker_fee_rate("binance"), dec("0.0005"));
        assert_eq!(taker_fee_rate("unknown_exchange"), dec("0.0005"));
        assert_eq!(taker_fee_rate(""), dec("0.0005"));
    }

    #[test]
    fn losing_trade_includes_both_fees() {
        let t0 = Utc::now() - Duration::hours(1);
        let records = vec![
            cycle("aster", 1, vec![action("open_long", "BTCUSDT", "0.002", "103960.7", t0)]),
            cycle("aster", 2, vec![action("close_long", "BTCUSDT", "0.002", "103425.3", Utc::now())]),
        ];
        let analysis = analyze_performance(&records);
        assert_eq!(analysis.total_trades, 1);
        assert_eq!(analysis.losing_trades, 1);
        assert_eq!(analysis.winning_trades, 0);
        // -1.0708 price move, 0.1451702 in fees
        assert_eq!(analysis.recent_trades[0].pnl, dec("-1.2159702"));
    }

    #[test]
    fn partial_closes_accumulate_into_one_trade() {
        let t0 = Utc::now() - Duration::hours(2);
        let records = vec![
            cycle("hyperliquid", 1, vec![action("open_long", "ETHUSDT", "1", "2000", t0)]),
            cycle(
                "hyperliquid",
                2,
                vec![{
                    let mut partial = action("partial_close", "ETHUSDT", "0.5", "2100", t0 + Duration::hours(1));
                    partial.side = None;
                    partial
                }],
            ),
            cycle("hyperliquid", 3, vec![action("close_long", "ETHUSDT", "0.5", "2150", Utc::now())]),
        ];
        let analysis = analyze_performance(&records);
        assert_eq!(analysis.total_trades, 1);
        assert_eq!(analysis.winning_trades, 1);
        let trade = &analysis.recent_trades[0];
        assert_eq!(trade.pnl, dec("123.14375"));
        assert_eq!(trade.quantity, Decimal::ONE);
        assert_eq!(trade.close_price, dec("2125"));
    }

    #[test]
    fn close_without_quantity_uses_remaining() {
        let t0 = Utc::now() - Duration::hours(1);
        let records = vec![
            cycle("binance", 1, vec![action("open_short", "ETHUSDT", "0.1", "3000", t0)]),
            cycle("binance", 2, vec![action("close_short", "ETHUSDT", "0", "3100", Utc::now())]),
        ];
        let analysis = analyze_performance(&records);
        assert_eq!(analysis.recent_trades[0].pnl, dec("-10.305"));
    }

    #[test]
    fn failed_actions_and_unmatched_closes_are_ignored() {
        let t0 = Utc::now();
        let mut failed = action("open_long", "BTCUSDT", "0.01", "50000", t0);
        failed.success = false;
        let records = vec![cycle(
            "binance",
            1,
            vec![failed, action("close_long", "BTCUSDT", "0.01", "51000", t0)],
        )];
        assert_eq!(analyze_performance(&records).total_trades, 0);
    }

    #[test]
    fn summary_statistics() {
        let t0 = Utc::now() - Duration::hours(3);
        let records = vec![
            cycle(
                "binance",
                1,
                vec![
                    action("open_long", "BTCUSDT", "0.01", "50000", t0),
                    action("open_short", "ETHUSDT", "0.1", "3000", t0),
                ],
            ),
            cycle(
                "binance",
                2,
                vec![
                    // +10 - 0.505 fees
                    action("close_long", "BTCUSDT", "0.01", "51000", t0 + Duration::hours(1)),
                    // -10 - 0.305 fees
                    action("close_short", "ETHUSDT", "0.1", "3100", t0 + Duration::hours(1)),
                ],
            ),
        ];
        let analysis = analyze_performance(&records);
        assert_eq!(analysis.total_trades, 2);
        assert_eq!(analysis.win_rate, Decimal::from(50));
        assert_eq!(analysis.total_pnl, dec("-0.81"));
        assert_eq!(analysis.average_win, dec("9.495"));
        assert_eq!(analysis.average_loss, dec("-10.305"));
        assert_eq!(analysis.recent_trades[0].symbol, "ETHUSDT");
        assert!(analysis.profit_factor < Decimal::ONE);
    }
}

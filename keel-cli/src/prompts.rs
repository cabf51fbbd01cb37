//! Prompt construction for advisory calls.
//!
//! The system prompt carries the trading rules and the exact JSON contract
//! understood by `keel_advisor::parse_decisions`; the user prompt carries the
//! account, open positions, recent candles and past performance.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use keel_core::{Candle, Interval};
use keel_journal::PerformanceAnalysis;
use rust_decimal::Decimal;

use crate::trader::{AccountInfo, PositionView};

/// Closing prices listed per symbol and interval.
const RECENT_CLOSES: usize = 10;

const DEFAULT_STRATEGY: &str = "\
You are a disciplined crypto perpetual futures trader managing an account of \
{equity} USDT. Protect capital first: only open a position when the trend on \
the higher timeframe and the momentum on the lower timeframe agree, always set \
a stop-loss, and keep leverage at or below {max_leverage}x.";

const OUTPUT_CONTRACT: &str = r#"
## Output format

First explain your reasoning in plain text. Then output a single JSON array of
decisions, one object per symbol you want to act on:

[
  {"symbol": "BTCUSDT", "action": "open_long", "leverage": 5,
   "position_size_usd": 500, "stop_loss": 48000, "take_profit": 54000,
   "confidence": 80, "reasoning": "..."}
]

Valid actions: open_long, open_short, close_long, close_short, partial_close
(with close_percentage between 0 and 100), update_stop_loss (with
new_stop_loss), update_take_profit (with new_take_profit), hold, wait.
A long stop-loss must be below the current price and a short stop-loss above it.
Output [] when nothing should change."#;

/// System prompt from the trader's template, or the built-in strategy.
///
/// `{equity}` and `{max_leverage}` placeholders are substituted. The output
/// contract is always appended so replies stay parseable.
pub fn system_prompt(template: Option<&str>, equity: Decimal, max_leverage: u32) -> String {
    let strategy = template
        .filter(|template| !template.trim().is_empty())
        .unwrap_or(DEFAULT_STRATEGY);
    let mut prompt = strategy
        .replace("{equity}", &equity.round_dp(2).to_string())
        .replace("{max_leverage}", &max_leverage.to_string());
    prompt.push('\n');
    prompt.push_str(OUTPUT_CONTRACT);
    prompt
}

/// Candles loaded for one symbol and interval.
#[derive(Clone, Debug)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub interval: Interval,
    pub candles: Vec<Candle>,
}

/// Everything rendered into a cycle's user prompt.
pub struct PromptContext<'a> {
    pub now: DateTime<Utc>,
    pub cycle: u64,
    pub runtime_minutes: i64,
    pub account: &'a AccountInfo,
    pub positions: &'a [PositionView],
    pub market: &'a [MarketSnapshot],
    pub skipped: &'a [String],
    pub performance: Option<&'a PerformanceAnalysis>,
}

pub fn user_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Time: {} | Cycle #{} | Runtime: {} min",
        ctx.now.format("%Y-%m-%d %H:%M:%S UTC"),
        ctx.cycle,
        ctx.runtime_minutes
    );

    let account = ctx.account;
    let _ = writeln!(
        out,
        "\n## Account\nEquity {} | Available {} | PnL {} ({}%) | Margin used {}% | Positions {}",
        account.total_equity.round_dp(2),
        account.available_balance.round_dp(2),
        account.total_pnl.round_dp(2),
        account.total_pnl_pct.round_dp(2),
        account.margin_used_pct.round_dp(2),
        account.position_count
    );

    out.push_str("\n## Open positions\n");
    if ctx.positions.is_empty() {
        out.push_str("None\n");
    }
    for position in ctx.positions {
        let _ = writeln!(
            out,
            "- {} {} qty {} @ {} mark {} | {}x | PnL {} ({}%){}{}",
            position.symbol,
            position.side,
            position.quantity,
            position.entry_price,
            position.mark_price,
            position.leverage,
            position.unrealized_pnl.round_dp(2),
            position.unrealized_pnl_pct.round_dp(2),
            position
                .stop_loss
                .map(|price| format!(" | SL {price}"))
                .unwrap_or_default(),
            position
                .take_profit
                .map(|price| format!(" | TP {price}"))
                .unwrap_or_default(),
        );
    }

    out.push_str("\n## Market data\n");
    for snapshot in ctx.market {
        render_snapshot(&mut out, snapshot);
    }
    if !ctx.skipped.is_empty() {
        let _ = writeln!(
            out,
            "Unavailable this cycle (do not trade): {}",
            ctx.skipped.join(", ")
        );
    }

    if let Some(performance) = ctx.performance.filter(|p| p.total_trades > 0) {
        let _ = writeln!(
            out,
            "\n## Recent performance\nTrades {} | Win rate {}% | Total PnL {} | Avg win {} | Avg loss {} | Profit factor {}",
            performance.total_trades,
            performance.win_rate.round_dp(1),
            performance.total_pnl.round_dp(2),
            performance.average_win.round_dp(2),
            performance.average_loss.round_dp(2),
            performance.profit_factor.round_dp(2)
        );
        for trade in performance.recent_trades.iter().take(5) {
            let _ = writeln!(
                out,
                "- {} {} {} -> {} PnL {} ({}%)",
                trade.symbol,
                trade.side,
                trade.open_price,
                trade.close_price.round_dp(4),
                trade.pnl.round_dp(2),
                trade.pnl_pct.round_dp(2)
            );
        }
    }
    out
}

fn render_snapshot(out: &mut String, snapshot: &MarketSnapshot) {
    let (Some(first), Some(last)) = (snapshot.candles.first(), snapshot.candles.last()) else {
        return;
    };
    let change_pct = if first.open > Decimal::ZERO {
        (last.close - first.open) / first.open * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };
    let closes: Vec<String> = snapshot
        .candles
        .iter()
        .rev()
        .take(RECENT_CLOSES)
        .rev()
        .map(|candle| candle.close.to_string())
        .collect();
    let _ = writeln!(
        out,
        "{} {}: last {} | change {}% over {} bars | closes [{}]",
        snapshot.symbol,
        snapshot.interval,
        last.close,
        change_pct.round_dp(2),
        snapshot.candles.len(),
        closes.join(", ")
    );
}

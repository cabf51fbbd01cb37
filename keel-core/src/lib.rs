//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod shutdown;

pub use shutdown::ShutdownSignal;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;

/// Unique identifier assigned to orders by the exchange.
pub type OrderId = String;

/// Normalize a user or model supplied symbol into the `BASEUSDT` form.
///
/// `" btc "` becomes `BTCUSDT`, while `ethusdt` becomes `ETHUSDT`.
#[must_use]
pub fn normalize_symbol(raw: &str) -> Symbol {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() || symbol.ends_with("USDT") {
        symbol
    } else {
        format!("{symbol}USDT")
    }
}

/// Direction of a derivatives position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// `1` for long exposure, `-1` for short exposure.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(format!("unsupported position side '{other}'")),
        }
    }
}

/// Interval granularity of a candle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl Interval {
    /// Convert the interval into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::ThreeMinutes => Duration::minutes(3),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::FourHours => Duration::hours(4),
            Self::OneDay => Duration::days(1),
        }
    }

    /// Convert the interval to Binance-compatible identifiers.
    #[must_use]
    pub fn to_binance(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_binance())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "1m" | "1min" | "1minute" => Ok(Self::OneMinute),
            "3m" | "3min" | "3minutes" => Ok(Self::ThreeMinutes),
            "5m" | "5min" | "5minutes" => Ok(Self::FiveMinutes),
            "15m" | "15min" | "15minutes" => Ok(Self::FifteenMinutes),
            "30m" | "30min" | "30minutes" => Ok(Self::ThirtyMinutes),
            "1h" | "60m" | "1hour" => Ok(Self::OneHour),
            "4h" | "240m" | "4hours" => Ok(Self::FourHours),
            "1d" | "day" | "d" => Ok(Self::OneDay),
            other => Err(format!("unsupported interval '{other}'")),
        }
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_binance().to_string()
    }
}

/// Aggregated OHLCV bar for one symbol and interval.
///
/// A bar is identified by its `open_time`; while `close_time` lies in the
/// future the bar is still forming and later updates replace it in place.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
}

impl Candle {
    /// Whether the bar's close time has passed at `now`.
    #[must_use]
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.close_time <= now
    }
}

/// Capital committed to a position, always derived from the entry price.
///
/// Returns zero when leverage is zero so callers never divide by it.
#[must_use]
pub fn margin_used(quantity: Quantity, entry_price: Price, leverage: u32) -> Decimal {
    if leverage == 0 {
        return Decimal::ZERO;
    }
    quantity.abs() * entry_price / Decimal::from(leverage)
}

/// Unrealized PnL expressed as a percentage of margin used.
///
/// A non-positive margin yields `0` rather than a division fault.
#[must_use]
pub fn pnl_percentage(unrealized_pnl: Decimal, margin_used: Decimal) -> Decimal {
    if margin_used <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    unrealized_pnl / margin_used * Decimal::ONE_HUNDRED
}

/// Build the tracking key `{symbol}_{side}` used by snapshots and peak caches.
#[must_use]
pub fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{symbol}_{side}")
}

/// Exchange-reported view of an open position.
///
/// `quantity` is always stored as an absolute size; direction lives in `side`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PositionInfo {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: Price,
    pub mark_price: Price,
    pub quantity: Quantity,
    pub leverage: u32,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub liquidation_price: Option<Price>,
}

impl PositionInfo {
    #[must_use]
    pub fn key(&self) -> String {
        position_key(&self.symbol, self.side)
    }

    #[must_use]
    pub fn margin_used(&self) -> Decimal {
        margin_used(self.quantity, self.entry_price, self.leverage)
    }

    /// Profit at the current mark price.
    #[must_use]
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.mark_price - self.entry_price) * self.quantity.abs() * self.side.sign()
    }

    #[must_use]
    pub fn unrealized_pnl_pct(&self) -> Decimal {
        pnl_percentage(self.unrealized_pnl(), self.margin_used())
    }

    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.mark_price
    }
}

/// Account-level balance summary reported by an exchange.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AccountBalance {
    /// Wallet balance, excluding unrealized PnL.
    pub total_equity: Price,
    pub available_balance: Price,
    pub unrealized_pnl: Price,
}

/// Action requested by the advisor, or synthesized during reconciliation.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    PartialClose,
    UpdateStopLoss,
    UpdateTakeProfit,
    Hold,
    Wait,
    AutoCloseLong,
    AutoCloseShort,
    Unknown(String),
}

impl ActionKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
            Self::PartialClose => "partial_close",
            Self::UpdateStopLoss => "update_stop_loss",
            Self::UpdateTakeProfit => "update_take_profit",
            Self::Hold => "hold",
            Self::Wait => "wait",
            Self::AutoCloseLong => "auto_close_long",
            Self::AutoCloseShort => "auto_close_short",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    /// Execution rank within a batch: exposure reduction runs before
    /// protective updates, which run before new exposure.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::CloseLong | Self::CloseShort | Self::PartialClose => 1,
            Self::UpdateStopLoss | Self::UpdateTakeProfit => 2,
            Self::OpenLong | Self::OpenShort => 3,
            Self::Hold | Self::Wait => 4,
            Self::AutoCloseLong | Self::AutoCloseShort | Self::Unknown(_) => 5,
        }
    }

    /// Side implied by the action itself, if any.
    #[must_use]
    pub fn side(&self) -> Option<PositionSide> {
        match self {
            Self::OpenLong | Self::CloseLong | Self::AutoCloseLong => Some(PositionSide::Long),
            Self::OpenShort | Self::CloseShort | Self::AutoCloseShort => Some(PositionSide::Short),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    /// Actions that reduce or remove exposure.
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            Self::CloseLong
                | Self::CloseShort
                | Self::PartialClose
                | Self::AutoCloseLong
                | Self::AutoCloseShort
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "open_long" => Self::OpenLong,
            "open_short" => Self::OpenShort,
            "close_long" => Self::CloseLong,
            "close_short" => Self::CloseShort,
            "partial_close" => Self::PartialClose,
            "update_stop_loss" => Self::UpdateStopLoss,
            "update_take_profit" => Self::UpdateTakeProfit,
            "hold" => Self::Hold,
            "wait" => Self::Wait,
            "auto_close_long" => Self::AutoCloseLong,
            "auto_close_short" => Self::AutoCloseShort,
            _ => Self::Unknown(value),
        }
    }
}

impl From<&str> for ActionKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ActionKind> for String {
    fn from(value: ActionKind) -> Self {
        value.as_str().to_string()
    }
}

/// One advisory decision for a single symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Decision {
    pub symbol: Symbol,
    pub action: ActionKind,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub position_size_usd: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub new_stop_loss: Option<Price>,
    #[serde(default)]
    pub new_take_profit: Option<Price>,
    #[serde(default)]
    pub close_percentage: Option<Decimal>,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Decision {
    /// Minimal decision carrying only a symbol and an action.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, action: impl Into<ActionKind>) -> Self {
        Self {
            symbol: symbol.into(),
            action: action.into(),
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            new_stop_loss: None,
            new_take_profit: None,
            close_percentage: None,
            confidence: None,
            reasoning: None,
        }
    }
}

/// Audit record of one routed decision, written whether or not it succeeded.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DecisionAction {
    pub action: ActionKind,
    pub symbol: Symbol,
    #[serde(default)]
    pub side: Option<PositionSide>,
    pub quantity: Quantity,
    pub leverage: u32,
    pub price: Price,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    /// Free-form context such as an inferred close reason.
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionAction {
    /// Start an unsuccessful record for `decision`; executors fill it in.
    #[must_use]
    pub fn pending(decision: &Decision) -> Self {
        Self {
            action: decision.action.clone(),
            symbol: decision.symbol.clone(),
            side: decision.action.side(),
            quantity: Decimal::ZERO,
            leverage: decision.leverage.unwrap_or_default(),
            price: Decimal::ZERO,
            success: false,
            error: None,
            order_id: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// Why a position disappeared between two observations.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Liquidation,
    Unknown,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Liquidation => "liquidation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

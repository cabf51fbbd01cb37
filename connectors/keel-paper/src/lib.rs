//! Simple paper exchange used for dry runs.
//!
//! Orders fill immediately at the latest known price (optionally slipped),
//! margin is reserved from the wallet, taker fees are charged on both legs,
//! and stop-loss, take-profit and liquidation levels trigger whenever
//! positions are refreshed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keel_broker::{ExchangeAdapter, ExchangeError, ExchangeResult, OrderAck};
use keel_core::{
    margin_used, position_key, AccountBalance, PositionInfo, PositionSide, Price, Quantity,
};
use keel_markets::PriceSource;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PaperConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: Decimal,
    #[serde(default)]
    pub slippage_bps: Decimal,
    #[serde(default = "default_maintenance_margin_rate")]
    pub maintenance_margin_rate: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            initial_balance: default_initial_balance(),
            taker_fee_rate: default_taker_fee_rate(),
            slippage_bps: Decimal::ZERO,
            maintenance_margin_rate: default_maintenance_margin_rate(),
        }
    }
}

fn default_name() -> String {
    "paper".to_string()
}

fn default_initial_balance() -> Decimal {
    Decimal::from(1_000)
}

fn default_taker_fee_rate() -> Decimal {
    Decimal::new(5, 4)
}

fn default_maintenance_margin_rate() -> Decimal {
    Decimal::new(4, 3)
}

struct PaperState {
    wallet: Decimal,
    positions: HashMap<String, PositionInfo>,
    order_seq: u64,
}

impl PaperState {
    fn next_order_id(&mut self) -> String {
        self.order_seq += 1;
        format!("paper-{}", self.order_seq)
    }

    fn margin_in_use(&self) -> Decimal {
        self.positions.values().map(PositionInfo::margin_used).sum()
    }

    fn unrealized(&self) -> Decimal {
        self.positions.values().map(PositionInfo::unrealized_pnl).sum()
    }
}

/// In-memory [`ExchangeAdapter`] with immediate fills.
#[derive(Clone)]
pub struct PaperExchange {
    config: PaperConfig,
    prices: Option<Arc<dyn PriceSource>>,
    last_prices: Arc<Mutex<HashMap<String, Price>>>,
    state: Arc<AsyncMutex<PaperState>>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let state = PaperState {
            wallet: config.initial_balance,
            positions: HashMap::new(),
            order_seq: 0,
        };
        Self {
            config,
            prices: None,
            last_prices: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(AsyncMutex::new(state)),
        }
    }

    /// Price fills and marks from `prices`, falling back to manual updates.
    #[must_use]
    pub fn with_price_source(mut self, prices: Arc<dyn PriceSource>) -> Self {
        self.prices = Some(prices);
        self
    }

    /// Update the latest market price for a symbol.
    pub fn update_price(&self, symbol: &str, price: Price) {
        self.last_prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), price);
    }

    pub async fn wallet_balance(&self) -> Decimal {
        self.state.lock().await.wallet
    }

    async fn resolve_price(&self, symbol: &str) -> ExchangeResult<Price> {
        if let Some(source) = &self.prices {
            match source.latest_price(symbol).await {
                Ok(price) => {
                    self.update_price(symbol, price);
                    return Ok(price);
                }
                Err(err) => {
                    warn!(symbol, error = %err, "paper price source failed, using last known price");
                }
            }
        }
        self.last_prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
            .filter(|price| *price > Decimal::ZERO)
            .ok_or_else(|| ExchangeError::InvalidRequest(format!("no price available for {symbol}")))
    }

    fn slipped(&self, price: Price, buying: bool) -> Price {
        if self.config.slippage_bps <= Decimal::ZERO {
            return price;
        }
        let rate = self.config.slippage_bps / Decimal::from(10_000);
        if buying {
            price * (Decimal::ONE + rate)
        } else {
            price * (Decimal::ONE - rate)
        }
    }

    fn liquidation_price(&self, side: PositionSide, entry: Price, leverage: u32) -> Option<Price> {
        if leverage == 0 {
            return None;
        }
        let inverse = Decimal::ONE / Decimal::from(leverage);
        let mmr = self.config.maintenance_margin_rate;
        let price = match side {
            PositionSide::Long => entry * (Decimal::ONE - inverse + mmr),
            PositionSide::Short => entry * (Decimal::ONE + inverse - mmr),
        };
        (price > Decimal::ZERO).then_some(price)
    }

    /// Mark every position to market and settle triggered protective levels.
    async fn refresh(&self) {
        let symbols: Vec<String> = {
            let state = self.state.lock().await;
            let mut symbols: Vec<String> =
                state.positions.values().map(|p| p.symbol.clone()).collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };
        let mut marks = HashMap::new();
        for symbol in symbols {
            if let Ok(price) = self.resolve_price(&symbol).await {
                marks.insert(symbol, price);
            }
        }

        let mut state = self.state.lock().await;
        for position in state.positions.values_mut() {
            if let Some(mark) = marks.get(&position.symbol) {
                position.mark_price = *mark;
            }
        }
        let triggered: Vec<(String, Price, &'static str)> = state
            .positions
            .iter()
            .filter_map(|(key, position)| trigger_level(position).map(|(price, why)| (key.clone(), price, why)))
            .collect();
        for (key, price, why) in triggered {
            if let Some(position) = state.positions.remove(&key) {
                let fee = price * position.quantity * self.config.taker_fee_rate;
                let pnl = (price - position.entry_price) * position.quantity * position.side.sign();
                state.wallet += pnl - fee;
                info!(
                    symbol = %position.symbol,
                    side = %position.side,
                    price = %price,
                    pnl = %pnl.round_dp(4),
                    trigger = why,
                    "paper position closed by trigger"
                );
            }
        }
    }

    async fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidRequest("quantity must be positive".into()));
        }
        let leverage = leverage.max(1);
        let price = self.resolve_price(symbol).await?;
        let fill = self.slipped(price, side == PositionSide::Long);
        let margin = margin_used(quantity, fill, leverage);
        let fee = fill * quantity * self.config.taker_fee_rate;

        let mut state = self.state.lock().await;
        let available = state.wallet - state.margin_in_use();
        if margin + fee > available {
            return Err(ExchangeError::Rejected(format!(
                "insufficient margin: required {}, available {}",
                (margin + fee).round_dp(4),
                available.round_dp(4)
            )));
        }
        state.wallet -= fee;
        let key = position_key(symbol, side);
        let (entry, total) = match state.positions.get(&key) {
            Some(existing) => {
                let total = existing.quantity + quantity;
                let entry = (existing.entry_price * existing.quantity + fill * quantity) / total;
                (entry, total)
            }
            None => (fill, quantity),
        };
        let liquidation_price = self.liquidation_price(side, entry, leverage);
        let position = state.positions.entry(key).or_insert_with(|| PositionInfo {
            symbol: symbol.to_string(),
            side,
            entry_price: fill,
            mark_price: fill,
            quantity: Decimal::ZERO,
            leverage,
            stop_loss: None,
            take_profit: None,
            liquidation_price: None,
        });
        position.entry_price = entry;
        position.mark_price = fill;
        position.quantity = total;
        position.leverage = leverage;
        position.liquidation_price = liquidation_price;

        let mut ack = OrderAck::new(state.next_order_id());
        ack.avg_price = Some(fill);
        Ok(ack)
    }

    async fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
    ) -> ExchangeResult<OrderAck> {
        let price = self.resolve_price(symbol).await?;
        let fill = self.slipped(price, side == PositionSide::Short);
        let key = position_key(symbol, side);

        let mut state = self.state.lock().await;
        let Some(position) = state.positions.get_mut(&key) else {
            return Err(ExchangeError::InvalidRequest(format!(
                "no {side} position for {symbol}"
            )));
        };
        let closing = if quantity <= Decimal::ZERO {
            position.quantity
        } else {
            quantity.min(position.quantity)
        };
        let pnl = (fill - position.entry_price) * closing * side.sign();
        let fee = fill * closing * self.config.taker_fee_rate;
        position.quantity -= closing;
        position.mark_price = fill;
        if position.quantity <= Decimal::ZERO {
            state.positions.remove(&key);
        }
        state.wallet += pnl - fee;

        let mut ack = OrderAck::new(state.next_order_id());
        ack.avg_price = Some(fill);
        Ok(ack)
    }

    async fn protect(
        &self,
        symbol: &str,
        side: PositionSide,
        price: Price,
        stop: bool,
    ) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        let position = state
            .positions
            .get_mut(&position_key(symbol, side))
            .ok_or_else(|| {
                ExchangeError::InvalidRequest(format!("no {side} position for {symbol}"))
            })?;
        if stop {
            position.stop_loss = Some(price);
        } else {
            position.take_profit = Some(price);
        }
        Ok(())
    }
}

fn trigger_level(position: &PositionInfo) -> Option<(Price, &'static str)> {
    let mark = position.mark_price;
    let long = position.side == PositionSide::Long;
    let crossed = |level: Price, adverse: bool| {
        if long == adverse {
            mark <= level
        } else {
            mark >= level
        }
    };
    if let Some(level) = position.liquidation_price {
        if crossed(level, true) {
            return Some((level, "liquidation"));
        }
    }
    if let Some(level) = position.stop_loss {
        if crossed(level, true) {
            return Some((level, "stop_loss"));
        }
    }
    if let Some(level) = position.take_profit {
        if crossed(level, false) {
            return Some((level, "take_profit"));
        }
    }
    None
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        self.refresh().await;
        let state = self.state.lock().await;
        let mut positions: Vec<PositionInfo> = state.positions.values().cloned().collect();
        positions.sort_by_key(PositionInfo::key);
        Ok(positions)
    }

    async fn balance(&self) -> ExchangeResult<AccountBalance> {
        self.refresh().await;
        let state = self.state.lock().await;
        Ok(AccountBalance {
            total_equity: state.wallet,
            available_balance: state.wallet - state.margin_in_use(),
            unrealized_pnl: state.unrealized(),
        })
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(symbol, PositionSide::Long, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(symbol, PositionSide::Short, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, quantity: Quantity) -> ExchangeResult<OrderAck> {
        self.close(symbol, PositionSide::Long, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: Quantity) -> ExchangeResult<OrderAck> {
        self.close(symbol, PositionSide::Short, quantity).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()> {
        self.protect(symbol, side, price, true).await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()> {
        self.protect(symbol, side, price, false).await
    }
}

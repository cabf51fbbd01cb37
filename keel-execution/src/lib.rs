//! Decision routing.
//!
//! [`DecisionExecutor`] turns one advisory [`Decision`] into at most one
//! exchange action and always produces a [`DecisionAction`] record, whether
//! the action succeeded or not.

use std::sync::Arc;

use keel_broker::{ExchangeAdapter, ExchangeError};
use keel_core::{
    ActionKind, Decision, DecisionAction, PositionInfo, PositionSide, Price, Quantity, Symbol,
};
use keel_markets::{MarketDataError, PriceSource};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

/// Convenience alias for execution results.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Reasons a decision could not be carried out.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Decimal, available: Decimal },
    #[error("{symbol} already holds {side} position")]
    PositionConflict { symbol: Symbol, side: PositionSide },
    #[error("position does not exist: {symbol}{}", side_suffix(.side))]
    PositionNotFound {
        symbol: Symbol,
        side: Option<PositionSide>,
    },
    #[error("close percentage must be between 0 and 100, got {0}")]
    InvalidPercentage(Decimal),
    #[error("{side} stop-loss must be {} current price {price}, got {requested}", stop_relation(.side))]
    InvalidStopLoss {
        side: PositionSide,
        requested: Price,
        price: Price,
    },
    #[error("{side} take-profit must be {} current price {price}, got {requested}", target_relation(.side))]
    InvalidTakeProfit {
        side: PositionSide,
        requested: Price,
        price: Price,
    },
    #[error("invalid decision: {0}")]
    InvalidDecision(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
}

fn side_suffix(side: &Option<PositionSide>) -> String {
    side.map(|side| format!(" {side}")).unwrap_or_default()
}

fn stop_relation(side: &PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "below",
        PositionSide::Short => "above",
    }
}

fn target_relation(side: &PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "above",
        PositionSide::Short => "below",
    }
}

/// Per-trader execution parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExecutionConfig {
    /// Taker fee reserved on top of initial margin when opening.
    pub open_fee_rate: Decimal,
    /// Used when a decision carries no leverage.
    pub default_leverage: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            open_fee_rate: Decimal::new(4, 4),
            default_leverage: 5,
        }
    }
}

/// Stable-sort decisions so exposure is reduced before it is added.
pub fn sort_by_priority(decisions: &mut [Decision]) {
    decisions.sort_by_key(|decision| decision.action.priority());
}

/// Validates and routes decisions against one exchange account.
pub struct DecisionExecutor {
    exchange: Arc<dyn ExchangeAdapter>,
    prices: Arc<dyn PriceSource>,
    config: ExecutionConfig,
}

impl DecisionExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        prices: Arc<dyn PriceSource>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            prices,
            config,
        }
    }

    pub fn config(&self) -> ExecutionConfig {
        self.config
    }

    /// Execute a batch in priority order. Failures are recorded and the
    /// remaining decisions still run.
    pub async fn execute_batch(&self, decisions: &[Decision]) -> Vec<DecisionAction> {
        let mut ordered = decisions.to_vec();
        sort_by_priority(&mut ordered);
        let mut records = Vec::with_capacity(ordered.len());
        for decision in &ordered {
            records.push(self.execute(decision).await);
        }
        records
    }

    /// Execute one decision and describe the outcome.
    pub async fn execute(&self, decision: &Decision) -> DecisionAction {
        let mut record = DecisionAction::pending(decision);
        match self.route(decision, &mut record).await {
            Ok(()) => {
                record.success = true;
                info!(
                    symbol = %record.symbol,
                    action = %record.action,
                    quantity = %record.quantity,
                    price = %record.price,
                    order_id = record.order_id.as_deref().unwrap_or("-"),
                    "decision executed"
                );
            }
            Err(err) => {
                warn!(
                    symbol = %record.symbol,
                    action = %record.action,
                    error = %err,
                    "decision failed"
                );
                record.error = Some(err.to_string());
            }
        }
        record
    }

    async fn route(&self, decision: &Decision, record: &mut DecisionAction) -> ExecutionResult<()> {
        match &decision.action {
            ActionKind::OpenLong => self.open(decision, PositionSide::Long, record).await,
            ActionKind::OpenShort => self.open(decision, PositionSide::Short, record).await,
            ActionKind::CloseLong => self.close(decision, PositionSide::Long, record).await,
            ActionKind::CloseShort => self.close(decision, PositionSide::Short, record).await,
            ActionKind::PartialClose => self.partial_close(decision, record).await,
            ActionKind::UpdateStopLoss => self.update_stop_loss(decision, record).await,
            ActionKind::UpdateTakeProfit => self.update_take_profit(decision, record).await,
            ActionKind::Hold | ActionKind::Wait => Ok(()),
            other => Err(ExecutionError::UnknownAction(other.as_str().to_string())),
        }
    }

    async fn open(
        &self,
        decision: &Decision,
        side: PositionSide,
        record: &mut DecisionAction,
    ) -> ExecutionResult<()> {
        let size_usd = decision
            .position_size_usd
            .filter(|size| *size > Decimal::ZERO)
            .ok_or_else(|| {
                ExecutionError::InvalidDecision("position_size_usd must be positive".into())
            })?;
        let leverage = decision
            .leverage
            .filter(|leverage| *leverage > 0)
            .unwrap_or(self.config.default_leverage)
            .max(1);
        record.leverage = leverage;

        let balance = self.exchange.balance().await?;
        let required =
            size_usd / Decimal::from(leverage) + size_usd * self.config.open_fee_rate;
        if balance.available_balance < required {
            return Err(ExecutionError::InsufficientMargin {
                required: required.round_dp(4),
                available: balance.available_balance,
            });
        }

        let positions = self.exchange.positions().await?;
        if positions
            .iter()
            .any(|position| position.symbol == decision.symbol && position.side == side)
        {
            return Err(ExecutionError::PositionConflict {
                symbol: decision.symbol.clone(),
                side,
            });
        }

        let price = self.prices.latest_price(&decision.symbol).await?;
        if price <= Decimal::ZERO {
            return Err(ExecutionError::InvalidDecision(format!(
                "no usable price for {}",
                decision.symbol
            )));
        }
        let quantity = (size_usd / price).round_dp(8);
        let ack = match side {
            PositionSide::Long => {
                self.exchange
                    .open_long(&decision.symbol, quantity, leverage)
                    .await?
            }
            PositionSide::Short => {
                self.exchange
                    .open_short(&decision.symbol, quantity, leverage)
                    .await?
            }
        };
        record.side = Some(side);
        record.quantity = quantity;
        record.price = ack.avg_price.unwrap_or(price);
        record.order_id = Some(ack.order_id);

        if let Some(stop) = decision.stop_loss.filter(|p| *p > Decimal::ZERO) {
            if let Err(err) = self
                .exchange
                .set_stop_loss(&decision.symbol, side, quantity, stop)
                .await
            {
                warn!(symbol = %decision.symbol, stop = %stop, error = %err, "failed to place stop-loss after open");
            }
        }
        if let Some(target) = decision.take_profit.filter(|p| *p > Decimal::ZERO) {
            if let Err(err) = self
                .exchange
                .set_take_profit(&decision.symbol, side, quantity, target)
                .await
            {
                warn!(symbol = %decision.symbol, target = %target, error = %err, "failed to place take-profit after open");
            }
        }
        Ok(())
    }

    async fn close(
        &self,
        decision: &Decision,
        side: PositionSide,
        record: &mut DecisionAction,
    ) -> ExecutionResult<()> {
        let position = self.find_position(&decision.symbol, Some(side)).await?;
        self.close_quantity(&position, position.quantity, record)
            .await
    }

    async fn partial_close(
        &self,
        decision: &Decision,
        record: &mut DecisionAction,
    ) -> ExecutionResult<()> {
        let percentage = decision.close_percentage.unwrap_or_default();
        if percentage <= Decimal::ZERO || percentage > Decimal::ONE_HUNDRED {
            return Err(ExecutionError::InvalidPercentage(percentage));
        }
        let position = self.find_position(&decision.symbol, None).await?;
        let quantity = (position.quantity * percentage / Decimal::ONE_HUNDRED).round_dp(8);
        self.close_quantity(&position, quantity, record).await
    }

    async fn close_quantity(
        &self,
        position: &PositionInfo,
        quantity: Quantity,
        record: &mut DecisionAction,
    ) -> ExecutionResult<()> {
        let price = self.current_price(&position.symbol, Some(position)).await?;
        let ack = match position.side {
            PositionSide::Long => self.exchange.close_long(&position.symbol, quantity).await?,
            PositionSide::Short => self.exchange.close_short(&position.symbol, quantity).await?,
        };
        record.side = Some(position.side);
        record.quantity = quantity;
        record.leverage = position.leverage;
        record.price = ack.avg_price.unwrap_or(price);
        record.order_id = Some(ack.order_id);
        Ok(())
    }

    async fn update_stop_loss(
        &self,
        decision: &Decision,
        record: &mut DecisionAction,
    ) -> ExecutionResult<()> {
        let requested = decision
            .new_stop_loss
            .or(decision.stop_loss)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| ExecutionError::InvalidDecision("new_stop_loss is required".into()))?;
        let position = self.find_position(&decision.symbol, None).await?;
        let price = self.current_price(&decision.symbol, Some(&position)).await?;
        let valid = match position.side {
            PositionSide::Long => requested < price,
            PositionSide::Short => requested > price,
        };
        if !valid {
            return Err(ExecutionError::InvalidStopLoss {
                side: position.side,
                requested,
                price,
            });
        }
        self.exchange
            .set_stop_loss(&position.symbol, position.side, position.quantity, requested)
            .await?;
        fill_update(record, &position, price);
        Ok(())
    }

    async fn update_take_profit(
        &self,
        decision: &Decision,
        record: &mut DecisionAction,
    ) -> ExecutionResult<()> {
        let requested = decision
            .new_take_profit
            .or(decision.take_profit)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| {
                ExecutionError::InvalidDecision("new_take_profit is required".into())
            })?;
        let position = self.find_position(&decision.symbol, None).await?;
        let price = self.current_price(&decision.symbol, Some(&position)).await?;
        let valid = match position.side {
            PositionSide::Long => requested > price,
            PositionSide::Short => requested < price,
        };
        if !valid {
            return Err(ExecutionError::InvalidTakeProfit {
                side: position.side,
                requested,
                price,
            });
        }
        self.exchange
            .set_take_profit(&position.symbol, position.side, position.quantity, requested)
            .await?;
        fill_update(record, &position, price);
        Ok(())
    }

    async fn find_position(
        &self,
        symbol: &str,
        side: Option<PositionSide>,
    ) -> ExecutionResult<PositionInfo> {
        self.exchange
            .positions()
            .await?
            .into_iter()
            .find(|position| {
                position.symbol == symbol && side.map_or(true, |side| position.side == side)
            })
            .ok_or_else(|| ExecutionError::PositionNotFound {
                symbol: symbol.to_string(),
                side,
            })
    }

    /// Latest price, or the position's mark when the price source cannot
    /// answer. Only exposure-reducing paths pass a position.
    async fn current_price(
        &self,
        symbol: &str,
        position: Option<&PositionInfo>,
    ) -> ExecutionResult<Price> {
        match self.prices.latest_price(symbol).await {
            Ok(price) => Ok(price),
            Err(err) => match position {
                Some(position) if position.mark_price > Decimal::ZERO => {
                    warn!(symbol, error = %err, "price unavailable, using position mark");
                    Ok(position.mark_price)
                }
                _ => Err(err.into()),
            },
        }
    }
}

fn fill_update(record: &mut DecisionAction, position: &PositionInfo, price: Price) {
    record.side = Some(position.side);
    record.quantity = position.quantity;
    record.leverage = position.leverage;
    record.price = price;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_rule() {
        let err = ExecutionError::InvalidStopLoss {
            side: PositionSide::Long,
            requested: Decimal::from(51_000),
            price: Decimal::from(50_000),
        };
        assert!(err
            .to_string()
            .contains("long stop-loss must be below current price"));

        let err = ExecutionError::InvalidTakeProfit {
            side: PositionSide::Short,
            requested: Decimal::from(3_100),
            price: Decimal::from(3_000),
        };
        assert!(err
            .to_string()
            .contains("short take-profit must be below current price"));

        let err = ExecutionError::PositionConflict {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Short,
        };
        assert_eq!(err.to_string(), "BTCUSDT already holds short position");

        let err = ExecutionError::PositionNotFound {
            symbol: "BTCUSDT".into(),
            side: None,
        };
        assert_eq!(err.to_string(), "position does not exist: BTCUSDT");
    }

    #[test]
    fn priority_sort_is_stable() {
        let mut decisions = vec![
            Decision::new("SOLUSDT", "open_long"),
            Decision::new("BTCUSDT", "hold"),
            Decision::new("ETHUSDT", "update_stop_loss"),
            Decision::new("BTCUSDT", "close_long"),
            Decision::new("XRPUSDT", "open_short"),
            Decision::new("DOGEUSDT", "partial_close"),
            Decision::new("BNBUSDT", "wait"),
        ];
        sort_by_priority(&mut decisions);
        let order: Vec<(&str, &str)> = decisions
            .iter()
            .map(|d| (d.symbol.as_str(), d.action.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("BTCUSDT", "close_long"),
                ("DOGEUSDT", "partial_close"),
                ("ETHUSDT", "update_stop_loss"),
                ("SOLUSDT", "open_long"),
                ("XRPUSDT", "open_short"),
                ("BTCUSDT", "hold"),
                ("BNBUSDT", "wait"),
            ]
        );
    }
}

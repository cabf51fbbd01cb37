use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use keel_broker::{ExchangeAdapter, ExchangeError, ExchangeResult, OrderAck};
use keel_core::{AccountBalance, PositionInfo, PositionSide, Price, Quantity};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

/// Adapter operations that can be forced to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    Positions,
    Balance,
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    SetStopLoss,
    SetTakeProfit,
}

/// One recorded adapter call.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeCall {
    pub operation: Operation,
    pub symbol: Option<String>,
    pub side: Option<PositionSide>,
    pub quantity: Option<Quantity>,
    pub leverage: Option<u32>,
    pub price: Option<Price>,
}

impl ExchangeCall {
    fn bare(operation: Operation) -> Self {
        Self {
            operation,
            symbol: None,
            side: None,
            quantity: None,
            leverage: None,
            price: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    positions: Vec<PositionInfo>,
    balance: AccountBalance,
    prices: HashMap<String, Price>,
    failures: HashSet<Operation>,
    calls: Vec<ExchangeCall>,
    order_seq: u64,
}

/// In-memory [`ExchangeAdapter`] with a call log and failure toggles.
///
/// Opens add a position filled at the configured symbol price; closes reduce
/// or remove it. Nothing touches the balance, so tests control it directly.
#[derive(Clone)]
pub struct MockExchange {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        let inner = Inner {
            balance: AccountBalance {
                total_equity: Decimal::from(10_000),
                available_balance: Decimal::from(8_000),
                unrealized_pnl: Decimal::ZERO,
            },
            ..Inner::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn set_balance(&self, balance: AccountBalance) {
        self.inner.lock().await.balance = balance;
    }

    pub async fn set_positions(&self, positions: Vec<PositionInfo>) {
        self.inner.lock().await.positions = positions;
    }

    pub async fn positions_snapshot(&self) -> Vec<PositionInfo> {
        self.inner.lock().await.positions.clone()
    }

    /// Fill price for opens and the mark applied to that symbol's positions.
    pub async fn set_price(&self, symbol: &str, price: Price) {
        let mut inner = self.inner.lock().await;
        inner.prices.insert(symbol.to_string(), price);
        for position in inner.positions.iter_mut().filter(|p| p.symbol == symbol) {
            position.mark_price = price;
        }
    }

    pub async fn fail(&self, operation: Operation, enabled: bool) {
        let mut inner = self.inner.lock().await;
        if enabled {
            inner.failures.insert(operation);
        } else {
            inner.failures.remove(&operation);
        }
    }

    pub async fn calls(&self) -> Vec<ExchangeCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn calls_of(&self, operation: Operation) -> Vec<ExchangeCall> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    /// Calls that would change exchange state.
    pub async fn mutating_calls(&self) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| !matches!(call.operation, Operation::Positions | Operation::Balance))
            .count()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    async fn record(&self, call: ExchangeCall) -> ExchangeResult<()> {
        let mut inner = self.inner.lock().await;
        let operation = call.operation;
        inner.calls.push(call);
        if inner.failures.contains(&operation) {
            return Err(ExchangeError::Rejected(format!(
                "mock failure for {operation:?}"
            )));
        }
        Ok(())
    }

    async fn open(
        &self,
        operation: Operation,
        side: PositionSide,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.record(ExchangeCall {
            operation,
            symbol: Some(symbol.to_string()),
            side: Some(side),
            quantity: Some(quantity),
            leverage: Some(leverage),
            price: None,
        })
        .await?;
        let mut inner = self.inner.lock().await;
        let price = inner.prices.get(symbol).copied().unwrap_or_default();
        inner.positions.push(PositionInfo {
            symbol: symbol.to_string(),
            side,
            entry_price: price,
            mark_price: price,
            quantity,
            leverage,
            stop_loss: None,
            take_profit: None,
            liquidation_price: None,
        });
        inner.order_seq += 1;
        let mut ack = OrderAck::new(format!("mock-{}", inner.order_seq));
        ack.avg_price = (price > Decimal::ZERO).then_some(price);
        Ok(ack)
    }

    async fn close(
        &self,
        operation: Operation,
        side: PositionSide,
        symbol: &str,
        quantity: Quantity,
    ) -> ExchangeResult<OrderAck> {
        self.record(ExchangeCall {
            operation,
            symbol: Some(symbol.to_string()),
            side: Some(side),
            quantity: Some(quantity),
            leverage: None,
            price: None,
        })
        .await?;
        let mut inner = self.inner.lock().await;
        let Some(index) = inner
            .positions
            .iter()
            .position(|p| p.symbol == symbol && p.side == side)
        else {
            return Err(ExchangeError::InvalidRequest(format!(
                "no {side} position for {symbol}"
            )));
        };
        let remaining = inner.positions[index].quantity - quantity;
        if remaining <= Decimal::ZERO {
            inner.positions.remove(index);
        } else {
            inner.positions[index].quantity = remaining;
        }
        inner.order_seq += 1;
        Ok(OrderAck::new(format!("mock-{}", inner.order_seq)))
    }

    async fn protect(
        &self,
        operation: Operation,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()> {
        self.record(ExchangeCall {
            operation,
            symbol: Some(symbol.to_string()),
            side: Some(side),
            quantity: Some(quantity),
            leverage: None,
            price: Some(price),
        })
        .await?;
        let mut inner = self.inner.lock().await;
        if let Some(position) = inner
            .positions
            .iter_mut()
            .find(|p| p.symbol == symbol && p.side == side)
        {
            match operation {
                Operation::SetStopLoss => position.stop_loss = Some(price),
                _ => position.take_profit = Some(price),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        self.record(ExchangeCall::bare(Operation::Positions)).await?;
        Ok(self.inner.lock().await.positions.clone())
    }

    async fn balance(&self) -> ExchangeResult<AccountBalance> {
        self.record(ExchangeCall::bare(Operation::Balance)).await?;
        Ok(self.inner.lock().await.balance.clone())
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(Operation::OpenLong, PositionSide::Long, symbol, quantity, leverage)
            .await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: Quantity,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(Operation::OpenShort, PositionSide::Short, symbol, quantity, leverage)
            .await
    }

    async fn close_long(&self, symbol: &str, quantity: Quantity) -> ExchangeResult<OrderAck> {
        self.close(Operation::CloseLong, PositionSide::Long, symbol, quantity)
            .await
    }

    async fn close_short(&self, symbol: &str, quantity: Quantity) -> ExchangeResult<OrderAck> {
        self.close(Operation::CloseShort, PositionSide::Short, symbol, quantity)
            .await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()> {
        self.protect(Operation::SetStopLoss, symbol, side, quantity, price)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Quantity,
        price: Price,
    ) -> ExchangeResult<()> {
        self.protect(Operation::SetTakeProfit, symbol, side, quantity, price)
            .await
    }
}

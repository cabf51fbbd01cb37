use std::sync::Arc;

use keel_core::{AccountBalance, ActionKind, Decision, PositionInfo, PositionSide};
use keel_execution::{DecisionExecutor, ExecutionConfig};
use keel_test_utils::{FixedPrices, MockExchange, Operation};
use rust_decimal::Decimal;

fn setup() -> (MockExchange, FixedPrices, DecisionExecutor) {
    let exchange = MockExchange::new();
    let prices = FixedPrices::new()
        .with("BTCUSDT", Decimal::from(50_000))
        .with("ETHUSDT", Decimal::from(3_000));
    let executor = DecisionExecutor::new(
        Arc::new(exchange.clone()),
        Arc::new(prices.clone()),
        ExecutionConfig::default(),
    );
    (exchange, prices, executor)
}

fn position(symbol: &str, side: PositionSide, entry: i64, quantity: Decimal) -> PositionInfo {
    PositionInfo {
        symbol: symbol.to_string(),
        side,
        entry_price: Decimal::from(entry),
        mark_price: Decimal::from(entry),
        quantity,
        leverage: 10,
        stop_loss: None,
        take_profit: None,
        liquidation_price: None,
    }
}

fn open(symbol: &str, action: &str, size_usd: i64, leverage: u32) -> Decision {
    let mut decision = Decision::new(symbol, action);
    decision.position_size_usd = Some(Decimal::from(size_usd));
    decision.leverage = Some(leverage);
    decision
}

#[tokio::test]
async fn open_long_sizes_from_current_price() {
    let (exchange, _, executor) = setup();
    exchange.set_price("BTCUSDT", Decimal::from(50_000)).await;

    let record = executor.execute(&open("BTCUSDT", "open_long", 1_000, 10)).await;
    assert!(record.success, "{:?}", record.error);
    assert_eq!(record.side, Some(PositionSide::Long));
    assert_eq!(record.quantity, Decimal::new(2, 2));
    assert_eq!(record.price, Decimal::from(50_000));
    assert_eq!(record.leverage, 10);
    assert_eq!(record.order_id.as_deref(), Some("mock-1"));

    let opens = exchange.calls_of(Operation::OpenLong).await;
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].quantity, Some(Decimal::new(2, 2)));
    assert_eq!(opens[0].leverage, Some(10));
}

#[tokio::test]
async fn open_places_protective_orders() {
    let (exchange, _, executor) = setup();
    let mut decision = open("ETHUSDT", "open_short", 600, 5);
    decision.stop_loss = Some(Decimal::from(3_150));
    decision.take_profit = Some(Decimal::from(2_700));

    let record = executor.execute(&decision).await;
    assert!(record.success);
    assert_eq!(record.quantity, Decimal::new(2, 1));
    let stops = exchange.calls_of(Operation::SetStopLoss).await;
    assert_eq!(stops[0].price, Some(Decimal::from(3_150)));
    assert_eq!(stops[0].side, Some(PositionSide::Short));
    let targets = exchange.calls_of(Operation::SetTakeProfit).await;
    assert_eq!(targets[0].price, Some(Decimal::from(2_700)));
}

#[tokio::test]
async fn protective_order_failure_does_not_fail_open() {
    let (exchange, _, executor) = setup();
    exchange.fail(Operation::SetStopLoss, true).await;
    let mut decision = open("BTCUSDT", "open_long", 1_000, 10);
    decision.stop_loss = Some(Decimal::from(48_000));

    let record = executor.execute(&decision).await;
    assert!(record.success);
    assert_eq!(exchange.positions_snapshot().await.len(), 1);
}

#[tokio::test]
async fn open_without_leverage_uses_default() {
    let (exchange, _, executor) = setup();
    let mut decision = Decision::new("BTCUSDT", "open_long");
    decision.position_size_usd = Some(Decimal::from(500));

    let record = executor.execute(&decision).await;
    assert!(record.success);
    assert_eq!(record.leverage, 5);
    assert_eq!(exchange.calls_of(Operation::OpenLong).await[0].leverage, Some(5));
}

#[tokio::test]
async fn insufficient_margin_rejects_before_ordering() {
    let (exchange, _, executor) = setup();
    exchange
        .set_balance(AccountBalance {
            total_equity: Decimal::from(100),
            available_balance: Decimal::from(50),
            unrealized_pnl: Decimal::ZERO,
        })
        .await;

    let record = executor.execute(&open("BTCUSDT", "open_long", 1_000, 10)).await;
    assert!(!record.success);
    assert!(record.error.unwrap().contains("insufficient margin"));
    assert_eq!(exchange.mutating_calls().await, 0);
}

#[tokio::test]
async fn fee_reserve_counts_toward_margin() {
    let (exchange, _, executor) = setup();
    // 100 initial margin + 0.4 fee reserve
    exchange
        .set_balance(AccountBalance {
            total_equity: Decimal::from(100),
            available_balance: Decimal::new(1003, 1),
            unrealized_pnl: Decimal::ZERO,
        })
        .await;
    let record = executor.execute(&open("BTCUSDT", "open_long", 1_000, 10)).await;
    assert!(record.error.unwrap().contains("insufficient margin"));
}

#[tokio::test]
async fn same_side_open_conflicts() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1))])
        .await;

    let record = executor.execute(&open("BTCUSDT", "open_long", 1_000, 10)).await;
    assert!(record.error.unwrap().contains("already holds long"));
    assert_eq!(exchange.mutating_calls().await, 0);

    let record = executor.execute(&open("BTCUSDT", "open_short", 1_000, 10)).await;
    assert!(record.success);
}

#[tokio::test]
async fn close_long_closes_full_quantity() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1))])
        .await;

    let record = executor.execute(&Decision::new("BTCUSDT", "close_long")).await;
    assert!(record.success);
    assert_eq!(record.quantity, Decimal::new(1, 1));
    assert_eq!(record.price, Decimal::from(50_000));
    assert!(exchange.positions_snapshot().await.is_empty());
}

#[tokio::test]
async fn close_without_position_is_not_found() {
    let (exchange, _, executor) = setup();
    let record = executor.execute(&Decision::new("ETHUSDT", "close_short")).await;
    assert!(!record.success);
    assert!(record.error.unwrap().contains("position does not exist"));
    assert_eq!(exchange.mutating_calls().await, 0);
}

#[tokio::test]
async fn close_falls_back_to_mark_when_price_is_unavailable() {
    let (exchange, _, executor) = setup();
    let mut sol = position("SOLUSDT", PositionSide::Short, 100, Decimal::from(3));
    sol.mark_price = Decimal::from(95);
    exchange.set_positions(vec![sol]).await;

    let record = executor.execute(&Decision::new("SOLUSDT", "close_short")).await;
    assert!(record.success);
    assert_eq!(record.price, Decimal::from(95));
}

#[tokio::test]
async fn partial_close_halves_position() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1))])
        .await;
    let mut decision = Decision::new("BTCUSDT", "partial_close");
    decision.close_percentage = Some(Decimal::from(50));

    let record = executor.execute(&decision).await;
    assert!(record.success);
    assert_eq!(record.quantity, Decimal::new(5, 2));
    let closes = exchange.calls_of(Operation::CloseLong).await;
    assert_eq!(closes[0].quantity, Some(Decimal::new(5, 2)));
    assert_eq!(exchange.positions_snapshot().await[0].quantity, Decimal::new(5, 2));
}

#[tokio::test]
async fn partial_close_rejects_out_of_range_percentage() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1))])
        .await;

    for pct in [Decimal::from(150), Decimal::ZERO, Decimal::from(-10)] {
        let mut decision = Decision::new("BTCUSDT", "partial_close");
        decision.close_percentage = Some(pct);
        let record = executor.execute(&decision).await;
        assert!(record
            .error
            .unwrap()
            .contains("close percentage must be between 0 and 100"));
    }
    assert!(exchange.calls().await.is_empty());
}

#[tokio::test]
async fn long_stop_loss_must_sit_below_price() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1))])
        .await;

    let mut decision = Decision::new("BTCUSDT", "update_stop_loss");
    decision.new_stop_loss = Some(Decimal::from(51_000));
    let record = executor.execute(&decision).await;
    assert!(record
        .error
        .unwrap()
        .contains("long stop-loss must be below current price"));
    assert!(exchange.calls_of(Operation::SetStopLoss).await.is_empty());

    decision.new_stop_loss = Some(Decimal::from(49_000));
    let record = executor.execute(&decision).await;
    assert!(record.success);
    assert_eq!(record.side, Some(PositionSide::Long));
    assert_eq!(record.price, Decimal::from(50_000));
    let stops = exchange.calls_of(Operation::SetStopLoss).await;
    assert_eq!(stops[0].price, Some(Decimal::from(49_000)));
    assert_eq!(stops[0].quantity, Some(Decimal::new(1, 1)));
}

#[tokio::test]
async fn short_stop_loss_must_sit_above_price() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("ETHUSDT", PositionSide::Short, 3_050, Decimal::ONE)])
        .await;

    let mut decision = Decision::new("ETHUSDT", "update_stop_loss");
    decision.new_stop_loss = Some(Decimal::from(2_900));
    let record = executor.execute(&decision).await;
    assert!(record
        .error
        .unwrap()
        .contains("short stop-loss must be above current price"));

    decision.new_stop_loss = Some(Decimal::from(3_100));
    assert!(executor.execute(&decision).await.success);
}

#[tokio::test]
async fn take_profit_direction_is_enforced() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![
            position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1)),
            position("ETHUSDT", PositionSide::Short, 3_050, Decimal::ONE),
        ])
        .await;

    let mut long_tp = Decision::new("BTCUSDT", "update_take_profit");
    long_tp.new_take_profit = Some(Decimal::from(49_500));
    assert!(!executor.execute(&long_tp).await.success);
    long_tp.new_take_profit = Some(Decimal::from(55_000));
    assert!(executor.execute(&long_tp).await.success);

    let mut short_tp = Decision::new("ETHUSDT", "update_take_profit");
    short_tp.new_take_profit = Some(Decimal::from(3_200));
    assert!(!executor.execute(&short_tp).await.success);
    short_tp.new_take_profit = Some(Decimal::from(2_800));
    assert!(executor.execute(&short_tp).await.success);

    assert_eq!(exchange.calls_of(Operation::SetTakeProfit).await.len(), 2);
}

#[tokio::test]
async fn update_without_position_does_not_exist() {
    let (_, _, executor) = setup();
    let mut decision = Decision::new("BTCUSDT", "update_stop_loss");
    decision.new_stop_loss = Some(Decimal::from(49_000));
    let record = executor.execute(&decision).await;
    assert!(record.error.unwrap().contains("position does not exist"));
}

#[tokio::test]
async fn hold_and_wait_make_no_calls() {
    let (exchange, _, executor) = setup();
    assert!(executor.execute(&Decision::new("BTCUSDT", "hold")).await.success);
    assert!(executor.execute(&Decision::new("BTCUSDT", "wait")).await.success);
    assert!(exchange.calls().await.is_empty());
}

#[tokio::test]
async fn unknown_and_reconciliation_actions_are_rejected() {
    let (exchange, _, executor) = setup();
    let record = executor.execute(&Decision::new("BTCUSDT", "moon")).await;
    assert_eq!(record.action, ActionKind::Unknown("moon".into()));
    assert!(record.error.unwrap().contains("unknown action"));

    let record = executor
        .execute(&Decision::new("BTCUSDT", "auto_close_long"))
        .await;
    assert!(record.error.unwrap().contains("unknown action"));
    assert!(exchange.calls().await.is_empty());
}

#[tokio::test]
async fn batch_closes_before_opening_and_continues_on_failure() {
    let (exchange, _, executor) = setup();
    exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, 49_000, Decimal::new(1, 1))])
        .await;

    let mut stop = Decision::new("BTCUSDT", "update_stop_loss");
    stop.new_stop_loss = Some(Decimal::from(48_000));
    let decisions = vec![
        open("ETHUSDT", "open_long", 300, 5),
        Decision::new("BTCUSDT", "hold"),
        stop,
        Decision::new("BTCUSDT", "close_long"),
    ];

    let records = executor.execute_batch(&decisions).await;
    let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(
        actions,
        vec!["close_long", "update_stop_loss", "open_long", "hold"]
    );
    assert!(records[0].success);
    // the stop update runs after the close, so its position is gone
    assert!(!records[1].success);
    assert!(records[2].success);
    assert!(records[3].success);
}

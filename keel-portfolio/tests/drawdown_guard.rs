use keel_core::{ActionKind, PositionInfo, PositionSide};
use keel_portfolio::DrawdownGuard;
use keel_test_utils::{MockExchange, Operation};
use rust_decimal::Decimal;

fn btc_long(mark: i64) -> PositionInfo {
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

fn eth_short(mark: i64) -> PositionInfo {
    PositionInfo {
        symbol: "ETHUSDT".into(),
        side: PositionSide::Short,
        entry_price: Decimal::from(3_000),
        mark_price: Decimal::from(mark),
        quantity: Decimal::new(5, 1),
        leverage: 10,
        stop_loss: None,
        take_profit: None,
        liquidation_price: None,
    }
}

#[tokio::test]
async fn positions_failure_is_swallowed() {
    let exchange = MockExchange::new();
    exchange.fail(Operation::Positions, true).await;
    let mut guard = DrawdownGuard::default();
    assert!(guard.check(&exchange).await.is_empty());
    assert_eq!(exchange.mutating_calls().await, 0);
}

#[tokio::test]
async fn no_positions_is_a_no_op() {
    let exchange = MockExchange::new();
    let mut guard = DrawdownGuard::default();
    assert!(guard.check(&exchange).await.is_empty());
    assert!(guard.peaks().is_empty());
}

#[tokio::test]
async fn long_retrace_closes_and_clears_peak() {
    let exchange = MockExchange::new();
    exchange.set_positions(vec![btc_long(50_300)]).await;
    let mut guard = DrawdownGuard::default();
    guard.peaks_mut().update("BTCUSDT_long", Decimal::from(10));

    let actions = guard.check(&exchange).await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, ActionKind::CloseLong);
    assert!(actions[0].success);
    assert_eq!(guard.peaks().get("BTCUSDT_long"), None);

    let closes = exchange.calls_of(Operation::CloseLong).await;
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].quantity, Some(Decimal::new(1, 1)));
    assert!(exchange.positions_snapshot().await.is_empty());
}

#[tokio::test]
async fn short_retrace_closes_and_clears_peak() {
    let exchange = MockExchange::new();
    exchange.set_positions(vec![eth_short(2_982)]).await;
    let mut guard = DrawdownGuard::default();
    guard.peaks_mut().update("ETHUSDT_short", Decimal::from(10));

    let actions = guard.check(&exchange).await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, ActionKind::CloseShort);
    assert!(actions[0].success);
    assert_eq!(guard.peaks().get("ETHUSDT_short"), None);
}

#[tokio::test]
async fn failed_close_keeps_peak_for_retry() {
    let exchange = MockExchange::new();
    exchange.set_positions(vec![btc_long(50_300)]).await;
    exchange.fail(Operation::CloseLong, true).await;
    let mut guard = DrawdownGuard::default();
    guard.peaks_mut().update("BTCUSDT_long", Decimal::from(10));

    let actions = guard.check(&exchange).await;
    assert_eq!(actions.len(), 1);
    assert!(!actions[0].success);
    assert!(actions[0].error.is_some());
    assert_eq!(guard.peaks().get("BTCUSDT_long"), Some(Decimal::from(10)));

    exchange.fail(Operation::CloseLong, false).await;
    let actions = guard.check(&exchange).await;
    assert!(actions[0].success);
    assert_eq!(guard.peaks().get("BTCUSDT_long"), None);
}

#[tokio::test]
async fn shallow_retrace_keeps_position_open() {
    let exchange = MockExchange::new();
    exchange.set_positions(vec![btc_long(50_400)]).await;
    let mut guard = DrawdownGuard::default();
    guard.peaks_mut().update("BTCUSDT_long", Decimal::from(10));

    assert!(guard.check(&exchange).await.is_empty());
    assert_eq!(exchange.mutating_calls().await, 0);
    assert_eq!(guard.peaks().get("BTCUSDT_long"), Some(Decimal::from(10)));
}

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use keel_cli::{AutoTrader, TraderSettings};
use keel_core::{ActionKind, Interval};
use keel_journal::{read_records, DecisionJournal, JsonlJournal};
use keel_markets::{CacheSettings, MarketDataCache};
use keel_test_utils::{MockExchange, ScriptedAdvisor, StaticCandles};
use rust_decimal::Decimal;

#[tokio::test]
async fn cycles_are_persisted_to_trader_journal_file() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(JsonlJournal::open(dir.path(), "alpha").unwrap());
    let exchange = MockExchange::new();
    exchange.set_price("BTCUSDT", Decimal::from(50_000)).await;
    let advisor = ScriptedAdvisor::new().reply(
        "[{\"symbol\": \"BTCUSDT\", \"action\": \"open_long\", \"leverage\": 5, \
          \"position_size_usd\": 1000, \"stop_loss\": 48000}]",
    );
    let cache = Arc::new(MarketDataCache::new(
        Arc::new(StaticCandles::new().with_price("BTCUSDT", Decimal::from(50_000))),
        CacheSettings {
            capacity: 50,
            max_age: ChronoDuration::minutes(15),
            pull_limit: 50,
            price_interval: Interval::ThreeMinutes,
        },
    ));
    let mut settings = TraderSettings::new("alpha");
    settings.initial_balance = Decimal::from(10_000);
    settings.intervals = vec![Interval::ThreeMinutes];
    let trader = AutoTrader::new(
        settings,
        Arc::new(exchange),
        Arc::new(advisor),
        cache,
        journal.clone(),
    );

    trader.execute_decision_cycle().await.unwrap();
    trader.execute_decision_cycle().await.unwrap();

    let on_disk = read_records(dir.path().join("alpha.jsonl")).unwrap();
    let cycles: Vec<u64> = on_disk.iter().map(|r| r.cycle_number).collect();
    assert_eq!(cycles, vec![1, 2]);
    assert_eq!(on_disk[0].decisions[0].action, ActionKind::OpenLong);
    assert!(on_disk[0].decisions[0].success);
    assert_eq!(on_disk[1].positions.len(), 1);
    let retained: Vec<u64> = journal
        .recent(10)
        .unwrap()
        .iter()
        .map(|r| r.cycle_number)
        .collect();
    assert_eq!(retained, cycles);

    let reopened = JsonlJournal::open(dir.path(), "alpha").unwrap();
    let last = reopened.recent(1).unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].cycle_number, 2);
    assert_eq!(last[0].positions.len(), 1);
}

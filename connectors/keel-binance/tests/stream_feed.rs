use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use keel_binance::{kline_topic, BinanceCombinedProtocol, BinanceKlineCodec};
use keel_core::Interval;
use keel_markets::{CacheSettings, KlineFeed, MarketDataCache, PriceSource};
use keel_stream::{StreamSettings, StreamSubscriptionManager, WsConnector};
use keel_test_utils::{kline_frame, MockStreamServer, StaticCandles};
use rust_decimal::Decimal;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn current_open_ms(interval: Interval) -> i64 {
    let step = interval.as_duration().num_milliseconds();
    let now = Utc::now().timestamp_millis();
    now - now % step
}

#[tokio::test]
async fn streamed_klines_update_cache_across_reconnects() {
    let server = MockStreamServer::spawn().await.unwrap();
    let candles = StaticCandles::new().with_price("BTCUSDT", Decimal::from(50_000));
    let cache = Arc::new(MarketDataCache::new(
        Arc::new(candles.clone()),
        CacheSettings {
            capacity: 20,
            max_age: ChronoDuration::minutes(15),
            pull_limit: 20,
            price_interval: Interval::ThreeMinutes,
        },
    ));
    let manager = Arc::new(
        StreamSubscriptionManager::connect(
            Arc::new(WsConnector::new(server.url())),
            Arc::new(BinanceCombinedProtocol),
            StreamSettings {
                batch_delay: Duration::from_millis(10),
                reconnect_backoff: Duration::from_millis(100),
                ..StreamSettings::default()
            },
        )
        .await
        .unwrap(),
    );
    let _feed = KlineFeed::attach(manager.clone(), Arc::new(BinanceKlineCodec), &cache);
    let topic = kline_topic("BTCUSDT", Interval::ThreeMinutes);

    // A miss pulls once over REST and asks the feed to subscribe.
    assert_eq!(cache.latest_price("BTCUSDT").await.unwrap(), Decimal::from(50_000));
    assert_eq!(candles.pulls(), 1);
    let topics = server.wait_for_subscriptions(0, 1, WAIT).await;
    assert_eq!(topics, vec![topic.clone()]);

    let open_ms = current_open_ms(Interval::ThreeMinutes);
    server.push(kline_frame("BTCUSDT", Interval::ThreeMinutes, open_ms, Decimal::from(51_000)));
    eventually(|| {
        let cache = cache.clone();
        async move { cache.latest_price("BTCUSDT").await.ok() == Some(Decimal::from(51_000)) }
    })
    .await;

    server.drop_connections();
    eventually(|| async { server.connection_count() >= 2 }).await;
    let replayed = server.wait_for_subscriptions(1, 1, WAIT).await;
    assert_eq!(replayed, vec![topic]);
    eventually(|| async { manager.is_connected() }).await;
    assert!(manager.reconnect_count() >= 1);

    server.push(kline_frame("BTCUSDT", Interval::ThreeMinutes, open_ms, Decimal::from(52_000)));
    eventually(|| {
        let cache = cache.clone();
        async move { cache.latest_price("BTCUSDT").await.ok() == Some(Decimal::from(52_000)) }
    })
    .await;
    assert_eq!(candles.pulls(), 1, "streamed updates must not trigger pulls");

    manager.shutdown().await;
}

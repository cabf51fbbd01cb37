use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use keel_broker::CandleSource;
use keel_core::{Candle, Interval, Price};
use tracing::{debug, info, warn};

use crate::{
    MarketDataError, MarketDataResult, PriceSource, StaleDataError, SubscriptionRequester,
};

#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct CacheKey {
    pub symbol: String,
    pub interval: Interval,
}

impl CacheKey {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            interval,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    /// Candles retained per key; the oldest is evicted first.
    pub capacity: usize,
    /// Reads of entries older than this fail with [`StaleDataError`].
    pub max_age: Duration,
    /// Candles requested by a pull on a cache miss or during seeding.
    pub pull_limit: usize,
    /// Interval whose last close is reported as the latest price.
    pub price_interval: Interval,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_age: Duration::minutes(15),
            pull_limit: 100,
            price_interval: Interval::ThreeMinutes,
        }
    }
}

struct CacheEntry {
    candles: VecDeque<Candle>,
    received_at: DateTime<Utc>,
}

/// Age and size of one cached key, for monitoring.
#[derive(Clone, Debug)]
pub struct EntryFreshness {
    pub key: CacheKey,
    pub age: Duration,
    pub candles: usize,
}

/// Outcome of a bulk seed.
#[derive(Debug, Default)]
pub struct SeedReport {
    pub seeded: usize,
    pub failed: Vec<(CacheKey, MarketDataError)>,
}

/// Per-symbol/interval candle cache with key-scoped locking.
///
/// The map itself only guards key lookup; each entry carries its own
/// read/write lock so ingestion for one key never blocks readers of another.
pub struct MarketDataCache {
    entries: DashMap<CacheKey, Arc<RwLock<CacheEntry>>>,
    source: Arc<dyn CandleSource>,
    settings: CacheSettings,
    subscriptions: OnceLock<Arc<dyn SubscriptionRequester>>,
}

impl MarketDataCache {
    pub fn new(source: Arc<dyn CandleSource>, settings: CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            source,
            settings,
            subscriptions: OnceLock::new(),
        }
    }

    /// Install the hook used to start streaming keys first seen on a miss.
    /// Only the first call has an effect.
    pub fn set_subscription_requester(&self, requester: Arc<dyn SubscriptionRequester>) -> bool {
        self.subscriptions.set(requester).is_ok()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Recent candles for a key, oldest first.
    pub async fn get(&self, symbol: &str, interval: Interval) -> MarketDataResult<Vec<Candle>> {
        self.get_at(symbol, interval, Utc::now()).await
    }

    /// [`get`](Self::get) evaluated at an explicit instant.
    ///
    /// A hit older than `max_age` is an error, never a fallback pull. A miss
    /// pulls once, seeds the entry, and asks for a subscription.
    pub async fn get_at(
        &self,
        symbol: &str,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> MarketDataResult<Vec<Candle>> {
        let key = CacheKey::new(symbol, interval);
        if let Some(result) = self.lookup(&key, now) {
            return result;
        }

        debug!(symbol = %key.symbol, %interval, "cache miss; pulling candles");
        let candles = self
            .source
            .candles(&key.symbol, interval, self.settings.pull_limit)
            .await?;
        let kept = self.keep_recent(candles);
        self.entries.entry(key.clone()).or_insert_with(|| {
            Arc::new(RwLock::new(CacheEntry {
                candles: kept.iter().cloned().collect(),
                received_at: now,
            }))
        });
        if let Some(requester) = self.subscriptions.get() {
            requester.ensure_subscribed(&key.symbol, interval).await;
        }
        Ok(kept)
    }

    fn lookup(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<MarketDataResult<Vec<Candle>>> {
        let entry = self.entries.get(key).map(|entry| entry.value().clone())?;
        let entry = entry.read().unwrap_or_else(PoisonError::into_inner);
        let age = now - entry.received_at;
        if age > self.settings.max_age {
            let err = StaleDataError {
                symbol: key.symbol.clone(),
                interval: key.interval,
                age_minutes: age.num_milliseconds() as f64 / 60_000.0,
            };
            warn!(symbol = %key.symbol, interval = %key.interval, age_minutes = err.age_minutes, "refusing stale market data");
            return Some(Err(err.into()));
        }
        Some(Ok(entry.candles.iter().cloned().collect()))
    }

    fn keep_recent(&self, mut candles: Vec<Candle>) -> Vec<Candle> {
        let capacity = self.settings.capacity.max(1);
        if candles.len() > capacity {
            candles.drain(..candles.len() - capacity);
        }
        candles
    }

    /// Replace an entry wholesale, stamped at `received_at`.
    pub fn insert(&self, key: CacheKey, candles: Vec<Candle>, received_at: DateTime<Utc>) {
        let candles = self.keep_recent(candles).into_iter().collect();
        self.entries.insert(
            key,
            Arc::new(RwLock::new(CacheEntry {
                candles,
                received_at,
            })),
        );
    }

    /// Apply one streamed candle.
    pub fn apply_update(&self, candle: Candle) {
        self.apply_update_at(candle, Utc::now());
    }

    /// A candle whose open time matches the last stored bar replaces it in
    /// place; any other candle is appended, evicting the oldest past capacity.
    pub fn apply_update_at(&self, candle: Candle, now: DateTime<Utc>) {
        let key = CacheKey::new(&candle.symbol, candle.interval);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RwLock::new(CacheEntry {
                    candles: VecDeque::new(),
                    received_at: now,
                }))
            })
            .value()
            .clone();

        let mut entry = entry.write().unwrap_or_else(PoisonError::into_inner);
        match entry.candles.back_mut() {
            Some(last) if last.open_time == candle.open_time => *last = candle,
            _ => {
                entry.candles.push_back(candle);
                while entry.candles.len() > self.settings.capacity.max(1) {
                    entry.candles.pop_front();
                }
            }
        }
        entry.received_at = now;
    }

    /// Pull and store every key, at most `concurrency` pulls at a time.
    /// Failures are reported, not raised; those keys fall back to pull-on-miss.
    pub async fn seed_all(&self, keys: Vec<CacheKey>, concurrency: usize) -> SeedReport {
        let limit = self.settings.pull_limit;
        let results: Vec<_> = stream::iter(keys)
            .map(|key| async move {
                let result = self.source.candles(&key.symbol, key.interval, limit).await;
                (key, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = SeedReport::default();
        for (key, result) in results {
            match result {
                Ok(candles) => {
                    self.insert(key, candles, Utc::now());
                    report.seeded += 1;
                }
                Err(err) => {
                    warn!(symbol = %key.symbol, interval = %key.interval, error = %err, "failed to seed candles; using pull-on-miss");
                    report.failed.push((key, err.into()));
                }
            }
        }
        info!(
            seeded = report.seeded,
            failed = report.failed.len(),
            "market data cache seeded"
        );
        report
    }

    /// Age and size of every entry at `now`, ordered by key.
    pub fn freshness(&self, now: DateTime<Utc>) -> Vec<EntryFreshness> {
        let mut rows: Vec<EntryFreshness> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item.value().read().unwrap_or_else(PoisonError::into_inner);
                EntryFreshness {
                    key: item.key().clone(),
                    age: now - entry.received_at,
                    candles: entry.candles.len(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PriceSource for MarketDataCache {
    async fn latest_price(&self, symbol: &str) -> MarketDataResult<Price> {
        let interval = self.settings.price_interval;
        let candles = self.get(symbol, interval).await?;
        candles
            .last()
            .map(|candle| candle.close)
            .ok_or_else(|| MarketDataError::Empty {
                symbol: symbol.to_string(),
                interval,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use keel_broker::{ExchangeError, ExchangeResult};
    use rust_decimal::Decimal;

    use super::*;

    fn candle(symbol: &str, minute: i64, close: i64) -> Candle {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let open_time = base + Duration::minutes(minute * 3);
        Candle {
            symbol: symbol.to_string(),
            interval: Interval::ThreeMinutes,
            open_time,
            close_time: open_time + Duration::minutes(3),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
        }
    }

    #[derive(Default)]
    struct CountingSource {
        pulls: AtomicUsize,
    }

    #[async_trait]
    impl CandleSource for CountingSource {
        async fn candles(
            &self,
            symbol: &str,
            _interval: Interval,
            limit: usize,
        ) -> ExchangeResult<Vec<Candle>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if symbol == "BADUSDT" {
                return Err(ExchangeError::Transport("timeout".into()));
            }
            Ok((0..limit as i64 + 5).map(|i| candle(symbol, i, 100 + i)).collect())
        }
    }

    #[derive(Default)]
    struct RecordingRequester {
        requests: Mutex<Vec<(String, Interval)>>,
    }

    #[async_trait]
    impl SubscriptionRequester for RecordingRequester {
        async fn ensure_subscribed(&self, symbol: &str, interval: Interval) {
            self.requests
                .lock()
                .unwrap()
                .push((symbol.to_string(), interval));
        }
    }

    fn cache_with(source: Arc<CountingSource>, capacity: usize) -> MarketDataCache {
        MarketDataCache::new(
            source,
            CacheSettings {
                capacity,
                pull_limit: capacity,
                ..CacheSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn staleness_boundary_is_inclusive_at_fifteen_minutes() {
        let cache = cache_with(Arc::new(CountingSource::default()), 10);
        let t0 = Utc::now();
        cache.insert(
            CacheKey::new("BTCUSDT", Interval::ThreeMinutes),
            vec![candle("BTCUSDT", 0, 100)],
            t0,
        );

        let fresh = cache
            .get_at("BTCUSDT", Interval::ThreeMinutes, t0 + Duration::minutes(15))
            .await;
        assert!(fresh.is_ok());

        let stale = cache
            .get_at(
                "BTCUSDT",
                Interval::ThreeMinutes,
                t0 + Duration::minutes(15) + Duration::seconds(1),
            )
            .await
            .unwrap_err();
        match stale {
            MarketDataError::Stale(err) => {
                assert_eq!(err.symbol, "BTCUSDT");
                assert_eq!(err.interval, Interval::ThreeMinutes);
                assert!(err.age_minutes > 15.0);
            }
            other => panic!("expected stale error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_hit_never_pulls() {
        let source = Arc::new(CountingSource::default());
        let cache = cache_with(source.clone(), 10);
        let t0 = Utc::now() - Duration::hours(1);
        cache.insert(
            CacheKey::new("BTCUSDT", Interval::ThreeMinutes),
            vec![candle("BTCUSDT", 0, 100)],
            t0,
        );
        assert!(cache.get("BTCUSDT", Interval::ThreeMinutes).await.is_err());
        assert_eq!(source.pulls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn returned_candles_are_a_copy() {
        let cache = cache_with(Arc::new(CountingSource::default()), 10);
        cache.insert(
            CacheKey::new("ETHUSDT", Interval::ThreeMinutes),
            vec![candle("ETHUSDT", 0, 100), candle("ETHUSDT", 1, 101)],
            Utc::now(),
        );

        let mut first = cache.get("ETHUSDT", Interval::ThreeMinutes).await.unwrap();
        first[0].close = Decimal::ZERO;
        first.clear();

        let second = cache.get("ETHUSDT", Interval::ThreeMinutes).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].close, Decimal::from(100));
    }

    #[tokio::test]
    async fn miss_pulls_once_seeds_and_requests_subscription() {
        let source = Arc::new(CountingSource::default());
        let cache = cache_with(source.clone(), 10);
        let requester = Arc::new(RecordingRequester::default());
        assert!(cache.set_subscription_requester(requester.clone()));

        let pulled = cache.get("solusdt", Interval::ThreeMinutes).await.unwrap();
        assert_eq!(pulled.len(), 10);
        let again = cache.get("SOLUSDT", Interval::ThreeMinutes).await.unwrap();
        assert_eq!(pulled, again);

        assert_eq!(source.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(
            requester.requests.lock().unwrap().clone(),
            vec![("SOLUSDT".to_string(), Interval::ThreeMinutes)]
        );
    }

    #[tokio::test]
    async fn miss_with_failing_source_surfaces_error() {
        let cache = cache_with(Arc::new(CountingSource::default()), 10);
        let err = cache.get("BADUSDT", Interval::ThreeMinutes).await.unwrap_err();
        assert!(matches!(err, MarketDataError::Source(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn update_replaces_forming_bar_and_evicts_oldest() {
        let cache = cache_with(Arc::new(CountingSource::default()), 3);
        let t0 = Utc::now();
        cache.insert(
            CacheKey::new("BTCUSDT", Interval::ThreeMinutes),
            vec![
                candle("BTCUSDT", 0, 100),
                candle("BTCUSDT", 1, 101),
                candle("BTCUSDT", 2, 102),
            ],
            t0,
        );

        cache.apply_update_at(candle("BTCUSDT", 2, 150), t0);
        let candles = cache.get_at("BTCUSDT", Interval::ThreeMinutes, t0).await.unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[2].close, Decimal::from(150));

        cache.apply_update_at(candle("BTCUSDT", 3, 103), t0);
        let candles = cache.get_at("BTCUSDT", Interval::ThreeMinutes, t0).await.unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, Decimal::from(101));
        assert_eq!(candles[2].close, Decimal::from(103));
    }

    #[tokio::test]
    async fn update_refreshes_received_at() {
        let cache = cache_with(Arc::new(CountingSource::default()), 5);
        let t0 = Utc::now() - Duration::minutes(30);
        cache.insert(
            CacheKey::new("BTCUSDT", Interval::ThreeMinutes),
            vec![candle("BTCUSDT", 0, 100)],
            t0,
        );
        assert!(cache.get("BTCUSDT", Interval::ThreeMinutes).await.is_err());

        cache.apply_update(candle("BTCUSDT", 0, 105));
        let candles = cache.get("BTCUSDT", Interval::ThreeMinutes).await.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(cache.latest_price("BTCUSDT").await.unwrap(), Decimal::from(105));
    }

    #[tokio::test]
    async fn seed_all_reports_failures_without_raising() {
        let source = Arc::new(CountingSource::default());
        let cache = cache_with(source.clone(), 5);
        let report = cache
            .seed_all(
                vec![
                    CacheKey::new("BTCUSDT", Interval::ThreeMinutes),
                    CacheKey::new("BADUSDT", Interval::ThreeMinutes),
                    CacheKey::new("ETHUSDT", Interval::FourHours),
                ],
                2,
            )
            .await;
        assert_eq!(report.seeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.symbol, "BADUSDT");
        assert_eq!(cache.len(), 2);

        let rows = cache.freshness(Utc::now());
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.candles == 5));
    }
}

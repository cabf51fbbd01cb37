use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use keel_core::Interval;
use keel_stream::{StreamResult, StreamSubscriptionManager};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{KlineCodec, MarketDataCache, SubscriptionRequester};

/// Bridges stream topics into the [`MarketDataCache`].
///
/// Each tracked topic gets one consumer task that decodes payloads and
/// applies them to the cache. Consumers end when the manager closes their
/// channel on shutdown.
pub struct KlineFeed {
    manager: Arc<StreamSubscriptionManager>,
    codec: Arc<dyn KlineCodec>,
    cache: Weak<MarketDataCache>,
    tracked: Mutex<HashSet<String>>,
}

impl KlineFeed {
    /// Build a feed and register it as the cache's miss-subscription hook.
    pub fn attach(
        manager: Arc<StreamSubscriptionManager>,
        codec: Arc<dyn KlineCodec>,
        cache: &Arc<MarketDataCache>,
    ) -> Arc<Self> {
        let feed = Arc::new(Self {
            manager,
            codec,
            cache: Arc::downgrade(cache),
            tracked: Mutex::new(HashSet::new()),
        });
        if !cache.set_subscription_requester(feed.clone()) {
            debug!("cache already has a subscription requester");
        }
        feed
    }

    /// Bind and subscribe every pair not already tracked.
    ///
    /// The manager queues subscribes issued while it is reconnecting. A
    /// subscribe it refuses leaves the topics untracked so a later call
    /// retries them.
    pub async fn track(&self, pairs: &[(String, Interval)]) -> StreamResult<()> {
        let mut fresh = Vec::new();
        for (symbol, interval) in pairs {
            let topic = self.codec.topic(symbol, *interval);
            if !self.mark_tracked(&topic) {
                continue;
            }
            match self.manager.bind(&topic) {
                Ok(rx) => {
                    self.spawn_consumer(topic.clone(), rx);
                    fresh.push(topic);
                }
                Err(err) => {
                    self.unmark(&topic);
                    return Err(err);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.manager.subscribe(&fresh).await {
            for topic in &fresh {
                self.unmark(topic);
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn tracked_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.tracked().iter().cloned().collect();
        topics.sort();
        topics
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_tracked(&self, topic: &str) -> bool {
        self.tracked().insert(topic.to_string())
    }

    fn unmark(&self, topic: &str) {
        self.tracked().remove(topic);
    }

    fn spawn_consumer(&self, topic: String, mut rx: mpsc::Receiver<String>) {
        let codec = self.codec.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(candle) = codec.decode(&payload) else {
                    warn!(topic = %topic, "failed to decode candle payload");
                    continue;
                };
                match cache.upgrade() {
                    Some(cache) => cache.apply_update(candle),
                    None => break,
                }
            }
            debug!(topic = %topic, "candle consumer stopped");
        });
    }
}

#[async_trait]
impl SubscriptionRequester for KlineFeed {
    async fn ensure_subscribed(&self, symbol: &str, interval: Interval) {
        if let Err(err) = self.track(&[(symbol.to_string(), interval)]).await {
            warn!(symbol, %interval, error = %err, "failed to subscribe after cache miss");
        }
    }
}

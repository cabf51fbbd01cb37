use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use keel_advisor::{Advisor, ChatCompletionsAdvisor, ChatSettings, RetryPolicy, RetryingAdvisor};
use keel_binance::{BinanceCombinedProtocol, BinanceKlineClient, BinanceKlineCodec};
use keel_config::{AdvisorConfig, AppConfig, CacheConfig, StreamConfig};
use keel_core::{normalize_symbol, Interval, ShutdownSignal};
use keel_journal::JsonlJournal;
use keel_markets::{CacheKey, CacheSettings, KlineFeed, MarketDataCache};
use keel_paper::{PaperConfig, PaperExchange};
use keel_stream::{StreamSettings, StreamSubscriptionManager, WsConnector};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::{LeaderboardSettings, TraderManager};
use crate::telemetry::{spawn_metrics_server, LiveMetrics};
use crate::trader::{AutoTrader, TraderSettings};

const STREAM_LABEL: &str = "market";
const STREAM_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Shutdown signal triggered by the first Ctrl-C.
pub fn ctrl_c_signal() -> ShutdownSignal {
    let signal = ShutdownSignal::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            trigger.trigger();
        }
    });
    signal
}

/// Shared market data: the cache plus, when the provider is reachable, the
/// stream and feed keeping it current.
pub struct MarketRuntime {
    pub cache: Arc<MarketDataCache>,
    pub stream: Option<Arc<StreamSubscriptionManager>>,
    pub feed: Option<Arc<KlineFeed>>,
}

impl MarketRuntime {
    pub async fn shutdown(&self) {
        if let Some(stream) = &self.stream {
            stream.shutdown().await;
        }
    }
}

fn cache_settings(config: &CacheConfig) -> CacheSettings {
    CacheSettings {
        capacity: config.capacity,
        max_age: config.max_age(),
        pull_limit: config.seed_limit,
        price_interval: config.price_interval,
    }
}

fn stream_settings(config: &StreamConfig) -> StreamSettings {
    StreamSettings {
        batch_size: config.batch_size,
        batch_delay: config.batch_delay(),
        reconnect_backoff: config.reconnect_backoff(),
        channel_capacity: config.channel_capacity,
    }
}

/// Build the cache, connect the stream, seed every pair and subscribe.
///
/// An unreachable stream or a failed seed is logged; affected symbols fall
/// back to pulling on cache misses.
pub async fn start_market(
    config: &AppConfig,
    symbols: &[String],
    intervals: &[Interval],
) -> Result<MarketRuntime> {
    let source = BinanceKlineClient::new(config.stream.rest_url.clone())
        .context("failed to build kline client")?;
    let cache = Arc::new(MarketDataCache::new(
        Arc::new(source),
        cache_settings(&config.cache),
    ));

    let connector = Arc::new(WsConnector::new(config.stream.ws_url.clone()));
    let stream = match StreamSubscriptionManager::connect(
        connector,
        Arc::new(BinanceCombinedProtocol),
        stream_settings(&config.stream),
    )
    .await
    {
        Ok(manager) => Some(Arc::new(manager)),
        Err(err) => {
            warn!(url = %config.stream.ws_url, error = %err, "market data stream unavailable, using pull-on-miss");
            None
        }
    };
    let feed = stream
        .as_ref()
        .map(|manager| KlineFeed::attach(manager.clone(), Arc::new(BinanceKlineCodec), &cache));

    let pairs: Vec<(String, Interval)> = symbols
        .iter()
        .flat_map(|symbol| intervals.iter().map(move |interval| (symbol.clone(), *interval)))
        .collect();
    let keys = pairs
        .iter()
        .map(|(symbol, interval)| CacheKey::new(symbol, *interval))
        .collect();
    cache.seed_all(keys, config.cache.seed_concurrency).await;
    if let Some(feed) = &feed {
        if let Err(err) = feed.track(&pairs).await {
            warn!(error = %err, "initial subscription failed, topics will replay on reconnect");
        }
    }

    Ok(MarketRuntime {
        cache,
        stream,
        feed,
    })
}

pub fn build_advisor(config: &AdvisorConfig) -> Result<RetryingAdvisor<ChatCompletionsAdvisor>> {
    let chat = ChatCompletionsAdvisor::new(ChatSettings {
        base_url: config.base_url.clone(),
        api_key: config.api_key.clone(),
        model: config.model.clone(),
        timeout: Duration::from_secs(config.timeout_secs),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        ..ChatSettings::default()
    })
    .context("failed to configure advisor")?;
    Ok(RetryingAdvisor::new(
        chat,
        RetryPolicy {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.retry_base_delay_secs),
        },
    ))
}

fn trading_universe(config: &AppConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    config
        .traders
        .iter()
        .flat_map(|trader| trader.symbols_or(&config.stream.symbols).iter())
        .map(|symbol| normalize_symbol(symbol))
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}

/// Run every configured trader against paper accounts priced from the live
/// cache until `shutdown` fires.
pub async fn run_live(
    config: &AppConfig,
    metrics_addr: SocketAddr,
    shutdown: ShutdownSignal,
) -> Result<()> {
    if config.traders.is_empty() {
        bail!("no traders configured; add [[traders]] entries to the configuration");
    }
    let metrics = Arc::new(LiveMetrics::new().context("failed to register metrics")?);
    let metrics_task = spawn_metrics_server(metrics.registry(), metrics_addr);

    let market = start_market(config, &trading_universe(config), &config.stream.intervals).await?;
    let advisor: Arc<dyn Advisor> = Arc::new(build_advisor(&config.advisor)?);
    let manager = TraderManager::new(LeaderboardSettings::from(&config.leaderboard));

    for trader_config in &config.traders {
        let settings = TraderSettings::from_config(trader_config, config);
        let exchange = PaperExchange::new(PaperConfig {
            name: settings.exchange.clone(),
            initial_balance: settings.initial_balance,
            ..PaperConfig::default()
        })
        .with_price_source(market.cache.clone());
        let journal = JsonlJournal::open(&config.live.journal_dir, &settings.id)
            .with_context(|| format!("failed to open journal for trader {}", settings.id))?;
        let trader = AutoTrader::new(
            settings,
            Arc::new(exchange),
            advisor.clone(),
            market.cache.clone(),
            Arc::new(journal),
        )
        .with_metrics(metrics.clone());
        manager.register(Arc::new(trader))?;
    }

    manager.start_all();
    let probe = spawn_stream_probe(market.stream.clone(), metrics.clone(), shutdown.clone());
    info!(traders = config.traders.len(), "live session started");

    shutdown.wait().await;
    info!("live session stopping");
    manager.stop_all().await;
    market.shutdown().await;
    if let Err(err) = probe.await {
        warn!(error = %err, "stream probe ended abnormally");
    }
    for row in manager.leaderboard().await {
        info!(
            trader = %row.trader_id,
            equity = %row.total_equity.round_dp(2),
            pnl_pct = %row.total_pnl_pct.round_dp(2),
            positions = row.position_count,
            "final standing"
        );
    }
    metrics_task.abort();
    Ok(())
}

fn spawn_stream_probe(
    stream: Option<Arc<StreamSubscriptionManager>>,
    metrics: Arc<LiveMetrics>,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let connected = stream.as_ref().is_some_and(|stream| stream.is_connected());
            metrics.update_connection_status(STREAM_LABEL, connected);
            if !shutdown.sleep(STREAM_PROBE_INTERVAL).await {
                break;
            }
        }
        metrics.update_connection_status(STREAM_LABEL, false);
    })
}

/// Stream candles for `symbols` into the cache and log entry freshness every
/// `report_every` until `shutdown` fires.
pub async fn run_watch(
    config: &AppConfig,
    symbols: &[String],
    report_every: Duration,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let symbols: Vec<String> = if symbols.is_empty() {
        config.stream.symbols.clone()
    } else {
        symbols.iter().map(|symbol| normalize_symbol(symbol)).collect()
    };
    let market = start_market(config, &symbols, &config.stream.intervals).await?;
    let Some(stream) = market.stream.clone() else {
        bail!("market data stream unavailable at {}", config.stream.ws_url);
    };
    let max_age = market.cache.settings().max_age;

    while shutdown.sleep(report_every).await {
        for entry in market.cache.freshness(Utc::now()) {
            if entry.age > max_age {
                warn!(
                    symbol = %entry.key.symbol,
                    interval = %entry.key.interval,
                    age_secs = entry.age.num_seconds(),
                    "cache entry is stale"
                );
            } else {
                debug!(
                    symbol = %entry.key.symbol,
                    interval = %entry.key.interval,
                    age_secs = entry.age.num_seconds(),
                    candles = entry.candles,
                    "cache entry"
                );
            }
        }
        info!(
            connected = stream.is_connected(),
            reconnects = stream.reconnect_count(),
            topics = stream.topics().len(),
            entries = market.cache.len(),
            "market data status"
        );
    }

    market.shutdown().await;
    Ok(())
}

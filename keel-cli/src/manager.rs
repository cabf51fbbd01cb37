use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use futures::future::join_all;
use keel_config::LeaderboardConfig;
use keel_core::ShutdownSignal;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::trader::AutoTrader;

#[derive(Clone, Debug)]
pub struct LeaderboardSettings {
    /// Budget for one trader's account fetch.
    pub fetch_timeout: Duration,
    pub cache_ttl: Duration,
    pub limit: usize,
}

impl Default for LeaderboardSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(3),
            cache_ttl: Duration::from_secs(30),
            limit: 50,
        }
    }
}

impl From<&LeaderboardConfig> for LeaderboardSettings {
    fn from(config: &LeaderboardConfig) -> Self {
        Self {
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            limit: config.limit,
        }
    }
}

/// One trader's standing. Rows whose account fetch failed or timed out carry
/// zeroed figures and an `error`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeaderboardRow {
    pub trader_id: String,
    pub trader_name: String,
    pub ai_model: String,
    pub exchange: String,
    pub total_equity: Decimal,
    pub total_pnl: Decimal,
    pub total_pnl_pct: Decimal,
    pub position_count: usize,
    pub margin_used_pct: Decimal,
    pub is_running: bool,
    pub error: Option<String>,
}

struct RunningTrader {
    shutdown: ShutdownSignal,
    handle: JoinHandle<()>,
}

/// Registry of traders, each scheduled and cancelled independently.
pub struct TraderManager {
    traders: RwLock<BTreeMap<String, Arc<AutoTrader>>>,
    running: Mutex<HashMap<String, RunningTrader>>,
    leaderboard: LeaderboardSettings,
    cached: AsyncMutex<Option<(Instant, Vec<LeaderboardRow>)>>,
}

impl TraderManager {
    pub fn new(leaderboard: LeaderboardSettings) -> Self {
        Self {
            traders: RwLock::new(BTreeMap::new()),
            running: Mutex::new(HashMap::new()),
            leaderboard,
            cached: AsyncMutex::new(None),
        }
    }

    pub fn register(&self, trader: Arc<AutoTrader>) -> Result<()> {
        let mut traders = self.traders.write().unwrap_or_else(PoisonError::into_inner);
        let id = trader.id().to_string();
        if traders.contains_key(&id) {
            bail!("trader {id} is already registered");
        }
        traders.insert(id, trader);
        Ok(())
    }

    pub fn trader(&self, id: &str) -> Option<Arc<AutoTrader>> {
        self.traders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn trader_ids(&self) -> Vec<String> {
        self.traders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<Arc<AutoTrader>> {
        self.traders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningTrader>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the trader's loop. Starting a trader that is already running is
    /// a no-op.
    pub fn start(&self, id: &str) -> Result<()> {
        let Some(trader) = self.trader(id) else {
            bail!("unknown trader {id}");
        };
        let mut running = self.running();
        if running
            .get(id)
            .is_some_and(|entry| !entry.handle.is_finished())
        {
            debug!(trader = id, "trader already running");
            return Ok(());
        }
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(trader.run(shutdown.clone()));
        running.insert(id.to_string(), RunningTrader { shutdown, handle });
        Ok(())
    }

    /// Signal the trader to stop and wait for its loop to exit. Other
    /// traders are unaffected.
    pub async fn stop(&self, id: &str) -> Result<()> {
        if self.trader(id).is_none() {
            bail!("unknown trader {id}");
        }
        let Some(entry) = self.running().remove(id) else {
            return Ok(());
        };
        entry.shutdown.trigger();
        if let Err(err) = entry.handle.await {
            warn!(trader = id, error = %err, "trader task ended abnormally");
        }
        Ok(())
    }

    pub fn start_all(&self) {
        for id in self.trader_ids() {
            if let Err(err) = self.start(&id) {
                warn!(trader = %id, error = %err, "failed to start trader");
            }
        }
        info!(traders = self.running().len(), "traders started");
    }

    pub async fn stop_all(&self) {
        let entries: Vec<(String, RunningTrader)> = self.running().drain().collect();
        for (_, entry) in &entries {
            entry.shutdown.trigger();
        }
        for (id, entry) in entries {
            if let Err(err) = entry.handle.await {
                warn!(trader = %id, error = %err, "trader task ended abnormally");
            }
        }
        info!("all traders stopped");
    }

    /// Traders ranked by PnL percentage, best first.
    ///
    /// Accounts are fetched concurrently, each bounded by the fetch timeout.
    /// Results are cached for the configured TTL.
    pub async fn leaderboard(&self) -> Vec<LeaderboardRow> {
        let mut cached = self.cached.lock().await;
        if let Some((fetched_at, rows)) = cached.as_ref() {
            if fetched_at.elapsed() < self.leaderboard.cache_ttl {
                return rows.clone();
            }
        }

        let traders = self.all();
        let timeout = self.leaderboard.fetch_timeout;
        let mut rows = join_all(traders.iter().map(|trader| leaderboard_row(trader, timeout))).await;
        rows.sort_by(|a, b| b.total_pnl_pct.cmp(&a.total_pnl_pct));
        rows.truncate(self.leaderboard.limit);
        debug!(rows = rows.len(), "leaderboard refreshed");
        *cached = Some((Instant::now(), rows.clone()));
        rows
    }

    pub async fn top(&self, n: usize) -> Vec<LeaderboardRow> {
        let mut rows = self.leaderboard().await;
        rows.truncate(n);
        rows
    }
}

async fn leaderboard_row(trader: &AutoTrader, timeout: Duration) -> LeaderboardRow {
    let status = trader.status();
    let mut row = LeaderboardRow {
        trader_id: status.trader_id,
        trader_name: status.trader_name,
        ai_model: status.ai_model,
        exchange: status.exchange,
        total_equity: Decimal::ZERO,
        total_pnl: Decimal::ZERO,
        total_pnl_pct: Decimal::ZERO,
        position_count: 0,
        margin_used_pct: Decimal::ZERO,
        is_running: status.is_running,
        error: None,
    };
    match tokio::time::timeout(timeout, trader.account_info()).await {
        Ok(Ok(account)) => {
            row.total_equity = account.total_equity;
            row.total_pnl = account.total_pnl;
            row.total_pnl_pct = account.total_pnl_pct;
            row.position_count = account.position_count;
            row.margin_used_pct = account.margin_used_pct;
        }
        Ok(Err(err)) => {
            warn!(trader = %row.trader_id, error = %err, "leaderboard account fetch failed");
            row.error = Some(format!("account fetch failed: {err}"));
        }
        Err(_) => {
            warn!(trader = %row.trader_id, timeout_ms = timeout.as_millis() as u64, "leaderboard account fetch timed out");
            row.error = Some("account fetch timed out".into());
        }
    }
    row
}

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use keel_advisor::{parse_decisions, Advisor};
use keel_broker::{ExchangeAdapter, ExchangeResult};
use keel_config::{AppConfig, TraderConfig};
use keel_core::{
    margin_used, normalize_symbol, pnl_percentage, position_key, AccountBalance, ActionKind,
    DecisionAction, Interval, PositionInfo, PositionSide, Price, ShutdownSignal,
};
use keel_execution::{DecisionExecutor, ExecutionConfig};
use keel_journal::{analyze_performance, AccountSnapshot, CycleRecord, DecisionJournal};
use keel_markets::{MarketDataCache, MarketDataError};
use keel_portfolio::{generate_auto_close_actions, DrawdownConfig, DrawdownGuard, PositionTracker};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::prompts::{self, MarketSnapshot, PromptContext};
use crate::telemetry::LiveMetrics;

/// Static description of one trading account and its loop.
#[derive(Clone, Debug)]
pub struct TraderSettings {
    pub id: String,
    pub name: String,
    pub ai_model: String,
    pub exchange: String,
    pub initial_balance: Decimal,
    pub scan_interval: Duration,
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    pub default_leverage: u32,
    pub open_fee_rate: Decimal,
    pub prompt_template: Option<String>,
    pub drawdown: DrawdownConfig,
    pub drawdown_interval: Duration,
    /// Journal records fed into the performance summary of each prompt.
    pub journal_window: usize,
}

impl TraderSettings {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ai_model: "deepseek".into(),
            exchange: "paper".into(),
            initial_balance: Decimal::from(1_000),
            scan_interval: Duration::from_secs(180),
            symbols: vec!["BTCUSDT".into()],
            intervals: vec![Interval::ThreeMinutes, Interval::FourHours],
            default_leverage: 5,
            open_fee_rate: Decimal::new(4, 4),
            prompt_template: None,
            drawdown: DrawdownConfig::default(),
            drawdown_interval: Duration::from_secs(60),
            journal_window: 100,
        }
    }

    pub fn from_config(trader: &TraderConfig, app: &AppConfig) -> Self {
        Self {
            id: trader.id.clone(),
            name: trader.display_name().to_string(),
            ai_model: trader.ai_model.clone(),
            exchange: trader.exchange.clone(),
            initial_balance: trader.initial_balance,
            scan_interval: trader.scan_interval(),
            symbols: trader.symbols_or(&app.stream.symbols).to_vec(),
            intervals: app.stream.intervals.clone(),
            default_leverage: trader.default_leverage.max(1),
            open_fee_rate: app.risk.open_fee_rate,
            prompt_template: trader.prompt_template.clone(),
            drawdown: DrawdownConfig {
                min_profit_pct: app.risk.drawdown_min_profit_pct,
                max_drawback_pct: app.risk.drawdown_max_drawback_pct,
            },
            drawdown_interval: Duration::from_secs(app.risk.drawdown_check_interval_secs.max(1)),
            journal_window: 100,
        }
    }
}

/// Account summary exposed to the API layer and the leaderboard.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AccountInfo {
    /// Wallet balance plus unrealized PnL.
    pub total_equity: Decimal,
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub unrealized_pnl: Decimal,
    /// Equity relative to the initial balance.
    pub total_pnl: Decimal,
    pub total_pnl_pct: Decimal,
    pub margin_used: Decimal,
    pub margin_used_pct: Decimal,
    pub position_count: usize,
}

impl AccountInfo {
    pub fn compute(
        balance: &AccountBalance,
        positions: &[PositionInfo],
        initial_balance: Decimal,
    ) -> Self {
        let total_equity = balance.total_equity + balance.unrealized_pnl;
        let margin: Decimal = positions.iter().map(PositionInfo::margin_used).sum();
        let total_pnl = total_equity - initial_balance;
        Self {
            total_equity,
            wallet_balance: balance.total_equity,
            available_balance: balance.available_balance,
            unrealized_pnl: balance.unrealized_pnl,
            total_pnl,
            total_pnl_pct: ratio_pct(total_pnl, initial_balance),
            margin_used: margin,
            margin_used_pct: ratio_pct(margin, total_equity),
            position_count: positions.len(),
        }
    }

    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            total_equity: self.total_equity,
            available_balance: self.available_balance,
            unrealized_pnl: self.unrealized_pnl,
            position_count: self.position_count,
            margin_used_pct: self.margin_used_pct,
        }
    }
}

/// Position keys of the successful closes among `actions`.
fn closed_keys(actions: &[DecisionAction]) -> HashSet<String> {
    actions
        .iter()
        .filter(|action| {
            action.success && matches!(action.action, ActionKind::CloseLong | ActionKind::CloseShort)
        })
        .filter_map(|action| action.side.map(|side| position_key(&action.symbol, side)))
        .collect()
}

fn ratio_pct(value: Decimal, base: Decimal) -> Decimal {
    if base > Decimal::ZERO {
        value / base * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    }
}

/// Open position as presented upward, with margin-based PnL percentage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PositionView {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Price,
    pub mark_price: Price,
    pub quantity: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub margin_used: Decimal,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub liquidation_price: Option<Price>,
}

impl From<&PositionInfo> for PositionView {
    fn from(position: &PositionInfo) -> Self {
        let unrealized_pnl = position.unrealized_pnl();
        let margin = margin_used(position.quantity, position.entry_price, position.leverage);
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            mark_price: position.mark_price,
            quantity: position.quantity,
            leverage: position.leverage,
            unrealized_pnl,
            unrealized_pnl_pct: pnl_percentage(unrealized_pnl, margin),
            margin_used: margin,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            liquidation_price: position.liquidation_price,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraderStatus {
    pub trader_id: String,
    pub trader_name: String,
    pub ai_model: String,
    pub exchange: String,
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub runtime_minutes: i64,
    pub call_count: u64,
    pub initial_balance: Decimal,
    pub scan_interval: Duration,
}

/// State mutated by both the decision cycle and the drawdown monitor.
struct TraderState {
    tracker: PositionTracker,
    guard: DrawdownGuard,
}

/// One trading account: its periodic decision cycle, its drawdown monitor
/// and the queries exposed to the API layer.
pub struct AutoTrader {
    settings: TraderSettings,
    exchange: Arc<dyn ExchangeAdapter>,
    advisor: Arc<dyn Advisor>,
    market: Arc<MarketDataCache>,
    executor: DecisionExecutor,
    journal: Arc<dyn DecisionJournal>,
    metrics: Option<Arc<LiveMetrics>>,
    state: AsyncMutex<TraderState>,
    call_count: AtomicU64,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl AutoTrader {
    pub fn new(
        settings: TraderSettings,
        exchange: Arc<dyn ExchangeAdapter>,
        advisor: Arc<dyn Advisor>,
        market: Arc<MarketDataCache>,
        journal: Arc<dyn DecisionJournal>,
    ) -> Self {
        let executor = DecisionExecutor::new(
            exchange.clone(),
            market.clone(),
            ExecutionConfig {
                open_fee_rate: settings.open_fee_rate,
                default_leverage: settings.default_leverage,
            },
        );
        let state = TraderState {
            tracker: PositionTracker::new(),
            guard: DrawdownGuard::new(settings.drawdown),
        };
        Self {
            settings,
            exchange,
            advisor,
            market,
            executor,
            journal,
            metrics: None,
            state: AsyncMutex::new(state),
            call_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<LiveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn settings(&self) -> &TraderSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run decision cycles every scan interval until `shutdown` fires.
    ///
    /// The first cycle starts immediately. A cycle in flight when shutdown
    /// fires is allowed to finish.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        self.running.store(true, Ordering::SeqCst);
        *self.started_at() = Some(Utc::now());
        info!(
            trader = %self.settings.id,
            scan_secs = self.settings.scan_interval.as_secs(),
            "trader started"
        );
        let monitor = tokio::spawn(self.clone().monitor_drawdown(shutdown.clone()));
        loop {
            if let Err(err) = self.execute_decision_cycle().await {
                warn!(trader = %self.settings.id, error = %err, "decision cycle failed");
            }
            if !shutdown.sleep(self.settings.scan_interval).await {
                break;
            }
        }
        if let Err(err) = monitor.await {
            warn!(trader = %self.settings.id, error = %err, "drawdown monitor panicked");
        }
        self.running.store(false, Ordering::SeqCst);
        info!(trader = %self.settings.id, "trader stopped");
    }

    async fn monitor_drawdown(self: Arc<Self>, shutdown: ShutdownSignal) {
        while shutdown.sleep(self.settings.drawdown_interval).await {
            self.check_drawdown().await;
        }
    }

    /// One drawdown pass. Protective closes are journaled like cycle actions
    /// and removed from the reconciliation snapshot.
    pub async fn check_drawdown(&self) -> Vec<DecisionAction> {
        let actions = {
            let mut state = self.state.lock().await;
            let actions = state.guard.check(self.exchange.as_ref()).await;
            for key in closed_keys(&actions) {
                state.tracker.forget(&key);
            }
            actions
        };
        if actions.is_empty() {
            return actions;
        }
        if let Some(metrics) = &self.metrics {
            let closed = actions.iter().filter(|action| action.success).count();
            metrics.inc_drawdown_closes(&self.settings.id, closed);
            metrics.record_actions(&self.settings.id, &actions);
        }
        let mut record = CycleRecord::new(
            self.settings.id.clone(),
            self.exchange.name(),
            self.call_count.load(Ordering::SeqCst),
        );
        record.reasoning = "drawdown guard".into();
        record.decisions = actions.clone();
        self.persist(&record);
        actions
    }

    /// Fetch, reconcile, advise, execute and journal one cycle.
    ///
    /// Returns an error when the account state or the advisor is unavailable;
    /// such cycles are still journaled as failed. Individual decision failures
    /// are recorded on their actions and do not fail the cycle.
    ///
    /// The shared state is held while reconciling and while executing, but not
    /// across the advisor call, so the drawdown monitor keeps running.
    pub async fn execute_decision_cycle(&self) -> Result<CycleRecord> {
        let cycle = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let trader = self.settings.id.as_str();
        if let Some(metrics) = &self.metrics {
            metrics.inc_cycle(trader);
        }
        let mut record = CycleRecord::new(trader, self.exchange.name(), cycle);

        let (balance, positions) = {
            let mut state = self.state.lock().await;
            let fetched = tokio::try_join!(self.exchange.balance(), self.exchange.positions());
            let (balance, positions) = match fetched {
                Ok(fetched) => fetched,
                Err(err) => {
                    return self.fail_cycle(record, format!("failed to load account: {err}"))
                }
            };

            let closed = state.tracker.detect_closed(&positions);
            if !closed.is_empty() {
                for position in &closed {
                    state.guard.peaks_mut().clear(&position.key());
                }
                if let Some(metrics) = &self.metrics {
                    metrics.inc_auto_closes(trader, closed.len());
                }
                record.decisions.extend(generate_auto_close_actions(&closed));
            }
            state.tracker.update_snapshot(&positions);
            (balance, positions)
        };

        let account = AccountInfo::compute(&balance, &positions, self.settings.initial_balance);
        if let Some(metrics) = &self.metrics {
            metrics.update_equity(trader, account.total_equity);
        }
        record.account = Some(account.snapshot());
        record.positions = positions.clone();

        let (market, skipped) = self.load_market(&positions).await;
        let views: Vec<PositionView> = positions.iter().map(PositionView::from).collect();
        let performance = match self.journal.recent(self.settings.journal_window) {
            Ok(history) => Some(analyze_performance(&history)),
            Err(err) => {
                warn!(trader, error = %err, "failed to read journal for performance");
                None
            }
        };
        let system_prompt = prompts::system_prompt(
            self.settings.prompt_template.as_deref(),
            account.total_equity,
            self.settings.default_leverage,
        );
        record.user_prompt = prompts::user_prompt(&PromptContext {
            now: Utc::now(),
            cycle,
            runtime_minutes: self.runtime_minutes(),
            account: &account,
            positions: &views,
            market: &market,
            skipped: &skipped,
            performance: performance.as_ref(),
        });

        let advised = self
            .advisor
            .advise(&system_prompt, &record.user_prompt)
            .await;
        record.raw_response = match advised {
            Ok(raw) => raw,
            Err(err) => return self.fail_cycle(record, format!("advisor call failed: {err}")),
        };
        let reply = match parse_decisions(&record.raw_response) {
            Ok(reply) => reply,
            Err(err) => {
                return self.fail_cycle(record, format!("failed to parse decisions: {err}"))
            }
        };
        record.reasoning = reply.reasoning;

        let mut state = self.state.lock().await;
        let executed = self.executor.execute_batch(&reply.decisions).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_actions(trader, &executed);
        }
        let system_closed = closed_keys(&executed);
        record.decisions.extend(executed);

        match self.exchange.positions().await {
            Ok(refreshed) => {
                let open: HashSet<String> = refreshed.iter().map(PositionInfo::key).collect();
                let gone: Vec<String> = state
                    .guard
                    .peaks()
                    .snapshot()
                    .into_keys()
                    .filter(|key| !open.contains(key))
                    .collect();
                for key in gone {
                    state.guard.peaks_mut().clear(&key);
                }
                state.tracker.update_snapshot(&refreshed);
            }
            Err(err) => {
                // Keep the reconciled snapshot, which already excludes guard
                // closes, minus what this cycle closed.
                warn!(trader, error = %err, "failed to refresh positions after execution");
                for key in &system_closed {
                    state.guard.peaks_mut().clear(key);
                    state.tracker.forget(key);
                }
            }
        }
        drop(state);

        info!(
            trader,
            cycle,
            decisions = record.decisions.len(),
            skipped = skipped.len(),
            "decision cycle complete"
        );
        self.persist(&record);
        Ok(record)
    }

    async fn load_market(&self, positions: &[PositionInfo]) -> (Vec<MarketSnapshot>, Vec<String>) {
        let mut symbols: Vec<String> = Vec::new();
        let held = positions.iter().map(|position| position.symbol.as_str());
        for symbol in self.settings.symbols.iter().map(String::as_str).chain(held) {
            let symbol = normalize_symbol(symbol);
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }

        let mut market = Vec::new();
        let mut skipped = Vec::new();
        'symbols: for symbol in symbols {
            let mut loaded = Vec::with_capacity(self.settings.intervals.len());
            for interval in &self.settings.intervals {
                match self.market.get(&symbol, *interval).await {
                    Ok(candles) => loaded.push(MarketSnapshot {
                        symbol: symbol.clone(),
                        interval: *interval,
                        candles,
                    }),
                    Err(err) => {
                        if matches!(err, MarketDataError::Stale(_)) {
                            if let Some(metrics) = &self.metrics {
                                metrics.inc_stale_read();
                            }
                        }
                        warn!(
                            trader = %self.settings.id,
                            symbol = %symbol,
                            error = %err,
                            "skipping symbol this cycle"
                        );
                        skipped.push(symbol);
                        continue 'symbols;
                    }
                }
            }
            market.extend(loaded);
        }
        (market, skipped)
    }

    fn fail_cycle(&self, mut record: CycleRecord, error: String) -> Result<CycleRecord> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_cycle_failure(&self.settings.id);
        }
        record.fail(error.clone());
        self.persist(&record);
        Err(anyhow!(error))
    }

    fn persist(&self, record: &CycleRecord) {
        if let Err(err) = self.journal.append(record) {
            warn!(trader = %self.settings.id, error = %err, "failed to journal cycle");
        }
    }

    pub async fn account_info(&self) -> ExchangeResult<AccountInfo> {
        let (balance, positions) =
            tokio::try_join!(self.exchange.balance(), self.exchange.positions())?;
        Ok(AccountInfo::compute(
            &balance,
            &positions,
            self.settings.initial_balance,
        ))
    }

    pub async fn positions(&self) -> ExchangeResult<Vec<PositionView>> {
        let positions = self.exchange.positions().await?;
        Ok(positions.iter().map(PositionView::from).collect())
    }

    pub fn status(&self) -> TraderStatus {
        let start_time = *self.started_at();
        TraderStatus {
            trader_id: self.settings.id.clone(),
            trader_name: self.settings.name.clone(),
            ai_model: self.settings.ai_model.clone(),
            exchange: self.settings.exchange.clone(),
            is_running: self.is_running(),
            start_time,
            runtime_minutes: self.runtime_minutes(),
            call_count: self.call_count.load(Ordering::SeqCst),
            initial_balance: self.settings.initial_balance,
            scan_interval: self.settings.scan_interval,
        }
    }

    /// Peak profit percentages currently tracked by the drawdown guard.
    pub async fn peak_pnl(&self) -> HashMap<String, Decimal> {
        self.state.lock().await.guard.peaks().snapshot()
    }

    fn runtime_minutes(&self) -> i64 {
        self.started_at()
            .map(|start| (Utc::now() - start).num_minutes())
            .unwrap_or_default()
    }

    fn started_at(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

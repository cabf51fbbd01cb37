//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use keel_core::Interval;
use rust_decimal::Decimal;
use serde::Deserialize;

mod deserializer;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub leaderboard: LeaderboardConfig,
    #[serde(default)]
    pub live: LiveRuntimeConfig,
    #[serde(default)]
    pub traders: Vec<TraderConfig>,
}

/// Market-data provider endpoints and subscription pacing.
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(
        default = "default_symbols",
        with = "deserializer::normalized_symbols"
    )]
    pub symbols: Vec<String>,
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub seed_limit: usize,
    #[serde(default = "default_seed_concurrency")]
    pub seed_concurrency: usize,
    #[serde(default = "default_price_interval")]
    pub price_interval: Interval,
}

/// OpenAI-compatible chat endpoint used for advisory calls.
#[derive(Debug, Deserialize, Clone)]
pub struct AdvisorConfig {
    #[serde(default = "default_advisor_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_advisor_model")]
    pub model: String,
    #[serde(default = "default_advisor_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    #[serde(default = "default_drawdown_min_profit_pct")]
    pub drawdown_min_profit_pct: Decimal,
    #[serde(default = "default_drawdown_max_drawback_pct")]
    pub drawdown_max_drawback_pct: Decimal,
    #[serde(default = "default_drawdown_check_interval_secs")]
    pub drawdown_check_interval_secs: u64,
    #[serde(default = "default_open_fee_rate")]
    pub open_fee_rate: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaderboardConfig {
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_leaderboard_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LiveRuntimeConfig {
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_live_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,
}

/// One trading account and its decision loop settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TraderConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_ai_model")]
    pub ai_model: String,
    #[serde(default = "default_exchange_name")]
    pub exchange: String,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Falls back to `stream.symbols` when empty.
    #[serde(default, with = "deserializer::normalized_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            channel_capacity: default_channel_capacity(),
            symbols: default_symbols(),
            intervals: default_intervals(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            max_age_secs: default_max_age_secs(),
            seed_limit: default_cache_capacity(),
            seed_concurrency: default_seed_concurrency(),
            price_interval: default_price_interval(),
        }
    }
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            base_url: default_advisor_base_url(),
            api_key: String::new(),
            model: default_advisor_model(),
            timeout_secs: default_advisor_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            drawdown_min_profit_pct: default_drawdown_min_profit_pct(),
            drawdown_max_drawback_pct: default_drawdown_max_drawback_pct(),
            drawdown_check_interval_secs: default_drawdown_check_interval_secs(),
            open_fee_rate: default_open_fee_rate(),
        }
    }
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            limit: default_leaderboard_limit(),
        }
    }
}

impl Default for LiveRuntimeConfig {
    fn default() -> Self {
        Self {
            metrics_addr: default_metrics_addr(),
            log_path: default_live_log_path(),
            journal_dir: default_journal_dir(),
        }
    }
}

impl StreamConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs as i64)
    }
}

impl TraderConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    /// Trader symbols, or the stream universe when none are configured.
    pub fn symbols_or<'a>(&'a self, fallback: &'a [String]) -> &'a [String] {
        if self.symbols.is_empty() {
            fallback
        } else {
            &self.symbols
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com/stream".to_string()
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_delay_ms() -> u64 {
    100
}

fn default_reconnect_backoff_secs() -> u64 {
    3
}

fn default_channel_capacity() -> usize {
    100
}

fn default_symbols() -> Vec<String> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::ThreeMinutes, Interval::FourHours]
}

fn default_cache_capacity() -> usize {
    100
}

fn default_max_age_secs() -> u64 {
    15 * 60
}

fn default_seed_concurrency() -> usize {
    5
}

fn default_price_interval() -> Interval {
    Interval::ThreeMinutes
}

fn default_advisor_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_advisor_model() -> String {
    "deepseek-chat".to_string()
}

fn default_advisor_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f32 {
    0.5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_drawdown_min_profit_pct() -> Decimal {
    Decimal::from(5)
}

fn default_drawdown_max_drawback_pct() -> Decimal {
    Decimal::from(40)
}

fn default_drawdown_check_interval_secs() -> u64 {
    60
}

fn default_open_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004 == 0.04%
}

fn default_fetch_timeout_ms() -> u64 {
    3_000
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_leaderboard_limit() -> usize {
    50
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_live_log_path() -> PathBuf {
    PathBuf::from("./logs/live.json")
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("./decision_logs")
}

fn default_ai_model() -> String {
    "deepseek".to_string()
}

fn default_exchange_name() -> String {
    "paper".to_string()
}

fn default_initial_balance() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_scan_interval_secs() -> u64 {
    180
}

fn default_leverage() -> u32 {
    5
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `KEEL__`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`] but rooted at an arbitrary directory.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("KEEL")
            .prefix_separator("__")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
log_level = "debug"

[stream]
symbols = ["btc", "ethusdt", "BTCUSDT"]
intervals = ["3m"]

[[traders]]
id = "alpha"
scan_interval_secs = 60
"#,
        )
        .unwrap();

        let config = load_config_from(dir.path(), None).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.stream.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.stream.intervals, vec![Interval::ThreeMinutes]);
        assert_eq!(config.stream.batch_size, 50);
        assert_eq!(config.cache.max_age_secs, 900);
        assert_eq!(config.risk.drawdown_max_drawback_pct, Decimal::from(40));
        assert_eq!(config.leaderboard.fetch_timeout_ms, 3_000);

        let trader = &config.traders[0];
        assert_eq!(trader.display_name(), "alpha");
        assert_eq!(trader.scan_interval(), Duration::from_secs(60));
        assert_eq!(
            trader.symbols_or(&config.stream.symbols),
            config.stream.symbols.as_slice()
        );
    }

    #[test]
    fn environment_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.toml"), "log_level = \"info\"\n").unwrap();
        fs::write(
            dir.path().join("paper.toml"),
            "log_level = \"warn\"\n[cache]\nmax_age_secs = 60\n",
        )
        .unwrap();

        let config = load_config_from(dir.path(), Some("paper")).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.cache.max_age(), chrono::Duration::seconds(60));
    }

    #[test]
    fn missing_default_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_from(dir.path(), None).is_err());
    }
}

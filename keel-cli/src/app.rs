use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use keel_config::{load_config, AppConfig};
use keel_journal::{analyze_performance, read_records, PerformanceAnalysis};

use crate::live::{ctrl_c_signal, run_live, run_watch};
use crate::telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "Keel LLM-advised derivatives trader")]
pub struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every configured trader until Ctrl-C
    Live(LiveArgs),
    /// Stream candles into the cache and report freshness
    Watch(WatchArgs),
    /// Summarize a trader's decision journal
    Journal(JournalArgs),
}

#[derive(Args)]
pub struct LiveArgs {
    #[arg(long)]
    metrics_addr: Option<String>,
    #[arg(long)]
    log_path: Option<PathBuf>,
}

#[derive(Args)]
pub struct WatchArgs {
    /// Comma-separated symbols (defaults to the configured stream universe)
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    #[arg(long, default_value_t = 30)]
    report_secs: u64,
}

#[derive(Args)]
pub struct JournalArgs {
    /// Path to a trader's JSON lines journal
    #[arg(long)]
    path: PathBuf,
    /// Venue used for fee lookups, overriding the recorded one
    #[arg(long)]
    exchange: Option<String>,
}

impl LiveArgs {
    fn resolved_log_path(&self, config: &AppConfig) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| config.live.log_path.clone())
    }

    fn resolved_metrics_addr(&self, config: &AppConfig) -> Result<SocketAddr> {
        let addr = self
            .metrics_addr
            .clone()
            .unwrap_or_else(|| config.live.metrics_addr.clone());
        addr.parse()
            .with_context(|| format!("invalid metrics address '{addr}'"))
    }

    async fn run(&self, config: &AppConfig) -> Result<()> {
        let metrics_addr = self.resolved_metrics_addr(config)?;
        run_live(config, metrics_addr, ctrl_c_signal()).await
    }
}

impl WatchArgs {
    async fn run(&self, config: &AppConfig) -> Result<()> {
        let every = Duration::from_secs(self.report_secs.max(1));
        run_watch(config, &self.symbols, every, ctrl_c_signal()).await
    }
}

impl JournalArgs {
    fn run(&self) -> Result<()> {
        let mut records = read_records(&self.path)
            .with_context(|| format!("failed to read journal {}", self.path.display()))?;
        if let Some(exchange) = &self.exchange {
            for record in &mut records {
                record.exchange = exchange.clone();
            }
        }
        let analysis = analyze_performance(&records);
        println!("Journal: {} ({} cycles)", self.path.display(), records.len());
        print_analysis(&analysis);
        Ok(())
    }
}

fn print_analysis(analysis: &PerformanceAnalysis) {
    println!(
        "Trades: {} (won {}, lost {})",
        analysis.total_trades, analysis.winning_trades, analysis.losing_trades
    );
    println!("Win rate: {}%", analysis.win_rate.round_dp(2));
    println!("Total PnL: {}", analysis.total_pnl.round_dp(2));
    println!("Average win: {}", analysis.average_win.round_dp(2));
    println!("Average loss: {}", analysis.average_loss.round_dp(2));
    println!("Profit factor: {}", analysis.profit_factor.round_dp(2));
    if analysis.recent_trades.is_empty() {
        return;
    }
    println!("Recent trades:");
    for trade in &analysis.recent_trades {
        println!(
            "  {} {} {}x qty {} {} -> {} pnl {} ({}%) closed {}",
            trade.symbol,
            trade.side,
            trade.leverage,
            trade.quantity,
            trade.open_price,
            trade.close_price.round_dp(4),
            trade.pnl.round_dp(2),
            trade.pnl_pct.round_dp(2),
            trade.close_time.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });

    let log_override = match &cli.command {
        Commands::Live(args) => Some(args.resolved_log_path(&config)),
        _ => None,
    };

    init_tracing(&filter, log_override.as_deref()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Live(args) => args.run(&config).await?,
        Commands::Watch(args) => args.run(&config).await?,
        Commands::Journal(args) => args.run()?,
    }

    Ok(())
}

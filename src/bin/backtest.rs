//! Manual backtest CLI: runs one [`Backtester`] pass over a window and
//! exits, for operators who don't want to wait for the next autorun cycle.
//! Mirrors the original `run_analysis_backtest(window_days, exchange,
//! top200_only)` entrypoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use perp_screener::application::backtester::Backtester;
use perp_screener::config::CoreConfig;
use perp_screener::domain::grader::WinRateTable;
use perp_screener::infrastructure::persistence::alert_store::AlertStore;
use perp_screener::infrastructure::persistence::backtest_store::BacktestStore;
use perp_screener::infrastructure::persistence::candle_store::CandleStore;
use perp_screener::infrastructure::persistence::database::Database;

#[derive(Parser, Debug)]
#[command(name = "backtest", about = "Replay persisted alerts forward and refresh the win-rate cache")]
struct Args {
    /// Trading window to backtest, in days.
    #[arg(long, default_value_t = 30)]
    window_days: u32,

    /// Exchange to backtest. Must be one of the configured EXCHANGES.
    #[arg(long)]
    exchange: String,

    /// Restrict to alerts fired while the symbol was in the liquidity top-200 cohort.
    #[arg(long, default_value_t = true)]
    top200_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = Arc::new(CoreConfig::from_env().context("failed to load configuration")?);

    let db = Database::new(&config.database_url).await?;
    let candle_store = CandleStore::new(db.pool.clone());
    let alert_store = AlertStore::new(db.pool.clone());
    let backtest_store = BacktestStore::new(db.pool.clone());
    let win_rates = Arc::new(ArcSwap::from_pointee(WinRateTable::new()));

    let backtester = Backtester::new(args.exchange.clone(), config, candle_store, alert_store, backtest_store, win_rates);

    let summary = backtester.run(args.window_days, args.top200_only).await?;
    println!(
        "exchange={} window_days={} n_alerts={} n_symbols_rated={}",
        args.exchange, summary.window_days, summary.n_alerts, summary.n_symbols_rated
    );
    Ok(())
}

//! Screener daemon entrypoint: wires one [`Aggregator`]/[`StreamSupervisor`]
//! pair per configured exchange, a shared [`AnalysisScheduler`] driving the
//! backtester, and runs until `SIGINT`/`SIGTERM`.

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tracing::info;
use tracing_subscriber::EnvFilter;

use perp_screener::application::aggregator::Aggregator;
use perp_screener::application::analysis_scheduler::AnalysisScheduler;
use perp_screener::application::backtester::Backtester;
use perp_screener::application::supervisor::StreamSupervisor;
use perp_screener::config::CoreConfig;
use perp_screener::domain::grader::WinRateTable;
use perp_screener::infrastructure::alerter::{AlertSink, LoggingSink};
use perp_screener::infrastructure::exchange::ExchangeAdapter;
use perp_screener::infrastructure::exchange::binance::BinanceAdapter;
use perp_screener::infrastructure::exchange::bybit::BybitAdapter;
use perp_screener::infrastructure::exchange::stub::StubAdapter;
use perp_screener::infrastructure::persistence::alert_store::AlertStore;
use perp_screener::infrastructure::persistence::backtest_store::BacktestStore;
use perp_screener::infrastructure::persistence::candle_store::CandleStore;
use perp_screener::infrastructure::persistence::database::Database;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Arc::new(CoreConfig::from_env().context("failed to load configuration")?);
    info!(exchanges = ?config.exchanges, "starting screener");

    let db = Database::new(&config.database_url).await?;
    let candle_store = CandleStore::new(db.pool.clone());
    let alert_store = AlertStore::new(db.pool.clone());
    let backtest_store = BacktestStore::new(db.pool.clone());

    let alerter: Arc<dyn AlertSink> = Arc::new(LoggingSink);

    let mut supervisors = Vec::new();
    let mut backtesters = Vec::new();

    for exchange in &config.exchanges {
        let adapter: Arc<dyn ExchangeAdapter> = match exchange.as_str() {
            "binance" => Arc::new(BinanceAdapter::new(config.binance_futures_rest.clone(), config.binance_futures_ws.clone())),
            "bybit" => Arc::new(BybitAdapter::new(config.bybit_rest.clone())),
            other => {
                // Leaked once at startup per configured-but-unsupported
                // exchange name; the stub never unregisters, so this is a
                // bounded, one-time allocation rather than a per-tick leak.
                let leaked: &'static str = Box::leak(other.to_string().into_boxed_str());
                Arc::new(StubAdapter::new(leaked))
            }
        };

        let win_rates = Arc::new(ArcSwap::from_pointee(WinRateTable::new()));
        let aggregator = Arc::new(Aggregator::new(
            exchange.clone(),
            config.clone(),
            candle_store.clone(),
            alert_store.clone(),
            alerter.clone(),
            win_rates.clone(),
        ));

        let supervisor = StreamSupervisor::new(exchange.clone(), adapter, aggregator, candle_store.clone(), config.clone());
        supervisor.clone().start().await.with_context(|| format!("failed to start {exchange} supervisor"))?;
        supervisors.push(supervisor);

        backtesters.push(Backtester::new(
            exchange.clone(),
            config.clone(),
            candle_store.clone(),
            alert_store.clone(),
            backtest_store.clone(),
            win_rates,
        ));
    }

    let scheduler = AnalysisScheduler::new(backtesters, config.clone());
    tokio::spawn(scheduler.run_forever());

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping supervisors");
    for supervisor in &supervisors {
        supervisor.stop().await;
    }
    Ok(())
}

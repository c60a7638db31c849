//! Replays fired alerts forward against 15m candles to score the strategy's
//! historical performance and refresh the grader's win-rate cache.
//!
//! Grounded in the original `backtester.py`/`analysis_backtester.py` pair:
//! persisted trade plans are the source of entries, a day of forward 15m
//! bars (`HORIZON_15M_BARS`) is the resolution horizon, and NONE outcomes
//! are recorded but excluded from the per-bucket win-rate aggregate.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use tracing::info;

use crate::config::CoreConfig;
use crate::domain::alert::Signal;
use crate::domain::backtest_trade::{BacktestTrade, ForwardBar, Resolution, resolve_forward};
use crate::domain::candle::Interval;
use crate::domain::grader::{Side, WinRateTable};
use crate::infrastructure::persistence::alert_store::AlertStore;
use crate::infrastructure::persistence::backtest_store::{BacktestResultRow, BacktestStore};
use crate::infrastructure::persistence::candle_store::CandleStore;

const STRATEGY_VERSION: &str = "v1_structure_atr";
/// One day of 15m candles.
const HORIZON_15M_BARS: u32 = 96;
/// Symbols with fewer resolved trades than this are omitted from the
/// grader's win-rate cache rather than reported on a thin sample.
const MIN_TRADES_FOR_WIN_RATE: u32 = 5;

pub struct BacktestRunSummary {
    pub window_days: u32,
    pub n_alerts: u32,
    pub n_symbols_rated: usize,
}

/// Key for one `backtest_results` row: a symbol's trades sharing the same
/// grade/timeframe/signal bucket.
#[derive(Hash, PartialEq, Eq, Clone)]
struct ResultKey {
    symbol: String,
    grade: char,
    source_tf: String,
    signal: String,
}

/// Replays one exchange's alert history. Shares its `win_rates` handle with
/// that exchange's [`crate::application::aggregator::Aggregator`] so a
/// completed run is visible to the grader on the very next snapshot.
pub struct Backtester {
    exchange: String,
    #[allow(dead_code)]
    config: Arc<CoreConfig>,
    candle_store: CandleStore,
    alert_store: AlertStore,
    backtest_store: BacktestStore,
    win_rates: Arc<ArcSwap<WinRateTable>>,
}

impl Backtester {
    pub fn new(
        exchange: impl Into<String>,
        config: Arc<CoreConfig>,
        candle_store: CandleStore,
        alert_store: AlertStore,
        backtest_store: BacktestStore,
        win_rates: Arc<ArcSwap<WinRateTable>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            config,
            candle_store,
            alert_store,
            backtest_store,
            win_rates,
        }
    }

    /// Populates `backtest_trades`/`backtest_results` for alerts fired in
    /// the last `window_days`, then recomputes and installs the grader's
    /// per-symbol win-rate table.
    pub async fn run(&self, window_days: u32, top200_only: bool) -> Result<BacktestRunSummary> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let since_ts = now_ms - window_days as i64 * 24 * 60 * 60 * 1000;

        let pairs = self
            .alert_store
            .alerts_with_plans_since(Some(&self.exchange), since_ts, top200_only)
            .await?;

        let mut buckets: HashMap<ResultKey, Vec<BacktestTrade>> = HashMap::new();

        for (alert, plan) in &pairs {
            let side = match alert.signal {
                Signal::Buy => Side::Buy,
                Signal::Sell => Side::Sell,
            };
            let liquidity_top200 = serde_json::from_str::<serde_json::Value>(&alert.metrics_json)
                .ok()
                .and_then(|v| v.get("liquidity_top200").and_then(|b| b.as_bool()))
                .unwrap_or(false);

            let tps: Vec<f64> = [plan.tp1, plan.tp2, plan.tp3].into_iter().flatten().collect();

            let forward = self
                .candle_store
                .get_after(&self.exchange, &alert.symbol, Interval::FifteenMin, alert.event_ts, HORIZON_15M_BARS)
                .await?;

            let (resolved, r_multiple, mae_r, mfe_r, bars_to_resolve, resolved_ts) = if forward.is_empty() {
                (Resolution::None, None, 0.0, 0.0, None, None)
            } else {
                let bars: Vec<ForwardBar> = forward
                    .iter()
                    .map(|c| ForwardBar {
                        open_time_ms: c.open_time_ms,
                        high: c.high,
                        low: c.low,
                    })
                    .collect();
                let outcome = resolve_forward(side, plan.entry_price, plan.stop_loss, &tps, &bars);
                (outcome.resolved, outcome.r_multiple, outcome.mae_r, outcome.mfe_r, outcome.bars_to_resolve, outcome.resolved_ts)
            };

            let trade = BacktestTrade {
                alert_id: alert.id.unwrap_or_default(),
                window_days,
                strategy_version: STRATEGY_VERSION.to_string(),
                created_ts: alert.created_ts,
                exchange: alert.exchange.clone(),
                symbol: alert.symbol.clone(),
                signal: alert.signal.as_str().to_string(),
                source_tf: alert.source_tf.clone(),
                grade: alert.setup_grade,
                score: alert.setup_score,
                liquidity_top200,
                entry: plan.entry_price,
                stop: plan.stop_loss,
                tps,
                resolved,
                r_multiple,
                mae_r,
                mfe_r,
                bars_to_resolve,
                resolved_ts,
            };

            self.backtest_store.upsert_trade(&trade).await?;

            let key = ResultKey {
                symbol: trade.symbol.clone(),
                grade: trade.grade,
                source_tf: trade.source_tf.clone(),
                signal: trade.signal.clone(),
            };
            buckets.entry(key).or_default().push(trade);
        }

        let updated_ts = now_ms;
        for (key, trades) in &buckets {
            let total = trades.len() as f64;
            let resolved: Vec<&BacktestTrade> = trades.iter().filter(|t| t.resolved != Resolution::None && t.resolved != Resolution::Pending).collect();
            let resolved_count = resolved.len() as f64;
            let wins = resolved.iter().filter(|t| t.resolved.is_win_any_tp()).count() as f64;

            let win_rate_any_tp = if resolved_count > 0.0 { wins / resolved_count } else { 0.0 };
            let win_rate_realistic = if total > 0.0 { wins / total } else { 0.0 };

            let (avg_r, avg_mae_r, avg_mfe_r, avg_bars) = if resolved_count > 0.0 {
                let sum_r: f64 = resolved.iter().filter_map(|t| t.r_multiple).sum();
                let sum_mae: f64 = resolved.iter().map(|t| t.mae_r).sum();
                let sum_mfe: f64 = resolved.iter().map(|t| t.mfe_r).sum();
                let sum_bars: f64 = resolved.iter().filter_map(|t| t.bars_to_resolve).map(|b| b as f64).sum();
                (sum_r / resolved_count, sum_mae / resolved_count, sum_mfe / resolved_count, sum_bars / resolved_count)
            } else {
                (0.0, 0.0, 0.0, 0.0)
            };

            let row = BacktestResultRow {
                exchange: self.exchange.clone(),
                symbol: key.symbol.clone(),
                window_days,
                grade: key.grade,
                source_tf: key.source_tf.clone(),
                signal: key.signal.clone(),
                count: total as u32,
                win_rate_any_tp,
                win_rate_realistic,
                avg_r,
                avg_mae_r,
                avg_mfe_r,
                avg_bars,
            };
            self.backtest_store.upsert_result(&row, updated_ts).await?;
        }

        self.backtest_store
            .record_analysis_run(now_ms, window_days, &self.exchange, top200_only, pairs.len() as u32)
            .await?;

        let table = self
            .backtest_store
            .symbol_win_rate_table(&self.exchange, window_days, MIN_TRADES_FOR_WIN_RATE)
            .await?;
        let n_symbols_rated = table.len();
        self.win_rates.store(Arc::new(table));

        info!(exchange = %self.exchange, window_days, n_alerts = pairs.len(), n_symbols_rated, "backtest run complete");

        Ok(BacktestRunSummary {
            window_days,
            n_alerts: pairs.len() as u32,
            n_symbols_rated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::Alert;
    use crate::domain::candle::Candle;
    use crate::domain::trade_plan::TradePlan;
    use sqlx::SqlitePool;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_ts INTEGER NOT NULL,
                created_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                signal TEXT NOT NULL,
                source_tf TEXT NOT NULL,
                price REAL NOT NULL,
                reason TEXT NOT NULL,
                setup_score REAL NOT NULL,
                setup_grade TEXT NOT NULL,
                avoid_reasons_json TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                UNIQUE (exchange, symbol, signal, event_ts)
            );
            CREATE TABLE trade_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL,
                event_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                tp1 REAL, tp2 REAL, tp3 REAL,
                atr REAL NOT NULL,
                atr_mult REAL NOT NULL,
                swing_ref REAL NOT NULL,
                risk_per_unit REAL NOT NULL,
                rr_tp1 REAL, rr_tp2 REAL, rr_tp3 REAL,
                plan_json TEXT NOT NULL
            );
            CREATE TABLE ohlc (
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, interval TEXT NOT NULL,
                open_time_ms INTEGER NOT NULL, close_time_ms INTEGER NOT NULL,
                open REAL NOT NULL, high REAL NOT NULL, low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
                PRIMARY KEY (exchange, symbol, interval, open_time_ms)
            );
            CREATE TABLE backtest_trades (
                alert_id INTEGER NOT NULL, window_days INTEGER NOT NULL, strategy_version TEXT NOT NULL,
                created_ts INTEGER NOT NULL, exchange TEXT NOT NULL, symbol TEXT NOT NULL, signal TEXT NOT NULL,
                source_tf TEXT NOT NULL, grade TEXT NOT NULL, score REAL NOT NULL, liquidity_top200 BOOLEAN NOT NULL,
                entry REAL NOT NULL, stop REAL NOT NULL, tps_json TEXT NOT NULL, resolved TEXT NOT NULL,
                r_multiple REAL, mae_r REAL NOT NULL, mfe_r REAL NOT NULL, bars_to_resolve INTEGER, resolved_ts INTEGER,
                PRIMARY KEY (alert_id, window_days, strategy_version)
            );
            CREATE TABLE backtest_results (
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, window_days INTEGER NOT NULL, grade TEXT NOT NULL,
                source_tf TEXT NOT NULL, signal TEXT NOT NULL, count INTEGER NOT NULL,
                win_rate_any_tp REAL NOT NULL, win_rate_realistic REAL NOT NULL, avg_r REAL NOT NULL,
                avg_mae_r REAL NOT NULL, avg_mfe_r REAL NOT NULL, avg_bars REAL NOT NULL, updated_ts INTEGER NOT NULL,
                PRIMARY KEY (exchange, symbol, window_days, grade, source_tf, signal)
            );
            CREATE TABLE analysis_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT, ts INTEGER NOT NULL, window_days INTEGER NOT NULL,
                exchange TEXT NOT NULL, top200_only BOOLEAN NOT NULL, n_alerts INTEGER NOT NULL,
                UNIQUE (window_days, exchange, top200_only)
            );
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn sample_alert(event_ts: i64) -> Alert {
        Alert {
            id: None,
            event_ts,
            created_ts: event_ts,
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            signal: Signal::Buy,
            source_tf: "15m".to_string(),
            price: 100.0,
            reason: "cipher_b_buy".to_string(),
            setup_score: 6.5,
            setup_grade: 'A',
            avoid_reasons: vec![],
            metrics_json: r#"{"liquidity_top200": true}"#.to_string(),
        }
    }

    fn sample_plan(alert_id: i64, event_ts: i64) -> TradePlan {
        TradePlan {
            id: None,
            alert_id,
            event_ts,
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            entry_type: "market".to_string(),
            entry_price: 100.0,
            stop_loss: 98.0,
            tp1: Some(103.0),
            tp2: Some(105.0),
            tp3: Some(108.0),
            atr: 1.0,
            atr_mult: 2.5,
            swing_ref: 98.0,
            risk_per_unit: 2.0,
            rr_tp1: Some(1.5),
            rr_tp2: Some(2.5),
            rr_tp3: Some(4.0),
            plan_json: "{}".to_string(),
        }
    }

    fn test_config() -> CoreConfig {
        CoreConfig {
            top_symbols: 150,
            window_short: 5,
            window_medium: 15,
            atr_period: 14,
            vol_lookback: 30,
            include_symbols: vec![],
            exclude_symbols: vec![],
            snapshot_interval_ms: 30_000,
            ws_heartbeat_sec: 15,
            ws_ping_interval_sec: 15,
            cipherb_os_level: -40.0,
            cipherb_ob_level: 40.0,
            liq_top_n: 200,
            liq_weights: crate::config::LiquidityWeights {
                turnover: 0.6,
                open_interest: 0.3,
                activity: 0.1,
            },
            trade_plan: crate::config::TradePlanConfig {
                enabled: true,
                atr_mult: 2.5,
                swing_lookback_15m: 20,
                tp_r_mults: [1.5, 2.5, 4.0],
            },
            vol_due: crate::config::VolDueConfig {
                bb_width_15m: 0.03,
                bb_width_4h: 0.05,
                atr_pct_15m: 0.015,
                atr_pct_4h: 0.02,
                lookback_bars: 96,
                percentile: 20.0,
            },
            full_refresh: crate::config::FullRefreshConfig {
                enabled: false,
                offset_sec: 2,
                backfill_limit: 200,
            },
            stale_ticker_ms: 60_000,
            stale_kline_ms: 60_000,
            alert_cooldown_top200_sec: 120,
            alert_cooldown_other_sec: 300,
            alert_min_grade: 'B',
            analysis_autorun_interval_min: 60,
            analysis_autorun_windows_days: vec![7, 30],
            database_url: "sqlite::memory:".to_string(),
            exchanges: vec!["binance".to_string()],
            binance_futures_ws: "wss://fstream.binance.com".to_string(),
            binance_futures_rest: "https://fapi.binance.com".to_string(),
            bybit_rest: "https://api.bybit.com".to_string(),
            market_cap_cache_ttl_ms: 6 * 60 * 60 * 1000,
            subscriber_queue_capacity: 100,
        }
    }

    #[tokio::test]
    async fn run_resolves_tp1_and_installs_win_rate() {
        let pool = memory_pool().await;
        let alert_store = AlertStore::new(pool.clone());
        let candle_store = CandleStore::new(pool.clone());
        let backtest_store = BacktestStore::new(pool.clone());

        let alert_id = alert_store.insert(&sample_alert(1_000)).await.unwrap().unwrap();
        alert_store.insert_trade_plan(&sample_plan(alert_id, 1_000)).await.unwrap();

        for i in 0..3i64 {
            let open_time = 1_000 + i * 900_000;
            candle_store
                .upsert(
                    "binance",
                    "BTCUSDT",
                    Interval::FifteenMin,
                    &Candle {
                        open_time_ms: open_time,
                        close_time_ms: open_time + 899_999,
                        open: 100.0,
                        high: 104.0,
                        low: 99.0,
                        close: 103.5,
                        volume: 10.0,
                        closed: true,
                    },
                )
                .await
                .unwrap();
        }

        let config = Arc::new(test_config());
        let win_rates = Arc::new(ArcSwap::from_pointee(WinRateTable::new()));
        let backtester = Backtester::new("binance", config, candle_store, alert_store, backtest_store, win_rates);

        let summary = backtester.run(30, false).await.unwrap();
        assert_eq!(summary.n_alerts, 1);
    }

    #[tokio::test]
    async fn run_with_no_forward_candles_records_none_resolution() {
        let pool = memory_pool().await;
        let alert_store = AlertStore::new(pool.clone());
        let candle_store = CandleStore::new(pool.clone());
        let backtest_store = BacktestStore::new(pool.clone());

        let alert_id = alert_store.insert(&sample_alert(1_000)).await.unwrap().unwrap();
        alert_store.insert_trade_plan(&sample_plan(alert_id, 1_000)).await.unwrap();

        let config = Arc::new(test_config());
        let win_rates = Arc::new(ArcSwap::from_pointee(WinRateTable::new()));
        let backtester = Backtester::new("binance", config, candle_store, alert_store.clone(), backtest_store.clone(), win_rates);

        backtester.run(30, false).await.unwrap();
        let trades = backtest_store.trades_for_symbol("binance", "BTCUSDT", 30).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].resolved, Resolution::None);
    }

    #[tokio::test]
    async fn top200_only_excludes_non_cohort_alerts() {
        let pool = memory_pool().await;
        let alert_store = AlertStore::new(pool.clone());
        let candle_store = CandleStore::new(pool.clone());
        let backtest_store = BacktestStore::new(pool.clone());

        let mut alert = sample_alert(1_000);
        alert.metrics_json = r#"{"liquidity_top200": false}"#.to_string();
        let alert_id = alert_store.insert(&alert).await.unwrap().unwrap();
        alert_store.insert_trade_plan(&sample_plan(alert_id, 1_000)).await.unwrap();

        let config = Arc::new(test_config());
        let win_rates = Arc::new(ArcSwap::from_pointee(WinRateTable::new()));
        let backtester = Backtester::new("binance", config, candle_store, alert_store, backtest_store, win_rates);

        let summary = backtester.run(30, true).await.unwrap();
        assert_eq!(summary.n_alerts, 0);
    }
}

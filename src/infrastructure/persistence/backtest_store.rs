//! Backtester persistence: per-trade outcomes, the aggregated
//! `backtest_results` rollup the grader's win-rate cache reads from, and
//! `analysis_runs` bookkeeping for the scheduled full recompute.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::backtest_trade::{BacktestTrade, Resolution};

#[derive(Debug, Clone)]
pub struct BacktestResultRow {
    pub exchange: String,
    pub symbol: String,
    pub window_days: u32,
    pub grade: char,
    pub source_tf: String,
    pub signal: String,
    pub count: u32,
    pub win_rate_any_tp: f64,
    pub win_rate_realistic: f64,
    pub avg_r: f64,
    pub avg_mae_r: f64,
    pub avg_mfe_r: f64,
    pub avg_bars: f64,
}

#[derive(Clone)]
pub struct BacktestStore {
    pool: SqlitePool,
}

impl BacktestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_trade(&self, trade: &BacktestTrade) -> Result<()> {
        let tps_json = serde_json::to_string(&trade.tps)?;
        sqlx::query(
            r#"
            INSERT INTO backtest_trades
                (alert_id, window_days, strategy_version, created_ts, exchange, symbol, signal,
                 source_tf, grade, score, liquidity_top200, entry, stop, tps_json, resolved,
                 r_multiple, mae_r, mfe_r, bars_to_resolve, resolved_ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(alert_id, window_days, strategy_version) DO UPDATE SET
                resolved = excluded.resolved,
                r_multiple = excluded.r_multiple,
                mae_r = excluded.mae_r,
                mfe_r = excluded.mfe_r,
                bars_to_resolve = excluded.bars_to_resolve,
                resolved_ts = excluded.resolved_ts
            "#,
        )
        .bind(trade.alert_id)
        .bind(trade.window_days)
        .bind(&trade.strategy_version)
        .bind(trade.created_ts)
        .bind(&trade.exchange)
        .bind(&trade.symbol)
        .bind(&trade.signal)
        .bind(&trade.source_tf)
        .bind(trade.grade.to_string())
        .bind(trade.score)
        .bind(trade.liquidity_top200)
        .bind(trade.entry)
        .bind(trade.stop)
        .bind(tps_json)
        .bind(trade.resolved.as_str())
        .bind(trade.r_multiple)
        .bind(trade.mae_r)
        .bind(trade.mfe_r)
        .bind(trade.bars_to_resolve)
        .bind(trade.resolved_ts)
        .execute(&self.pool)
        .await
        .context("failed to upsert backtest trade")?;
        Ok(())
    }

    pub async fn trades_for_symbol(&self, exchange: &str, symbol: &str, window_days: u32) -> Result<Vec<BacktestTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT alert_id, window_days, strategy_version, created_ts, exchange, symbol, signal,
                   source_tf, grade, score, liquidity_top200, entry, stop, tps_json, resolved,
                   r_multiple, mae_r, mfe_r, bars_to_resolve, resolved_ts
            FROM backtest_trades
            WHERE exchange = ? AND symbol = ? AND window_days = ?
            "#,
        )
        .bind(exchange)
        .bind(symbol)
        .bind(window_days)
        .fetch_all(&self.pool)
        .await
        .context("failed to read backtest trades")?;

        rows.iter().map(row_to_trade).collect()
    }

    pub async fn upsert_result(&self, result: &BacktestResultRow, updated_ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backtest_results
                (exchange, symbol, window_days, grade, source_tf, signal, count, win_rate_any_tp,
                 win_rate_realistic, avg_r, avg_mae_r, avg_mfe_r, avg_bars, updated_ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(exchange, symbol, window_days, grade, source_tf, signal) DO UPDATE SET
                count = excluded.count,
                win_rate_any_tp = excluded.win_rate_any_tp,
                win_rate_realistic = excluded.win_rate_realistic,
                avg_r = excluded.avg_r,
                avg_mae_r = excluded.avg_mae_r,
                avg_mfe_r = excluded.avg_mfe_r,
                avg_bars = excluded.avg_bars,
                updated_ts = excluded.updated_ts
            "#,
        )
        .bind(&result.exchange)
        .bind(&result.symbol)
        .bind(result.window_days)
        .bind(result.grade.to_string())
        .bind(&result.source_tf)
        .bind(&result.signal)
        .bind(result.count)
        .bind(result.win_rate_any_tp)
        .bind(result.win_rate_realistic)
        .bind(result.avg_r)
        .bind(result.avg_mae_r)
        .bind(result.avg_mfe_r)
        .bind(result.avg_bars)
        .bind(updated_ts)
        .execute(&self.pool)
        .await
        .context("failed to upsert backtest result")?;
        Ok(())
    }

    /// All rollups for an exchange, keyed for the grader's win-rate cache:
    /// `"{symbol}|{grade}|{source_tf}|{signal}"` -> `win_rate_realistic`.
    pub async fn win_rate_table(&self, exchange: &str, window_days: u32) -> Result<std::collections::HashMap<String, f64>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, grade, source_tf, signal, win_rate_realistic
            FROM backtest_results
            WHERE exchange = ? AND window_days = ?
            "#,
        )
        .bind(exchange)
        .bind(window_days)
        .fetch_all(&self.pool)
        .await
        .context("failed to read win-rate table")?;

        let mut table = std::collections::HashMap::new();
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let grade: String = row.try_get("grade")?;
            let source_tf: String = row.try_get("source_tf")?;
            let signal: String = row.try_get("signal")?;
            let win_rate: f64 = row.try_get("win_rate_realistic")?;
            table.insert(format!("{symbol}|{grade}|{source_tf}|{signal}"), win_rate);
        }
        Ok(table)
    }

    /// Per-symbol win rate, weighted by trade count across every
    /// (grade, source_tf, signal) bucket, for the Grader's plain
    /// `symbol -> win_rate` cache. Symbols with fewer than `min_trades`
    /// resolved trades are omitted rather than reported on thin samples.
    pub async fn symbol_win_rate_table(&self, exchange: &str, window_days: u32, min_trades: u32) -> Result<std::collections::HashMap<String, f64>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, SUM(count) AS total_count, SUM(count * win_rate_realistic) AS weighted_wins
            FROM backtest_results
            WHERE exchange = ? AND window_days = ?
            GROUP BY symbol
            HAVING SUM(count) >= ?
            "#,
        )
        .bind(exchange)
        .bind(window_days)
        .bind(min_trades)
        .fetch_all(&self.pool)
        .await
        .context("failed to read symbol win-rate table")?;

        let mut table = std::collections::HashMap::new();
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let total_count: f64 = row.try_get("total_count")?;
            let weighted_wins: f64 = row.try_get("weighted_wins")?;
            if total_count > 0.0 {
                table.insert(symbol, weighted_wins / total_count);
            }
        }
        Ok(table)
    }

    pub async fn record_analysis_run(&self, ts: i64, window_days: u32, exchange: &str, top200_only: bool, n_alerts: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_runs (ts, window_days, exchange, top200_only, n_alerts)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(window_days, exchange, top200_only) DO UPDATE SET
                ts = excluded.ts,
                n_alerts = excluded.n_alerts
            "#,
        )
        .bind(ts)
        .bind(window_days)
        .bind(exchange)
        .bind(top200_only)
        .bind(n_alerts)
        .execute(&self.pool)
        .await
        .context("failed to record analysis run")?;
        Ok(())
    }
}

fn row_to_trade(row: &SqliteRow) -> Result<BacktestTrade> {
    let tps_json: String = row.try_get("tps_json")?;
    let grade: String = row.try_get("grade")?;
    Ok(BacktestTrade {
        alert_id: row.try_get("alert_id")?,
        window_days: row.try_get("window_days")?,
        strategy_version: row.try_get("strategy_version")?,
        created_ts: row.try_get("created_ts")?,
        exchange: row.try_get("exchange")?,
        symbol: row.try_get("symbol")?,
        signal: row.try_get("signal")?,
        source_tf: row.try_get("source_tf")?,
        grade: grade.chars().next().unwrap_or('C'),
        score: row.try_get("score")?,
        liquidity_top200: row.try_get("liquidity_top200")?,
        entry: row.try_get("entry")?,
        stop: row.try_get("stop")?,
        tps: serde_json::from_str(&tps_json).unwrap_or_default(),
        resolved: Resolution::from_str(&row.try_get::<String, _>("resolved")?)?,
        r_multiple: row.try_get("r_multiple")?,
        mae_r: row.try_get("mae_r")?,
        mfe_r: row.try_get("mfe_r")?,
        bars_to_resolve: row.try_get("bars_to_resolve")?,
        resolved_ts: row.try_get("resolved_ts")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> BacktestStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE backtest_trades (
                alert_id INTEGER NOT NULL,
                window_days INTEGER NOT NULL,
                strategy_version TEXT NOT NULL,
                created_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                signal TEXT NOT NULL,
                source_tf TEXT NOT NULL,
                grade TEXT NOT NULL,
                score REAL NOT NULL,
                liquidity_top200 BOOLEAN NOT NULL,
                entry REAL NOT NULL,
                stop REAL NOT NULL,
                tps_json TEXT NOT NULL,
                resolved TEXT NOT NULL,
                r_multiple REAL,
                mae_r REAL NOT NULL,
                mfe_r REAL NOT NULL,
                bars_to_resolve INTEGER,
                resolved_ts INTEGER,
                PRIMARY KEY (alert_id, window_days, strategy_version)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE backtest_results (
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                grade TEXT NOT NULL,
                source_tf TEXT NOT NULL,
                signal TEXT NOT NULL,
                count INTEGER NOT NULL,
                win_rate_any_tp REAL NOT NULL,
                win_rate_realistic REAL NOT NULL,
                avg_r REAL NOT NULL,
                avg_mae_r REAL NOT NULL,
                avg_mfe_r REAL NOT NULL,
                avg_bars REAL NOT NULL,
                updated_ts INTEGER NOT NULL,
                PRIMARY KEY (exchange, symbol, window_days, grade, source_tf, signal)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE analysis_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                window_days INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                top200_only BOOLEAN NOT NULL,
                n_alerts INTEGER NOT NULL,
                UNIQUE (window_days, exchange, top200_only)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        BacktestStore::new(pool)
    }

    fn sample_trade() -> BacktestTrade {
        BacktestTrade {
            alert_id: 1,
            window_days: 30,
            strategy_version: "1.0.0".to_string(),
            created_ts: 1_000,
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            signal: "BUY".to_string(),
            source_tf: "15m".to_string(),
            grade: 'A',
            score: 7.0,
            liquidity_top200: true,
            entry: 100.0,
            stop: 98.0,
            tps: vec![103.0, 105.0, 108.0],
            resolved: Resolution::Tp1,
            r_multiple: Some(1.0),
            mae_r: 0.2,
            mfe_r: 1.1,
            bars_to_resolve: Some(3),
            resolved_ts: Some(1_300),
        }
    }

    #[tokio::test]
    async fn upsert_trade_round_trips() {
        let store = memory_store().await;
        store.upsert_trade(&sample_trade()).await.unwrap();
        let trades = store.trades_for_symbol("binance", "BTCUSDT", 30).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].resolved, Resolution::Tp1);
        assert_eq!(trades[0].tps.len(), 3);
    }

    #[tokio::test]
    async fn upsert_trade_on_same_key_updates_resolution() {
        let store = memory_store().await;
        store.upsert_trade(&sample_trade()).await.unwrap();
        let mut updated = sample_trade();
        updated.resolved = Resolution::Sl;
        updated.r_multiple = Some(-1.0);
        store.upsert_trade(&updated).await.unwrap();

        let trades = store.trades_for_symbol("binance", "BTCUSDT", 30).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].resolved, Resolution::Sl);
    }

    #[tokio::test]
    async fn win_rate_table_keys_by_symbol_grade_tf_signal() {
        let store = memory_store().await;
        store
            .upsert_result(
                &BacktestResultRow {
                    exchange: "binance".to_string(),
                    symbol: "BTCUSDT".to_string(),
                    window_days: 30,
                    grade: 'A',
                    source_tf: "15m".to_string(),
                    signal: "BUY".to_string(),
                    count: 10,
                    win_rate_any_tp: 0.7,
                    win_rate_realistic: 0.6,
                    avg_r: 1.2,
                    avg_mae_r: 0.3,
                    avg_mfe_r: 1.5,
                    avg_bars: 4.0,
                },
                2_000,
            )
            .await
            .unwrap();

        let table = store.win_rate_table("binance", 30).await.unwrap();
        assert_eq!(table.get("BTCUSDT|A|15m|BUY"), Some(&0.6));
    }

    #[tokio::test]
    async fn symbol_win_rate_table_omits_thin_samples() {
        let store = memory_store().await;
        let row = |count: u32, win_rate: f64| BacktestResultRow {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            window_days: 30,
            grade: 'A',
            source_tf: "15m".to_string(),
            signal: "BUY".to_string(),
            count,
            win_rate_any_tp: win_rate,
            win_rate_realistic: win_rate,
            avg_r: 1.0,
            avg_mae_r: 0.2,
            avg_mfe_r: 1.0,
            avg_bars: 3.0,
        };
        store.upsert_result(&row(2, 0.8), 1_000).await.unwrap();
        let table = store.symbol_win_rate_table("binance", 30, 5).await.unwrap();
        assert!(table.get("BTCUSDT").is_none(), "2 trades is below the minimum sample");

        let mut richer = row(10, 0.6);
        richer.source_tf = "4h".to_string();
        store.upsert_result(&richer, 1_000).await.unwrap();
        let table = store.symbol_win_rate_table("binance", 30, 5).await.unwrap();
        assert!(table.get("BTCUSDT").is_some());
    }
}

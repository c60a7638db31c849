use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared database wrapper. `pool` is an `Arc`-backed handle — cloning it
/// is cheap and every repository holds its own clone rather than a
/// reference.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to sqlite database")?;

        info!(%db_url, "connected to candle store");

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Creates every table and index the store needs, and best-effort adds
    /// columns introduced by later schema revisions. `ALTER TABLE ... ADD
    /// COLUMN` failures are swallowed exactly when they indicate the column
    /// already exists; any other failure still surfaces.
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ohlc (
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time_ms INTEGER NOT NULL,
                close_time_ms INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (exchange, symbol, interval, open_time_ms)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create ohlc table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ohlc_lookup
            ON ohlc (exchange, symbol, interval, open_time_ms);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create ohlc index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
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
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create alerts table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_filter
            ON alerts (created_ts, setup_grade, signal, source_tf);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create alerts index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL REFERENCES alerts(id),
                event_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                tp1 REAL,
                tp2 REAL,
                tp3 REAL,
                atr REAL NOT NULL,
                atr_mult REAL NOT NULL,
                swing_ref REAL NOT NULL,
                risk_per_unit REAL NOT NULL,
                rr_tp1 REAL,
                rr_tp2 REAL,
                rr_tp3 REAL,
                plan_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_plans_alert ON trade_plans (alert_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create trade_plans table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_trades (
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
            );
            CREATE INDEX IF NOT EXISTS idx_backtest_trades_symbol
            ON backtest_trades (exchange, symbol, grade, source_tf, signal);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create backtest_trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_results (
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
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create backtest_results table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                window_days INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                top200_only BOOLEAN NOT NULL,
                n_alerts INTEGER NOT NULL,
                UNIQUE (window_days, exchange, top200_only)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create analysis_runs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_cap_cache (
                symbol TEXT PRIMARY KEY,
                market_cap REAL NOT NULL,
                updated_ts INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create market_cap_cache table")?;

        // Schema revision: avoid_reasons_json was added after the initial
        // alerts table; ignore the duplicate-column error on databases that
        // already have it.
        let _ = sqlx::query("ALTER TABLE alerts ADD COLUMN avoid_reasons_json TEXT NOT NULL DEFAULT '[]'")
            .execute(&mut *conn)
            .await;

        info!("candle store schema initialized");
        Ok(())
    }
}

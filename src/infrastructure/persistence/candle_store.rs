//! OHLC persistence: upsert-on-conflict writes and ascending-ordered reads,
//! batched across symbols with a window-function partition so startup
//! backfill can hydrate the whole universe in one round trip.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::domain::candle::{Candle, Interval};

#[derive(Clone)]
pub struct CandleStore {
    pool: SqlitePool,
}

impl CandleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, exchange: &str, symbol: &str, interval: Interval, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ohlc(exchange, symbol, interval, open_time_ms, close_time_ms, open, high, low, close, volume)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(exchange, symbol, interval, open_time_ms) DO UPDATE SET
                close_time_ms = excluded.close_time_ms,
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
            "#,
        )
        .bind(exchange)
        .bind(symbol)
        .bind(interval.as_str())
        .bind(candle.open_time_ms)
        .bind(candle.close_time_ms)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await
        .context("failed to upsert candle")?;
        Ok(())
    }

    /// Rows ordered by `open_time_ms` ascending, most recent `limit` candles.
    pub async fn get_recent(&self, exchange: &str, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT open_time_ms, close_time_ms, open, high, low, close, volume
            FROM ohlc
            WHERE exchange = ? AND symbol = ? AND interval = ?
            ORDER BY open_time_ms DESC
            LIMIT ?
            "#,
        )
        .bind(exchange)
        .bind(symbol)
        .bind(interval.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to read recent candles")?;

        let mut candles: Vec<Candle> = rows.iter().map(row_to_candle).collect::<Result<_>>()?;
        candles.reverse();
        Ok(candles)
    }

    /// Fetches the most recent `limit` candles per symbol in one query via
    /// a `ROW_NUMBER() OVER (PARTITION BY symbol ...)` window, rather than
    /// one round trip per symbol.
    pub async fn get_recent_batch(
        &self,
        exchange: &str,
        symbols: &[String],
        interval: Interval,
        limit: u32,
    ) -> Result<HashMap<String, Vec<Candle>>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = symbols.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            r#"
            SELECT symbol, open_time_ms, close_time_ms, open, high, low, close, volume
            FROM (
                SELECT *, ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY open_time_ms DESC) AS rn
                FROM ohlc
                WHERE exchange = ? AND interval = ? AND symbol IN ({placeholders})
            )
            WHERE rn <= ?
            ORDER BY symbol, open_time_ms ASC
            "#
        );

        let mut q = sqlx::query(&query).bind(exchange).bind(interval.as_str());
        for symbol in symbols {
            q = q.bind(symbol);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await.context("failed to read recent candle batch")?;

        let mut result: HashMap<String, Vec<Candle>> = HashMap::new();
        for row in &rows {
            let symbol: String = row.try_get("symbol")?;
            result.entry(symbol).or_default().push(row_to_candle(row)?);
        }
        Ok(result)
    }

    /// Rows with `open_time_ms >= start_open_time_ms`, ascending.
    pub async fn get_after(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start_open_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT open_time_ms, close_time_ms, open, high, low, close, volume
            FROM ohlc
            WHERE exchange = ? AND symbol = ? AND interval = ? AND open_time_ms >= ?
            ORDER BY open_time_ms ASC
            LIMIT ?
            "#,
        )
        .bind(exchange)
        .bind(symbol)
        .bind(interval.as_str())
        .bind(start_open_time_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to read candles after cursor")?;

        rows.iter().map(row_to_candle).collect()
    }
}

fn row_to_candle(row: &sqlx::sqlite::SqliteRow) -> Result<Candle> {
    Ok(Candle {
        open_time_ms: row.try_get("open_time_ms")?,
        close_time_ms: row.try_get("close_time_ms")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        closed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> CandleStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE ohlc (
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
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        CandleStore::new(pool)
    }

    fn candle(open_time_ms: i64, close: f64) -> Candle {
        Candle {
            open_time_ms,
            close_time_ms: open_time_ms + 59_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            closed: true,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_recent_round_trips_in_order() {
        let store = memory_store().await;
        for i in 0..5i64 {
            store.upsert("binance", "BTCUSDT", Interval::OneMin, &candle(i * 60_000, i as f64)).await.unwrap();
        }
        let rows = store.get_recent("binance", "BTCUSDT", Interval::OneMin, 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].close, 2.0);
        assert_eq!(rows[2].close, 4.0);
    }

    #[tokio::test]
    async fn upsert_on_same_open_time_overwrites() {
        let store = memory_store().await;
        store.upsert("binance", "BTCUSDT", Interval::OneMin, &candle(0, 1.0)).await.unwrap();
        store.upsert("binance", "BTCUSDT", Interval::OneMin, &candle(0, 2.0)).await.unwrap();
        let rows = store.get_recent("binance", "BTCUSDT", Interval::OneMin, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 2.0);
    }

    #[tokio::test]
    async fn get_recent_batch_partitions_by_symbol() {
        let store = memory_store().await;
        for i in 0..3i64 {
            store.upsert("binance", "BTCUSDT", Interval::OneMin, &candle(i * 60_000, i as f64)).await.unwrap();
            store.upsert("binance", "ETHUSDT", Interval::OneMin, &candle(i * 60_000, i as f64 * 10.0)).await.unwrap();
        }
        let batch = store
            .get_recent_batch("binance", &["BTCUSDT".to_string(), "ETHUSDT".to_string()], Interval::OneMin, 2)
            .await
            .unwrap();
        assert_eq!(batch["BTCUSDT"].len(), 2);
        assert_eq!(batch["ETHUSDT"].len(), 2);
        assert_eq!(batch["ETHUSDT"][1].close, 20.0);
    }

    #[tokio::test]
    async fn get_after_excludes_earlier_open_times() {
        let store = memory_store().await;
        for i in 0..5i64 {
            store.upsert("binance", "BTCUSDT", Interval::OneMin, &candle(i * 60_000, i as f64)).await.unwrap();
        }
        let rows = store.get_after("binance", "BTCUSDT", Interval::OneMin, 2 * 60_000, 10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].open_time_ms, 2 * 60_000);
    }
}

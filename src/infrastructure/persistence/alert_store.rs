//! Alert and trade-plan persistence. Alerts are insert-or-ignore on the
//! `(exchange, symbol, signal, event_ts)` key so a re-emitted signal from a
//! reconnect never double-counts.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::alert::{Alert, Signal};
use crate::domain::trade_plan::TradePlan;

#[derive(Clone)]
pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the alert, returning its row id. Returns `Ok(None)` when the
    /// `(exchange, symbol, signal, event_ts)` key already exists — the
    /// caller treats this as "already fired, skip the trade plan too".
    pub async fn insert(&self, alert: &Alert) -> Result<Option<i64>> {
        let avoid_reasons_json = serde_json::to_string(&alert.avoid_reasons)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO alerts
                (event_ts, created_ts, exchange, symbol, signal, source_tf, price, reason,
                 setup_score, setup_grade, avoid_reasons_json, metrics_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.event_ts)
        .bind(alert.created_ts)
        .bind(&alert.exchange)
        .bind(&alert.symbol)
        .bind(alert.signal.as_str())
        .bind(&alert.source_tf)
        .bind(alert.price)
        .bind(&alert.reason)
        .bind(alert.setup_score)
        .bind(alert.setup_grade.to_string())
        .bind(avoid_reasons_json)
        .bind(&alert.metrics_json)
        .execute(&self.pool)
        .await
        .context("failed to insert alert")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn recent(&self, exchange: &str, limit: u32) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_ts, created_ts, exchange, symbol, signal, source_tf, price, reason,
                   setup_score, setup_grade, avoid_reasons_json, metrics_json
            FROM alerts
            WHERE exchange = ?
            ORDER BY created_ts DESC
            LIMIT ?
            "#,
        )
        .bind(exchange)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to read recent alerts")?;

        rows.iter().map(row_to_alert).collect()
    }

    /// Alerts joined to their trade plan, `created_ts >= since_ts`, optionally
    /// scoped to one exchange and to symbols that were in the liquidity
    /// top-200 cohort at signal time. Feeds the backtester's trade selection.
    pub async fn alerts_with_plans_since(
        &self,
        exchange: Option<&str>,
        since_ts: i64,
        top200_only: bool,
    ) -> Result<Vec<(Alert, TradePlan)>> {
        let mut where_sql = String::from("a.created_ts >= ?");
        if exchange.is_some() {
            where_sql.push_str(" AND a.exchange = ?");
        }
        if top200_only {
            where_sql.push_str(
                " AND (a.metrics_json LIKE '%\"liquidity_top200\":true%' OR a.metrics_json LIKE '%\"liquidity_top200\": true%')",
            );
        }

        let query = format!(
            r#"
            SELECT a.id, a.event_ts, a.created_ts, a.exchange, a.symbol, a.signal, a.source_tf,
                   a.price, a.reason, a.setup_score, a.setup_grade, a.avoid_reasons_json, a.metrics_json,
                   p.id AS plan_id, p.side, p.entry_type, p.entry_price, p.stop_loss,
                   p.tp1, p.tp2, p.tp3, p.atr, p.atr_mult, p.swing_ref, p.risk_per_unit,
                   p.rr_tp1, p.rr_tp2, p.rr_tp3, p.plan_json
            FROM alerts a
            JOIN trade_plans p ON p.alert_id = a.id
            WHERE {where_sql}
            ORDER BY a.created_ts ASC
            "#
        );

        let mut q = sqlx::query(&query).bind(since_ts);
        if let Some(ex) = exchange {
            q = q.bind(ex);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("failed to read alerts with trade plans")?;

        rows.iter().map(row_to_alert_and_plan).collect()
    }

    pub async fn insert_trade_plan(&self, plan: &TradePlan) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_plans
                (alert_id, event_ts, exchange, symbol, side, entry_type, entry_price, stop_loss,
                 tp1, tp2, tp3, atr, atr_mult, swing_ref, risk_per_unit, rr_tp1, rr_tp2, rr_tp3, plan_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(plan.alert_id)
        .bind(plan.event_ts)
        .bind(&plan.exchange)
        .bind(&plan.symbol)
        .bind(&plan.side)
        .bind(&plan.entry_type)
        .bind(plan.entry_price)
        .bind(plan.stop_loss)
        .bind(plan.tp1)
        .bind(plan.tp2)
        .bind(plan.tp3)
        .bind(plan.atr)
        .bind(plan.atr_mult)
        .bind(plan.swing_ref)
        .bind(plan.risk_per_unit)
        .bind(plan.rr_tp1)
        .bind(plan.rr_tp2)
        .bind(plan.rr_tp3)
        .bind(&plan.plan_json)
        .execute(&self.pool)
        .await
        .context("failed to insert trade plan")?;

        Ok(result.last_insert_rowid())
    }
}

fn row_to_alert_and_plan(row: &SqliteRow) -> Result<(Alert, TradePlan)> {
    let alert = row_to_alert(row)?;
    let alert_id: i64 = row.try_get("id")?;
    let plan = TradePlan {
        id: Some(row.try_get("plan_id")?),
        alert_id,
        event_ts: alert.event_ts,
        exchange: alert.exchange.clone(),
        symbol: alert.symbol.clone(),
        side: row.try_get("side")?,
        entry_type: row.try_get("entry_type")?,
        entry_price: row.try_get("entry_price")?,
        stop_loss: row.try_get("stop_loss")?,
        tp1: row.try_get("tp1")?,
        tp2: row.try_get("tp2")?,
        tp3: row.try_get("tp3")?,
        atr: row.try_get("atr")?,
        atr_mult: row.try_get("atr_mult")?,
        swing_ref: row.try_get("swing_ref")?,
        risk_per_unit: row.try_get("risk_per_unit")?,
        rr_tp1: row.try_get("rr_tp1")?,
        rr_tp2: row.try_get("rr_tp2")?,
        rr_tp3: row.try_get("rr_tp3")?,
        plan_json: row.try_get("plan_json")?,
    };
    Ok((alert, plan))
}

fn row_to_alert(row: &SqliteRow) -> Result<Alert> {
    let avoid_reasons_json: String = row.try_get("avoid_reasons_json")?;
    let setup_grade: String = row.try_get("setup_grade")?;
    Ok(Alert {
        id: Some(row.try_get("id")?),
        event_ts: row.try_get("event_ts")?,
        created_ts: row.try_get("created_ts")?,
        exchange: row.try_get("exchange")?,
        symbol: row.try_get("symbol")?,
        signal: Signal::from_str(&row.try_get::<String, _>("signal")?)?,
        source_tf: row.try_get("source_tf")?,
        price: row.try_get("price")?,
        reason: row.try_get("reason")?,
        setup_score: row.try_get("setup_score")?,
        setup_grade: setup_grade.chars().next().unwrap_or('C'),
        avoid_reasons: serde_json::from_str(&avoid_reasons_json).unwrap_or_default(),
        metrics_json: row.try_get("metrics_json")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> AlertStore {
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
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
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
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        AlertStore::new(pool)
    }

    fn sample_alert() -> Alert {
        Alert {
            id: None,
            event_ts: 1_000,
            created_ts: 1_001,
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            signal: Signal::Buy,
            source_tf: "15m".to_string(),
            price: 100.0,
            reason: "cipher_b_buy".to_string(),
            setup_score: 6.5,
            setup_grade: 'A',
            avoid_reasons: vec![],
            metrics_json: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_then_read_back_round_trips() {
        let store = memory_store().await;
        let id = store.insert(&sample_alert()).await.unwrap();
        assert!(id.is_some());

        let rows = store.recent("binance", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].signal, Signal::Buy);
        assert_eq!(rows[0].setup_grade, 'A');
    }

    fn sample_plan(alert_id: i64) -> TradePlan {
        TradePlan {
            id: None,
            alert_id,
            event_ts: 1_000,
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            entry_type: "market".to_string(),
            entry_price: 100.0,
            stop_loss: 97.0,
            tp1: Some(103.0),
            tp2: Some(105.0),
            tp3: Some(108.0),
            atr: 1.0,
            atr_mult: 2.5,
            swing_ref: 97.0,
            risk_per_unit: 3.0,
            rr_tp1: Some(1.5),
            rr_tp2: Some(2.5),
            rr_tp3: Some(4.0),
            plan_json: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn alerts_with_plans_since_joins_on_alert_id() {
        let store = memory_store().await;
        let alert_id = store.insert(&sample_alert()).await.unwrap().unwrap();
        store.insert_trade_plan(&sample_plan(alert_id)).await.unwrap();

        let rows = store.alerts_with_plans_since(Some("binance"), 0, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.symbol, "BTCUSDT");
        assert_eq!(rows[0].1.tp1, Some(103.0));
    }

    #[tokio::test]
    async fn alerts_with_plans_since_respects_window_start() {
        let store = memory_store().await;
        let alert_id = store.insert(&sample_alert()).await.unwrap().unwrap();
        store.insert_trade_plan(&sample_plan(alert_id)).await.unwrap();

        let rows = store.alerts_with_plans_since(Some("binance"), 5_000, false).await.unwrap();
        assert!(rows.is_empty(), "alert created_ts=1001 is before the window start");
    }

    #[tokio::test]
    async fn duplicate_key_is_ignored_not_errored() {
        let store = memory_store().await;
        let first = store.insert(&sample_alert()).await.unwrap();
        let second = store.insert(&sample_alert()).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let rows = store.recent("binance", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}

//! Per-exchange ingest/emit hub. Every kline, ticker, and OI update for an
//! exchange funnels through one `Aggregator`; it is the sole writer to its
//! `SymbolState` map, so the lock below is never contended across tasks —
//! only ever a brief section inside a single ingest or emit call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::domain::alert::{Alert, Signal};
use crate::domain::candle::{Candle, Interval};
use crate::domain::grader::{self, Side, WinRateTable};
use crate::domain::metrics_snapshot::{self, MetricsSnapshot};
use crate::domain::trade_plan;
use crate::infrastructure::alerter::AlertSink;
use crate::infrastructure::persistence::{alert_store::AlertStore, candle_store::CandleStore};
use crate::domain::symbol_state::SymbolState;

/// A bounded queue that drops its oldest entry rather than blocking the
/// producer, matching the original aggregator's `if q.full(): q.get_nowait()`
/// fallback. Tokio's `mpsc` has no peek/pop-front from the sender side, so
/// subscribers get this instead of a channel pair.
pub struct SnapshotQueue {
    capacity: usize,
    buffer: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl SnapshotQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
        })
    }

    async fn push(&self, payload: String) {
        let mut buf = self.buffer.lock().await;
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(payload);
        drop(buf);
        self.notify.notify_one();
    }

    /// Waits for and returns the next payload. Returns `None` only if the
    /// queue is dropped while a caller is waiting (never happens in
    /// practice since `Arc` keeps it alive as long as the caller holds it).
    pub async fn recv(&self) -> Option<String> {
        loop {
            {
                let mut buf = self.buffer.lock().await;
                if let Some(item) = buf.pop_front() {
                    return Some(item);
                }
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StaleCounts {
    pub stale_tickers: usize,
    pub stale_klines: usize,
}

pub struct Aggregator {
    exchange: String,
    config: Arc<CoreConfig>,
    states: Mutex<HashMap<String, SymbolState>>,
    candle_store: CandleStore,
    alert_store: AlertStore,
    alerter: Arc<dyn AlertSink>,
    win_rates: Arc<ArcSwap<WinRateTable>>,
    subscribers: RwLock<Vec<Arc<SnapshotQueue>>>,
    last_emit_ts: AtomicI64,
    last_ticker_ms: Mutex<HashMap<String, i64>>,
    last_kline_ms: Mutex<HashMap<String, i64>>,
}

impl Aggregator {
    pub fn new(
        exchange: impl Into<String>,
        config: Arc<CoreConfig>,
        candle_store: CandleStore,
        alert_store: AlertStore,
        alerter: Arc<dyn AlertSink>,
        win_rates: Arc<ArcSwap<WinRateTable>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            config,
            states: Mutex::new(HashMap::new()),
            candle_store,
            alert_store,
            alerter,
            win_rates,
            subscribers: RwLock::new(Vec::new()),
            last_emit_ts: AtomicI64::new(0),
            last_ticker_ms: Mutex::new(HashMap::new()),
            last_kline_ms: Mutex::new(HashMap::new()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Folds a 1m (or already-resampled) kline into the symbol's state,
    /// persists any HTF bucket that just closed, and triggers a throttled
    /// emit.
    pub async fn ingest_kline(&self, symbol: &str, candle: Candle, now_ms: i64) {
        let finalized = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(symbol.to_string())
                .or_insert_with(|| SymbolState::new(self.exchange.as_str(), symbol));
            let finalized = state.update(&candle);
            for bucket in &finalized {
                let vol_due = &self.config.vol_due;
                let (bb_width, atr_pct) = match bucket.interval {
                    Interval::FifteenMin => (vol_due.bb_width_15m, vol_due.atr_pct_15m),
                    Interval::FourHour => (vol_due.bb_width_4h, vol_due.atr_pct_4h),
                    Interval::OneMin => continue,
                };
                state.update_vol_due(bucket.interval, bb_width, atr_pct, vol_due.lookback_bars, vol_due.percentile, now_ms);
            }
            finalized
        };

        if candle.closed {
            if let Err(err) = self.candle_store.upsert(&self.exchange, symbol, Interval::OneMin, &candle).await {
                warn!(%symbol, error = %err, "failed to persist 1m candle");
            }
        }
        for bucket in finalized {
            if let Err(err) = self.candle_store.upsert(&self.exchange, symbol, bucket.interval, &bucket.candle).await {
                warn!(%symbol, interval = bucket.interval.as_str(), error = %err, "failed to persist htf candle");
            }
        }

        self.last_kline_ms.lock().await.insert(symbol.to_string(), now_ms);
        self.emit_if_due(now_ms).await;
    }

    pub async fn update_ticker(&self, symbol: &str, price: f64, now_ms: i64) {
        {
            let mut states = self.states.lock().await;
            let state = states
                .entry(symbol.to_string())
                .or_insert_with(|| SymbolState::new(self.exchange.as_str(), symbol));
            state.last_price = Some(price);
        }
        self.last_ticker_ms.lock().await.insert(symbol.to_string(), now_ms);
        self.emit_if_due(now_ms).await;
    }

    /// Updates open interest. Does not trigger an emit — OI alone never
    /// carries a fresh signal worth a full snapshot pass.
    pub async fn update_open_interest(&self, symbol: &str, oi: f64) {
        let mut states = self.states.lock().await;
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(self.exchange.as_str(), symbol));
        state.update_open_interest(oi);
    }

    pub async fn emit_if_due(&self, now_ms: i64) {
        let last = self.last_emit_ts.load(Ordering::Acquire);
        if now_ms - last < self.config.snapshot_interval_ms as i64 {
            return;
        }
        self.emit_snapshot(now_ms).await;
    }

    pub async fn heartbeat_emit(&self, now_ms: i64) {
        self.emit_snapshot(now_ms).await;
    }

    async fn emit_snapshot(&self, now_ms: i64) {
        self.last_emit_ts.store(now_ms, Ordering::Release);

        let mut snapshots: Vec<MetricsSnapshot> = {
            let states = self.states.lock().await;
            states
                .values()
                .map(|s| metrics_snapshot::compute_metrics(s, now_ms, self.config.cipherb_os_level, self.config.cipherb_ob_level))
                .collect()
        };

        apply_liquidity_cohort(&mut snapshots, self.config.liq_top_n, self.config.liq_weights);

        let win_rates = self.win_rates.load_full();
        for snapshot in &mut snapshots {
            self.grade_and_plan_if_fresh(snapshot, win_rates.as_ref(), now_ms).await;
        }

        let payload = match serde_json::to_string(&snapshots) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "failed to serialize snapshot batch");
                return;
            }
        };

        let subscribers = self.subscribers.read().await;
        for sub in subscribers.iter() {
            sub.push(payload.clone()).await;
        }
        debug!(exchange = %self.exchange, symbols = snapshots.len(), subscribers = subscribers.len(), "emitted snapshot");
    }

    /// Builds and persists an Alert + TradePlan for any symbol whose
    /// snapshot just turned up a fresh signal, then dispatches to the
    /// alerter. Mutates `snapshot.setup_score`/`setup_grade`/`avoid_reasons`
    /// in place so the emitted payload reflects the grading outcome too.
    async fn grade_and_plan_if_fresh(&self, snapshot: &mut MetricsSnapshot, win_rates: &WinRateTable, now_ms: i64) {
        let side = if snapshot.cipher_buy || snapshot.swing_long {
            Some(Side::Buy)
        } else if snapshot.cipher_sell {
            Some(Side::Sell)
        } else {
            None
        };
        let Some(side) = side else { return };

        let result = grader::grade(snapshot, side, win_rates);
        snapshot.setup_score = Some(result.score);
        snapshot.setup_grade = Some(result.grade);
        snapshot.avoid_reasons = result.avoid_reasons.clone();

        if result.grade > self.config.alert_min_grade {
            // Lexicographic 'A' < 'B' < 'C': a grade worse than the floor
            // (e.g. floor 'B', got 'C') is filtered out here.
            return;
        }

        let signal = match side {
            Side::Buy => Signal::Buy,
            Side::Sell => Signal::Sell,
        };
        let source_tf = snapshot.cipher_source_tf.unwrap_or("15m");
        let cooldown_sec = if snapshot.liquidity_top200 {
            self.config.alert_cooldown_top200_sec
        } else {
            self.config.alert_cooldown_other_sec
        };

        let metrics_json = serde_json::to_string(snapshot).unwrap_or_default();
        let alert = Alert {
            id: None,
            event_ts: snapshot.event_ts,
            created_ts: now_ms,
            exchange: self.exchange.clone(),
            symbol: snapshot.symbol.clone(),
            signal,
            source_tf: source_tf.to_string(),
            price: snapshot.last_price.unwrap_or_default(),
            reason: snapshot.cipher_reason.clone().unwrap_or_else(|| "setup".to_string()),
            setup_score: result.score,
            setup_grade: result.grade,
            avoid_reasons: result.avoid_reasons,
            metrics_json,
        };

        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(&snapshot.symbol) {
                let last_fired = state.last_signal_ts(signal.as_str());
                if let Some(last) = last_fired {
                    if now_ms - last < cooldown_sec as i64 * 1_000 {
                        return;
                    }
                }
                state.mark_signal(signal.as_str(), now_ms);
            }
        }

        let alert_id = match self.alert_store.insert(&alert).await {
            Ok(Some(id)) => id,
            Ok(None) => return, // already fired for this exact event_ts
            Err(err) => {
                warn!(symbol = %snapshot.symbol, error = %err, "failed to persist alert");
                return;
            }
        };

        if self.config.trade_plan.enabled {
            if let Some(entry) = snapshot.last_price {
                let atr = snapshot.atr_1m.unwrap_or(0.0);
                let swing = self
                    .candle_store
                    .get_recent(&self.exchange, &snapshot.symbol, Interval::FifteenMin, self.config.trade_plan.swing_lookback_15m)
                    .await
                    .unwrap_or_default();
                let swing_high = swing.iter().map(|c| c.high).fold(None, |acc: Option<f64>, h| Some(acc.map_or(h, |a| a.max(h))));
                let swing_low = swing.iter().map(|c| c.low).fold(None, |acc: Option<f64>, l| Some(acc.map_or(l, |a| a.min(l))));

                let plan = if snapshot.swing_long && side == Side::Buy {
                    let swing_4h = self
                        .candle_store
                        .get_recent(&self.exchange, &snapshot.symbol, Interval::FourHour, self.config.trade_plan.swing_lookback_15m)
                        .await
                        .unwrap_or_default();
                    let swing_low_4h = swing_4h.iter().map(|c| c.low).fold(None, |acc: Option<f64>, l| Some(acc.map_or(l, |a| a.min(l))));
                    trade_plan::build_swing_trade_plan(alert_id, snapshot.event_ts, &self.exchange, &snapshot.symbol, entry, atr, swing_low_4h)
                } else {
                    trade_plan::build_trade_plan(
                        alert_id,
                        snapshot.event_ts,
                        &self.exchange,
                        &snapshot.symbol,
                        side,
                        entry,
                        atr,
                        swing_high,
                        swing_low,
                        self.config.trade_plan.swing_lookback_15m,
                    )
                };

                if let Err(err) = self.alert_store.insert_trade_plan(&plan).await {
                    warn!(symbol = %snapshot.symbol, error = %err, "failed to persist trade plan");
                }
            }
        }

        self.alerter.dispatch(&alert).await;
    }

    pub async fn subscribe(&self) -> Arc<SnapshotQueue> {
        let queue = SnapshotQueue::new(self.config.subscriber_queue_capacity);
        self.subscribers.write().await.push(queue.clone());
        queue
    }

    pub async fn unsubscribe(&self, queue: &Arc<SnapshotQueue>) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|q| !Arc::ptr_eq(q, queue));
    }

    pub async fn stale_symbols(&self, now_ms: i64, ticker_stale_ms: i64, kline_stale_ms: i64) -> StaleCounts {
        let tickers = self.last_ticker_ms.lock().await;
        let klines = self.last_kline_ms.lock().await;
        StaleCounts {
            stale_tickers: tickers.values().filter(|&&ts| now_ms - ts > ticker_stale_ms).count(),
            stale_klines: klines.values().filter(|&&ts| now_ms - ts > kline_stale_ms).count(),
        }
    }

    pub async fn symbol_count(&self) -> usize {
        self.states.lock().await.len()
    }

    /// Seeds a symbol's HTF rolling series from already-closed candles
    /// fetched at startup, without replaying them through the fold path.
    pub async fn seed_htf(&self, symbol: &str, interval: Interval, candles: &[Candle]) {
        let mut states = self.states.lock().await;
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(self.exchange.as_str(), symbol));
        state.seed_htf_history(interval, candles);
    }
}

/// Min-max normalizes turnover (latest 1m volume proxy), open interest, and
/// short-term activity across the current universe, scores the weighted
/// sum, ranks descending, and marks the top `top_n` as the liquidity
/// cohort. Mutates each snapshot's `liquidity_rank`/`liquidity_top200`.
fn apply_liquidity_cohort(snapshots: &mut [MetricsSnapshot], top_n: usize, weights: crate::config::LiquidityWeights) {
    if snapshots.is_empty() {
        return;
    }

    let turnovers: Vec<f64> = snapshots.iter().map(|s| s.volume_1m.unwrap_or(0.0).abs()).collect();
    let ois: Vec<f64> = snapshots.iter().map(|s| s.open_interest.unwrap_or(0.0)).collect();
    let activity: Vec<f64> = snapshots.iter().map(|s| s.change_5m.unwrap_or(0.0).abs()).collect();

    let norm = |values: &[f64]| -> Vec<f64> {
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if (max - min).abs() < f64::EPSILON {
            return vec![0.0; values.len()];
        }
        values.iter().map(|v| (v - min) / (max - min)).collect()
    };

    let n_turn = norm(&turnovers);
    let n_oi = norm(&ois);
    let n_act = norm(&activity);

    let mut scored: Vec<(usize, f64)> = (0..snapshots.len())
        .map(|i| (i, weights.turnover * n_turn[i] + weights.open_interest * n_oi[i] + weights.activity * n_act[i]))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (rank, (idx, _)) in scored.into_iter().enumerate() {
        snapshots[idx].liquidity_rank = Some(rank as u32 + 1);
        snapshots[idx].liquidity_top200 = rank < top_n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidity_cohort_marks_top_n_and_ranks_descending() {
        let mut snapshots = vec![
            MetricsSnapshot {
                symbol: "A".to_string(),
                last_price: Some(100.0),
                open_interest: Some(10.0),
                change_5m: Some(0.01),
                ..Default::default()
            },
            MetricsSnapshot {
                symbol: "B".to_string(),
                last_price: Some(10.0),
                open_interest: Some(100.0),
                change_5m: Some(0.1),
                ..Default::default()
            },
        ];
        let weights = crate::config::LiquidityWeights {
            turnover: 0.6,
            open_interest: 0.3,
            activity: 0.1,
        };
        apply_liquidity_cohort(&mut snapshots, 1, weights);
        assert_eq!(snapshots[0].liquidity_rank, Some(1));
        assert!(snapshots[0].liquidity_top200);
        assert!(!snapshots[1].liquidity_top200);
    }

    #[tokio::test]
    async fn snapshot_queue_drops_oldest_when_full() {
        let queue = SnapshotQueue::new(2);
        queue.push("a".to_string()).await;
        queue.push("b".to_string()).await;
        queue.push("c".to_string()).await;
        assert_eq!(queue.recv().await, Some("b".to_string()));
        assert_eq!(queue.recv().await, Some("c".to_string()));
    }

    async fn memory_pool() -> sqlx::SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE ohlc (
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, interval TEXT NOT NULL,
                open_time_ms INTEGER NOT NULL, close_time_ms INTEGER NOT NULL,
                open REAL NOT NULL, high REAL NOT NULL, low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
                PRIMARY KEY (exchange, symbol, interval, open_time_ms)
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_ts INTEGER NOT NULL, created_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, signal TEXT NOT NULL, source_tf TEXT NOT NULL,
                price REAL NOT NULL, reason TEXT NOT NULL, setup_score REAL NOT NULL, setup_grade TEXT NOT NULL,
                avoid_reasons_json TEXT NOT NULL, metrics_json TEXT NOT NULL,
                UNIQUE (exchange, symbol, signal, event_ts)
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE trade_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT, alert_id INTEGER NOT NULL, event_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, side TEXT NOT NULL, entry_type TEXT NOT NULL,
                entry_price REAL NOT NULL, stop_loss REAL NOT NULL, tp1 REAL, tp2 REAL, tp3 REAL,
                atr REAL NOT NULL, atr_mult REAL NOT NULL, swing_ref REAL NOT NULL, risk_per_unit REAL NOT NULL,
                rr_tp1 REAL, rr_tp2 REAL, rr_tp3 REAL, plan_json TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn test_config() -> Arc<CoreConfig> {
        Arc::new(CoreConfig {
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
            liq_weights: crate::config::LiquidityWeights { turnover: 0.6, open_interest: 0.3, activity: 0.1 },
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
            full_refresh: crate::config::FullRefreshConfig { enabled: false, offset_sec: 2, backfill_limit: 200 },
            stale_ticker_ms: 60_000,
            stale_kline_ms: 60_000,
            alert_cooldown_top200_sec: 120,
            alert_cooldown_other_sec: 300,
            alert_min_grade: 'C',
            analysis_autorun_interval_min: 60,
            analysis_autorun_windows_days: vec![30],
            database_url: "sqlite::memory:".to_string(),
            exchanges: vec!["binance".to_string()],
            binance_futures_ws: "wss://fstream.binance.com".to_string(),
            binance_futures_rest: "https://fapi.binance.com".to_string(),
            bybit_rest: "https://api.bybit.com".to_string(),
            market_cap_cache_ttl_ms: 6 * 60 * 60 * 1000,
            subscriber_queue_capacity: 16,
        })
    }

    /// End-to-end: a snapshot carrying a fresh 15m Cipher BUY signal must
    /// persist an Alert and a TradePlan whose stop sits below entry and
    /// whose tp1 sits at the configured first R-multiple, mirroring the
    /// Cipher-BUY-on-15m scenario.
    #[tokio::test]
    async fn fresh_cipher_buy_signal_persists_alert_and_trade_plan() {
        let pool = memory_pool().await;
        let candle_store = CandleStore::new(pool.clone());
        let alert_store = AlertStore::new(pool.clone());
        let config = test_config();

        let aggregator = Aggregator::new(
            "binance",
            config.clone(),
            candle_store,
            alert_store.clone(),
            Arc::new(crate::infrastructure::alerter::NoopSink) as Arc<dyn AlertSink>,
            Arc::new(ArcSwap::from_pointee(WinRateTable::new())),
        );

        let mut snapshot = MetricsSnapshot {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            event_ts: 1_000,
            last_price: Some(100.0),
            atr_1m: Some(2.0),
            cipher_buy: true,
            cipher_source_tf: Some("15m"),
            cipher_reason: Some("15m cross-up: wt1=-30.00 wt2=-45.00".to_string()),
            mtf_aligned: true,
            ..Default::default()
        };

        aggregator.grade_and_plan_if_fresh(&mut snapshot, &WinRateTable::new(), 1_000).await;

        let alerts = alert_store.recent("binance", 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.signal, crate::domain::alert::Signal::Buy);
        assert_eq!(alert.source_tf, "15m");
        assert!(alert.reason.contains("15m cross-up"));

        let pairs = alert_store.alerts_with_plans_since(None, 0, false).await.unwrap();
        assert_eq!(pairs.len(), 1);
        let (_, plan) = &pairs[0];
        assert!(plan.stop_loss < plan.entry_price);
        let tp1 = plan.tp1.expect("tp1 present");
        let expected_tp1 = plan.entry_price + 1.5 * plan.risk_per_unit;
        assert!((tp1 - expected_tp1).abs() < 1e-9);
    }
}

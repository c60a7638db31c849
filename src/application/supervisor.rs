//! Owns one exchange's live data lifecycle: universe resolution, startup
//! backfill, the kline/miniticker/open-interest streams, a staleness
//! watchdog, and a task health monitor. Reconnect-with-backoff is modeled
//! on the teacher's `BinanceWebSocketManager::run_websocket` loop; restart
//! on staleness follows the original Python `StreamWatchdog`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::aggregator::Aggregator;
use crate::config::CoreConfig;
use crate::domain::candle::{Candle, Interval};
use crate::infrastructure::exchange::{ExchangeAdapter, TickerUpdate};
use crate::infrastructure::persistence::candle_store::CandleStore;

const KLINE_BACKOFF_MIN_SEC: u64 = 1;
const KLINE_BACKOFF_MAX_SEC: u64 = 30;
const OI_POLL_INTERVAL_SEC: u64 = 60;
const WATCHDOG_INTERVAL_SEC: u64 = 20;
const HEALTH_MONITOR_INTERVAL_SEC: u64 = 15;
const BACKFILL_LIMIT: u32 = 200;

pub struct StreamSupervisor {
    exchange_name: String,
    adapter: Arc<dyn ExchangeAdapter>,
    aggregator: Arc<Aggregator>,
    candle_store: CandleStore,
    config: Arc<CoreConfig>,
    symbols: RwLock<Vec<String>>,
    last_kline_ms: AtomicI64,
    last_ticker_ms: AtomicI64,
    kline_restart: Arc<Notify>,
    miniticker_restart: Arc<Notify>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl StreamSupervisor {
    pub fn new(exchange_name: impl Into<String>, adapter: Arc<dyn ExchangeAdapter>, aggregator: Arc<Aggregator>, candle_store: CandleStore, config: Arc<CoreConfig>) -> Arc<Self> {
        Arc::new(Self {
            exchange_name: exchange_name.into(),
            adapter,
            aggregator,
            candle_store,
            config,
            symbols: RwLock::new(Vec::new()),
            last_kline_ms: AtomicI64::new(0),
            last_ticker_ms: AtomicI64::new(0),
            kline_restart: Arc::new(Notify::new()),
            miniticker_restart: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn universe(&self) -> Vec<String> {
        self.symbols.read().await.clone()
    }

    /// Resolves the universe, backfills history, and spawns the
    /// long-running stream/poll/watchdog tasks. Call once per supervisor.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        let symbols = self
            .adapter
            .symbols(self.config.top_symbols, &self.config.include_symbols, &self.config.exclude_symbols)
            .await
            .map_err(|e| anyhow::anyhow!("failed to resolve {} universe: {e}", self.exchange_name))?;
        info!(exchange = %self.exchange_name, count = symbols.len(), "resolved universe");
        *self.symbols.write().await = symbols.clone();

        self.backfill_universe(&symbols).await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(("kline_stream", self.clone().spawn_kline_loop()));
        tasks.push(("miniticker_stream", self.clone().spawn_miniticker_loop()));
        tasks.push(("oi_poll", self.clone().spawn_oi_poll_loop()));
        tasks.push(("watchdog", self.clone().spawn_watchdog_loop()));
        tasks.push(("health_monitor", self.clone().spawn_health_monitor_loop()));
        if self.config.full_refresh.enabled {
            tasks.push(("full_refresh", self.clone().spawn_full_refresh_loop()));
        }
        Ok(())
    }

    /// Idempotent. Aborts every spawned task; safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for (label, task) in tasks.drain(..) {
            debug!(exchange = %self.exchange_name, task = label, "aborting supervisor task");
            task.abort();
        }
    }

    async fn backfill_universe(&self, symbols: &[String]) {
        for symbol in symbols {
            if let Err(err) = self.backfill_symbol(symbol).await {
                warn!(exchange = %self.exchange_name, %symbol, error = %err, "backfill failed");
            }
        }
        info!(exchange = %self.exchange_name, count = symbols.len(), "startup backfill complete");
    }

    async fn backfill_symbol(&self, symbol: &str) -> anyhow::Result<()> {
        let candles_1m = self
            .adapter
            .backfill_klines(symbol, Interval::OneMin, BACKFILL_LIMIT)
            .await
            .map_err(|e| anyhow::anyhow!("1m backfill: {e}"))?;
        for candle in &candles_1m {
            self.aggregator.ingest_kline(symbol, *candle, candle.close_time_ms).await;
        }

        for interval in [Interval::FifteenMin, Interval::FourHour] {
            let candles = self
                .adapter
                .backfill_klines(symbol, interval, BACKFILL_LIMIT)
                .await
                .map_err(|e| anyhow::anyhow!("{} backfill: {e}", interval.as_str()))?;
            for candle in &candles {
                if let Err(err) = self.candle_store.upsert(&self.exchange_name, symbol, interval, candle).await {
                    warn!(%symbol, interval = interval.as_str(), error = %err, "failed to persist backfilled candle");
                }
            }
            self.aggregator.seed_htf(symbol, interval, &candles).await;
        }

        if let Ok(oi) = self.adapter.open_interest(symbol).await {
            self.aggregator.update_open_interest(symbol, oi).await;
        }

        Ok(())
    }

    fn spawn_kline_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = KLINE_BACKOFF_MIN_SEC;
            loop {
                let symbols = self.symbols.read().await.clone();
                let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, Candle)>(256);
                let reader = {
                    let this = self.clone();
                    tokio::spawn(async move {
                        while let Some((symbol, candle)) = rx.recv().await {
                            this.last_kline_ms.store(now_ms(), Ordering::Release);
                            this.aggregator.ingest_kline(&symbol, candle, now_ms()).await;
                        }
                    })
                };

                let restart = self.kline_restart.clone();
                let adapter = self.adapter.clone();
                let stream_result = tokio::select! {
                    res = adapter.stream_1m_klines(symbols, tx) => res,
                    _ = restart.notified() => {
                        warn!(exchange = %self.exchange_name, "kline stream restart requested by watchdog");
                        Ok(())
                    }
                };
                reader.abort();

                match stream_result {
                    Ok(()) => {
                        backoff = KLINE_BACKOFF_MIN_SEC;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(err) if err.is_retryable() => {
                        error!(exchange = %self.exchange_name, error = %err, backoff_sec = backoff, "kline stream error, reconnecting");
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        backoff = (backoff * 2).min(KLINE_BACKOFF_MAX_SEC);
                    }
                    Err(err) => {
                        // Non-network failure (malformed payload, invariant
                        // violation): waiting longer won't fix it, so retry
                        // at the floor backoff instead of ramping up.
                        error!(exchange = %self.exchange_name, error = %err, "kline stream non-retryable error, fast-failing reconnect");
                        tokio::time::sleep(Duration::from_secs(KLINE_BACKOFF_MIN_SEC)).await;
                    }
                }
            }
        })
    }

    fn spawn_miniticker_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = KLINE_BACKOFF_MIN_SEC;
            loop {
                let symbols = self.symbols.read().await.clone();
                let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, TickerUpdate)>(256);
                let reader = {
                    let this = self.clone();
                    tokio::spawn(async move {
                        while let Some((symbol, update)) = rx.recv().await {
                            this.last_ticker_ms.store(now_ms(), Ordering::Release);
                            this.aggregator.update_ticker(&symbol, update.price, update.ts_ms).await;
                        }
                    })
                };

                let restart = self.miniticker_restart.clone();
                let adapter = self.adapter.clone();
                let stream_result = tokio::select! {
                    res = adapter.stream_minitickers(symbols, tx) => res,
                    _ = restart.notified() => Ok(()),
                };
                reader.abort();

                match stream_result {
                    Ok(()) => {
                        backoff = KLINE_BACKOFF_MIN_SEC;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(err) if err.is_retryable() => {
                        error!(exchange = %self.exchange_name, error = %err, backoff_sec = backoff, "miniticker stream error, reconnecting");
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        backoff = (backoff * 2).min(KLINE_BACKOFF_MAX_SEC);
                    }
                    Err(err) => {
                        error!(exchange = %self.exchange_name, error = %err, "miniticker stream non-retryable error, fast-failing reconnect");
                        tokio::time::sleep(Duration::from_secs(KLINE_BACKOFF_MIN_SEC)).await;
                    }
                }
            }
        })
    }

    fn spawn_oi_poll_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let symbols = self.symbols.read().await.clone();
                for symbol in &symbols {
                    match self.adapter.open_interest(symbol).await {
                        Ok(oi) => self.aggregator.update_open_interest(symbol, oi).await,
                        Err(err) => debug!(exchange = %self.exchange_name, %symbol, error = %err, "open interest poll failed"),
                    }
                }
                tokio::time::sleep(Duration::from_secs(OI_POLL_INTERVAL_SEC)).await;
            }
        })
    }

    /// Mirrors the original `StreamWatchdog`: on a long silence since the
    /// last observed ingest, nudges the corresponding stream loop to drop
    /// its connection and reconnect immediately instead of waiting out its
    /// own backoff.
    fn spawn_watchdog_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(WATCHDOG_INTERVAL_SEC)).await;
                let now = now_ms();
                let kline_age = now - self.last_kline_ms.load(Ordering::Acquire);
                if self.last_kline_ms.load(Ordering::Acquire) > 0 && kline_age > self.config.stale_kline_ms as i64 {
                    warn!(exchange = %self.exchange_name, age_ms = kline_age, "watchdog restarting kline stream after silence");
                    self.kline_restart.notify_one();
                }
                let ticker_age = now - self.last_ticker_ms.load(Ordering::Acquire);
                if self.last_ticker_ms.load(Ordering::Acquire) > 0 && ticker_age > self.config.stale_ticker_ms as i64 {
                    warn!(exchange = %self.exchange_name, age_ms = ticker_age, "watchdog restarting miniticker stream after silence");
                    self.miniticker_restart.notify_one();
                }
            }
        })
    }

    fn spawn_health_monitor_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(HEALTH_MONITOR_INTERVAL_SEC)).await;
                let tasks = self.tasks.lock().await;
                for (label, task) in tasks.iter() {
                    if task.is_finished() {
                        error!(exchange = %self.exchange_name, task = label, "supervisor task exited unexpectedly");
                    }
                }
            }
        })
    }

    /// Re-resolves the universe and re-backfills on a 5-minute wall-clock
    /// boundary plus a small configured offset, to pick up new listings and
    /// heal any gaps the incremental streams missed.
    fn spawn_full_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = now_ms();
                const FIVE_MIN_MS: i64 = 5 * 60 * 1000;
                let next_boundary = (now / FIVE_MIN_MS + 1) * FIVE_MIN_MS + self.config.full_refresh.offset_sec as i64 * 1000;
                let wait_ms = (next_boundary - now).max(0) as u64;
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;

                match self
                    .adapter
                    .symbols(self.config.top_symbols, &self.config.include_symbols, &self.config.exclude_symbols)
                    .await
                {
                    Ok(symbols) => {
                        let previous: std::collections::HashSet<String> = self.symbols.read().await.iter().cloned().collect();
                        let fresh: Vec<String> = symbols.iter().filter(|s| !previous.contains(*s)).cloned().collect();
                        *self.symbols.write().await = symbols;
                        if !fresh.is_empty() {
                            info!(exchange = %self.exchange_name, count = fresh.len(), "full refresh found new symbols");
                            for symbol in &fresh {
                                if let Err(err) = self.backfill_symbol(symbol).await {
                                    warn!(exchange = %self.exchange_name, %symbol, error = %err, "full refresh backfill failed");
                                }
                            }
                        }
                    }
                    Err(err) => warn!(exchange = %self.exchange_name, error = %err, "full refresh universe resolution failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::grader::WinRateTable;
    use crate::infrastructure::alerter::NoopSink;
    use crate::infrastructure::exchange::stub::StubAdapter;
    use arc_swap::ArcSwap;
    use sqlx::SqlitePool;

    async fn memory_candle_store() -> CandleStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE ohlc (
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, interval TEXT NOT NULL,
                open_time_ms INTEGER NOT NULL, close_time_ms INTEGER NOT NULL,
                open REAL NOT NULL, high REAL NOT NULL, low REAL NOT NULL, close REAL NOT NULL, volume REAL NOT NULL,
                PRIMARY KEY (exchange, symbol, interval, open_time_ms)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        CandleStore::new(pool)
    }

    async fn memory_alert_store() -> crate::infrastructure::persistence::alert_store::AlertStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT, event_ts INTEGER NOT NULL, created_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, signal TEXT NOT NULL, source_tf TEXT NOT NULL,
                price REAL NOT NULL, reason TEXT NOT NULL, setup_score REAL NOT NULL, setup_grade TEXT NOT NULL,
                avoid_reasons_json TEXT NOT NULL, metrics_json TEXT NOT NULL,
                UNIQUE(exchange, symbol, signal, event_ts)
            );
            CREATE TABLE trade_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT, alert_id INTEGER NOT NULL, event_ts INTEGER NOT NULL,
                exchange TEXT NOT NULL, symbol TEXT NOT NULL, side TEXT NOT NULL, entry_type TEXT NOT NULL,
                entry_price REAL NOT NULL, stop_loss REAL NOT NULL, tp1 REAL, tp2 REAL, tp3 REAL,
                atr REAL NOT NULL, atr_mult REAL NOT NULL, swing_ref REAL NOT NULL, risk_per_unit REAL NOT NULL,
                rr_tp1 REAL, rr_tp2 REAL, rr_tp3 REAL, plan_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        crate::infrastructure::persistence::alert_store::AlertStore::new(pool)
    }

    #[tokio::test]
    async fn start_with_stub_adapter_resolves_empty_universe_and_spawns_tasks() {
        let config = Arc::new(CoreConfig::from_env().unwrap_or_else(|_| panic!("config should build from defaults in tests")));
        let candle_store = memory_candle_store().await;
        let alert_store = memory_alert_store().await;
        let aggregator = Arc::new(Aggregator::new(
            "stub",
            config.clone(),
            candle_store.clone(),
            alert_store,
            Arc::new(NoopSink),
            Arc::new(ArcSwap::from_pointee(WinRateTable::new())),
        ));
        let supervisor = StreamSupervisor::new("stub", Arc::new(StubAdapter::new("stub")), aggregator, candle_store, config);
        supervisor.clone().start().await.unwrap();
        assert!(supervisor.universe().await.is_empty());
        supervisor.stop().await;
        supervisor.stop().await; // idempotent
    }
}

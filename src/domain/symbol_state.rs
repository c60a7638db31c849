//! Per-symbol rolling state: 1m series, HTF (15m/4h) resampling, ATR
//! bookkeeping, and a short-TTL indicator memoization cache.

use std::collections::HashMap;

use super::candle::{Candle, Interval, RollingSeries};
use super::indicators;
use super::metrics_snapshot::VolDueFlags;

const ATR_PERIOD: usize = 14;
const ATR_HISTORY_CAP: usize = 100;
const INDICATOR_CACHE_TTL_MS: i64 = 15_000;
// Mirrors BOLLINGER_PERIOD/BOLLINGER_STD in metrics_snapshot.rs — the
// squeeze gate reads the same band width the cipher/MTF snapshot does.
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STD: f64 = 2.0;

/// One in-progress or just-finalized higher-timeframe bucket.
#[derive(Debug, Clone, Copy)]
struct HtfBucket {
    bucket_start_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl HtfBucket {
    fn from_candle(bucket_start_ms: i64, candle: &Candle) -> Self {
        Self {
            bucket_start_ms,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }

    fn extend(&mut self, candle: &Candle) {
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.close = candle.close;
        self.volume += candle.volume;
    }

    fn into_candle(self, interval: Interval) -> Candle {
        Candle {
            open_time_ms: self.bucket_start_ms,
            close_time_ms: self.bucket_start_ms + interval.millis(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            closed: true,
        }
    }
}

struct HtfState {
    current: Option<HtfBucket>,
    opens: RollingSeries,
    highs: RollingSeries,
    lows: RollingSeries,
    closes: RollingSeries,
    volumes: RollingSeries,
    atr_history: RollingSeries,
}

impl HtfState {
    fn new(maxlen: usize) -> Self {
        Self {
            current: None,
            opens: RollingSeries::new(maxlen),
            highs: RollingSeries::new(maxlen),
            lows: RollingSeries::new(maxlen),
            closes: RollingSeries::new(maxlen),
            volumes: RollingSeries::new(maxlen),
            atr_history: RollingSeries::new(ATR_HISTORY_CAP),
        }
    }

    fn push_finalized(&mut self, bucket: HtfBucket) {
        self.opens.push(bucket.open);
        self.highs.push(bucket.high);
        self.lows.push(bucket.low);
        self.closes.push(bucket.close);
        self.volumes.push(bucket.volume);
    }
}

/// A 15m or 4h bucket that just rolled over and must be persisted by the
/// caller (SymbolState itself never touches the store).
#[derive(Debug, Clone, Copy)]
pub struct FinalizedBucket {
    pub interval: Interval,
    pub candle: Candle,
}

#[derive(Clone, Copy)]
struct CacheEntry {
    computed_at_ms: i64,
    series_len: usize,
    value: f64,
}

/// Memoizes expensive indicator reads keyed by `(name, series length)`;
/// entries expire after [`INDICATOR_CACHE_TTL_MS`] or when the series
/// length has since changed. Single-reader: only ever touched from the
/// owning SymbolState's serialized ingest/emit path.
#[derive(Default)]
pub struct IndicatorCache {
    entries: HashMap<&'static str, CacheEntry>,
}

impl IndicatorCache {
    pub fn get_or_compute(
        &mut self,
        name: &'static str,
        series_len: usize,
        now_ms: i64,
        compute: impl FnOnce() -> f64,
    ) -> f64 {
        if let Some(entry) = self.entries.get(name) {
            if entry.series_len == series_len && now_ms - entry.computed_at_ms < INDICATOR_CACHE_TTL_MS {
                return entry.value;
            }
        }
        let value = compute();
        self.entries.insert(
            name,
            CacheEntry {
                computed_at_ms: now_ms,
                series_len,
                value,
            },
        );
        value
    }
}

pub struct SymbolState {
    pub exchange: String,
    pub symbol: String,

    opens_1m: RollingSeries,
    highs_1m: RollingSeries,
    lows_1m: RollingSeries,
    closes_1m: RollingSeries,
    volumes_1m: RollingSeries,
    oi_1m: RollingSeries,

    htf: HashMap<Interval, HtfState>,

    pub last_price: Option<f64>,
    pub atr_1m: Option<f64>,
    pub open_interest: Option<f64>,
    atr_history: RollingSeries,

    pub vol_due_15m: VolDueFlags,
    pub vol_due_4h: VolDueFlags,
    squeeze_prev_15m: bool,
    squeeze_prev_4h: bool,
    vol_due_since_15m_ms: Option<i64>,
    vol_due_since_4h_ms: Option<i64>,

    last_signal_ts: HashMap<String, i64>,
    pub indicator_cache: IndicatorCache,
}

const SERIES_1M_CAP: usize = 120;
const SERIES_HTF_CAP: usize = 200;
const OI_CAP: usize = 60;

impl SymbolState {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        let mut htf = HashMap::new();
        htf.insert(Interval::FifteenMin, HtfState::new(SERIES_HTF_CAP));
        htf.insert(Interval::FourHour, HtfState::new(SERIES_HTF_CAP));
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            opens_1m: RollingSeries::new(SERIES_1M_CAP),
            highs_1m: RollingSeries::new(SERIES_1M_CAP),
            lows_1m: RollingSeries::new(SERIES_1M_CAP),
            closes_1m: RollingSeries::new(SERIES_1M_CAP),
            volumes_1m: RollingSeries::new(SERIES_1M_CAP),
            oi_1m: RollingSeries::new(OI_CAP),
            htf,
            last_price: None,
            atr_1m: None,
            open_interest: None,
            atr_history: RollingSeries::new(ATR_HISTORY_CAP),
            vol_due_15m: VolDueFlags::default(),
            vol_due_4h: VolDueFlags::default(),
            squeeze_prev_15m: false,
            squeeze_prev_4h: false,
            vol_due_since_15m_ms: None,
            vol_due_since_4h_ms: None,
            last_signal_ts: HashMap::new(),
            indicator_cache: IndicatorCache::default(),
        }
    }

    /// Folds a 1m candle into the rolling 1m series and, if closed,
    /// resamples into each HTF bucket. Returns the HTF buckets (15m
    /// and/or 4h) that just rolled over, for the caller to persist.
    pub fn update(&mut self, candle: &Candle) -> Vec<FinalizedBucket> {
        self.opens_1m.push(candle.open);
        self.highs_1m.push(candle.high);
        self.lows_1m.push(candle.low);
        self.closes_1m.push(candle.close);
        self.volumes_1m.push(candle.volume);
        self.last_price = Some(candle.close);

        if self.closes_1m.len() >= ATR_PERIOD + 1 {
            if let Some(value) = indicators::atr(
                &self.highs_1m.as_slice(),
                &self.lows_1m.as_slice(),
                &self.closes_1m.as_slice(),
                ATR_PERIOD,
            ) {
                self.atr_1m = Some(value);
                self.atr_history.push(value);
            }
        }

        let mut finalized = Vec::new();
        if candle.closed {
            for interval in [Interval::FifteenMin, Interval::FourHour] {
                if let Some(bucket) = self.fold_htf(interval, candle) {
                    finalized.push(bucket);
                }
            }
        }
        finalized
    }

    fn fold_htf(&mut self, interval: Interval, candle: &Candle) -> Option<FinalizedBucket> {
        let bucket_start = interval.bucket_start(candle.open_time_ms);
        let state = self.htf.get_mut(&interval).expect("htf interval always present");

        match state.current {
            Some(mut bucket) if bucket.bucket_start_ms == bucket_start => {
                bucket.extend(candle);
                state.current = Some(bucket);
                None
            }
            Some(prev) => {
                state.push_finalized(prev);
                let finalized = FinalizedBucket {
                    interval,
                    candle: prev.into_candle(interval),
                };
                state.current = Some(HtfBucket::from_candle(bucket_start, candle));
                Some(finalized)
            }
            None => {
                state.current = Some(HtfBucket::from_candle(bucket_start, candle));
                None
            }
        }
    }

    /// Seeds an HTF rolling series from store history at startup, without
    /// going through the bucket-fold path (the bucket itself was already
    /// persisted by whoever wrote these rows).
    pub fn seed_htf_history(&mut self, interval: Interval, candles: &[Candle]) {
        let state = self.htf.get_mut(&interval).expect("htf interval always present");
        for candle in candles {
            state.push_finalized(HtfBucket {
                bucket_start_ms: candle.open_time_ms,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
            });
        }
    }

    pub fn update_open_interest(&mut self, oi: f64) {
        self.open_interest = Some(oi);
        self.oi_1m.push(oi);
    }

    pub fn oi_1m(&self) -> Vec<f64> {
        self.oi_1m.as_slice()
    }

    /// Re-evaluates the squeeze/vol-due gate for one HTF bucket against
    /// its own BB-width and ATR-percentile history, called once per
    /// finalized 15m/4h bar. `vol_due` stays true for the whole squeeze
    /// rather than pulsing only on the rising edge, so a later alert tick
    /// can still observe it for the grader's whitelist check.
    pub fn update_vol_due(
        &mut self,
        interval: Interval,
        bb_width_threshold: f64,
        atr_pct_threshold: f64,
        lookback: usize,
        percentile_threshold: f64,
        now_ms: i64,
    ) {
        let htf = self.htf.get_mut(&interval).expect("htf interval always present");
        let closes = htf.closes.as_slice();
        let highs = htf.highs.as_slice();
        let lows = htf.lows.as_slice();

        let atr = indicators::atr(&highs, &lows, &closes, ATR_PERIOD);
        if let Some(value) = atr {
            htf.atr_history.push(value);
        }
        let atr_history = htf.atr_history.as_slice();
        let bb_width = indicators::bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_STD).map(|b| b.width);
        let last_close = closes.last().copied();

        let squeeze = match (atr, bb_width, last_close) {
            (Some(atr_value), Some(width), Some(price)) if price > 0.0 => {
                let atr_pct = atr_value / price;
                let pct_rank = indicators::volatility_percentile(&atr_history, atr_value, lookback).unwrap_or(100.0);
                width <= bb_width_threshold && atr_pct <= atr_pct_threshold && pct_rank <= percentile_threshold
            }
            _ => false,
        };

        let (prev_squeeze, since_ms, flags) = match interval {
            Interval::FifteenMin => (&mut self.squeeze_prev_15m, &mut self.vol_due_since_15m_ms, &mut self.vol_due_15m),
            Interval::FourHour => (&mut self.squeeze_prev_4h, &mut self.vol_due_since_4h_ms, &mut self.vol_due_4h),
            Interval::OneMin => return,
        };

        if squeeze && !*prev_squeeze {
            *since_ms = Some(now_ms);
        } else if !squeeze {
            *since_ms = None;
        }
        *prev_squeeze = squeeze;
        *flags = VolDueFlags {
            squeeze,
            vol_due: squeeze,
            age_ms: since_ms.map(|start| now_ms - start),
        };
    }

    pub fn mark_signal(&mut self, signal: &str, ts_ms: i64) {
        self.last_signal_ts.insert(signal.to_string(), ts_ms);
    }

    pub fn last_signal_ts(&self, signal: &str) -> Option<i64> {
        self.last_signal_ts.get(signal).copied()
    }

    pub fn closes_1m(&self) -> Vec<f64> {
        self.closes_1m.as_slice()
    }
    pub fn highs_1m(&self) -> Vec<f64> {
        self.highs_1m.as_slice()
    }
    pub fn lows_1m(&self) -> Vec<f64> {
        self.lows_1m.as_slice()
    }
    pub fn opens_1m(&self) -> Vec<f64> {
        self.opens_1m.as_slice()
    }
    pub fn volumes_1m(&self) -> Vec<f64> {
        self.volumes_1m.as_slice()
    }
    pub fn atr_history(&self) -> Vec<f64> {
        self.atr_history.as_slice()
    }

    fn htf(&self, interval: Interval) -> &HtfState {
        self.htf.get(&interval).expect("htf interval always present")
    }

    pub fn htf_opens(&self, interval: Interval) -> Vec<f64> {
        self.htf(interval).opens.as_slice()
    }
    pub fn htf_highs(&self, interval: Interval) -> Vec<f64> {
        self.htf(interval).highs.as_slice()
    }
    pub fn htf_lows(&self, interval: Interval) -> Vec<f64> {
        self.htf(interval).lows.as_slice()
    }
    pub fn htf_closes(&self, interval: Interval) -> Vec<f64> {
        self.htf(interval).closes.as_slice()
    }
    pub fn htf_volumes(&self, interval: Interval) -> Vec<f64> {
        self.htf(interval).volumes.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time_ms: i64, close: f64, closed: bool) -> Candle {
        Candle {
            open_time_ms,
            close_time_ms: open_time_ms + 60_000,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 10.0,
            closed,
        }
    }

    #[test]
    fn four_closed_1m_buckets_fold_into_one_15m_candle() {
        let mut state = SymbolState::new("binance", "BTCUSDT");
        let base = 1_700_000_000_000i64 - (1_700_000_000_000i64 % (15 * 60_000));
        let mut finalized_count = 0;
        for i in 0..16 {
            let ts = base + i * 60_000;
            let out = state.update(&candle(ts, 100.0 + i as f64, true));
            finalized_count += out.iter().filter(|b| b.interval == Interval::FifteenMin).count();
        }
        // 16 closed 1m bars covering bars 0..15 roll into bucket 0 (bars 0-14)
        // finalized once bar 15 (minute 15) starts the next bucket.
        assert_eq!(finalized_count, 1);
        assert_eq!(state.htf_closes(Interval::FifteenMin).len(), 1);
    }

    #[test]
    fn atr_1m_populates_once_fifteen_closes_exist() {
        let mut state = SymbolState::new("binance", "BTCUSDT");
        for i in 0..14 {
            state.update(&candle(i * 60_000, 100.0, false));
        }
        assert!(state.atr_1m.is_none());
        state.update(&candle(14 * 60_000, 100.0, false));
        assert!(state.atr_1m.is_some());
    }

    #[test]
    fn indicator_cache_reuses_value_within_ttl() {
        let mut cache = IndicatorCache::default();
        let mut calls = 0;
        let v1 = cache.get_or_compute("rsi", 50, 1_000, || {
            calls += 1;
            42.0
        });
        let v2 = cache.get_or_compute("rsi", 50, 1_500, || {
            calls += 1;
            99.0
        });
        assert_eq!(v1, v2);
        assert_eq!(calls, 1);
    }

    #[test]
    fn indicator_cache_recomputes_after_ttl_expiry() {
        let mut cache = IndicatorCache::default();
        cache.get_or_compute("rsi", 50, 1_000, || 42.0);
        let v2 = cache.get_or_compute("rsi", 50, 20_000, || 99.0);
        assert_eq!(v2, 99.0);
    }
}

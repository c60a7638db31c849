//! The per-symbol value object emitted on every throttled tick, and the
//! pure function that assembles one from a `SymbolState`.

use serde::{Deserialize, Serialize};

use super::candle::Interval;
use super::indicators::{self, Bollinger, Macd, StochRsi, TrendExhaustion};
use super::sector_tags::sector_tags;
use super::symbol_state::SymbolState;

/// Per-timeframe WaveTrend / Cipher B reading.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CipherReading {
    pub wt1: Option<f64>,
    pub wt2: Option<f64>,
    pub cipher_buy: bool,
    pub cipher_sell: bool,
}

/// Per-timeframe Williams %R / Trend Exhaustion reading, flattened for
/// serialization.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrendExhaustionReading {
    pub fast_r: Option<f64>,
    pub slow_r: Option<f64>,
    pub ob_entry: bool,
    pub ob_exit: bool,
    pub os_entry: bool,
    pub os_exit: bool,
    pub cross_bull: bool,
    pub cross_bear: bool,
}

impl From<TrendExhaustion> for TrendExhaustionReading {
    fn from(t: TrendExhaustion) -> Self {
        Self {
            fast_r: t.fast_r,
            slow_r: t.slow_r,
            ob_entry: t.ob_entry,
            ob_exit: t.ob_exit,
            os_entry: t.os_entry,
            os_exit: t.os_exit,
            cross_bull: t.cross_bull,
            cross_bear: t.cross_bear,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BollingerReading {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
    pub position: f64,
}

impl From<Bollinger> for BollingerReading {
    fn from(b: Bollinger) -> Self {
        Self {
            upper: b.upper,
            middle: b.middle,
            lower: b.lower,
            width: b.width,
            position: b.position,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolDueFlags {
    pub squeeze: bool,
    pub vol_due: bool,
    pub age_ms: Option<i64>,
}

/// The full per-symbol value object. Every field that is not always
/// computable is `Option`, per the "struct of optionals, never a runtime
/// dict" design note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub exchange: String,
    pub symbol: String,
    pub event_ts: i64,

    pub last_price: Option<f64>,
    pub change_1m: Option<f64>,
    pub change_5m: Option<f64>,
    pub change_15m: Option<f64>,
    pub change_60m: Option<f64>,
    pub change_1d: Option<f64>,

    pub atr_1m: Option<f64>,
    pub atr_4h: Option<f64>,
    pub vol_zscore: Option<f64>,
    pub rvol: Option<f64>,
    pub breakout_15: Option<f64>,
    pub breakdown_15: Option<f64>,
    pub vwap_15: Option<f64>,

    pub momentum_5m: Option<f64>,
    pub momentum_15m: Option<f64>,
    pub momentum_score: Option<f64>,

    pub cipher_15m: CipherReading,
    pub cipher_4h: CipherReading,
    pub cipher_buy: bool,
    pub cipher_sell: bool,
    pub cipher_source_tf: Option<&'static str>,
    pub cipher_reason: Option<String>,

    pub trend_exhaustion_15m: TrendExhaustionReading,
    pub trend_exhaustion_4h: TrendExhaustionReading,

    pub impulse_score: Option<f64>,
    pub impulse_dir: i8,

    pub rsi_15m: Option<f64>,
    pub rsi_4h: Option<f64>,
    pub macd_15m: Option<Macd>,
    pub macd_4h: Option<Macd>,
    pub stoch_rsi_15m: Option<StochRsi>,
    pub stoch_rsi_4h: Option<StochRsi>,
    pub mfi_15m: Option<f64>,
    pub mfi_4h: Option<f64>,

    pub mtf_bull_votes: u8,
    pub mtf_bear_votes: u8,
    pub mtf_aligned: bool,

    pub bollinger_15m: Option<BollingerReading>,
    pub bollinger_4h: Option<BollingerReading>,
    pub volatility_percentile: Option<f64>,

    pub vol_due_15m: VolDueFlags,
    pub vol_due_4h: VolDueFlags,

    pub swing_long: bool,

    pub liquidity_rank: Option<u32>,
    pub liquidity_top200: bool,
    pub market_cap: Option<f64>,

    pub setup_score: Option<f64>,
    pub setup_grade: Option<char>,
    pub avoid_reasons: Vec<String>,

    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
    pub oi_change_5m: Option<f64>,

    pub volume_1m: Option<f64>,
    pub signal_composite: Option<f64>,

    pub sector_tags: Vec<&'static str>,
}

const CIPHER_CHLEN: usize = 9;
const CIPHER_AVG: usize = 12;
const CIPHER_MALEN: usize = 3;
const RSI_PERIOD: usize = 14;
const MFI_PERIOD: usize = 60;
const MFI_MULTIPLIER: f64 = 150.0;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STD: f64 = 2.0;
const VOL_ZSCORE_LOOKBACK: usize = 30;
const RVOL_LOOKBACK: usize = 30;
const BREAKOUT_LOOKBACK: usize = 15;
const VOLATILITY_PCT_LOOKBACK: usize = 30;
const OI_CHANGE_WINDOW: usize = 5;

fn cipher_reading(highs: &[f64], lows: &[f64], closes: &[f64], os: f64, ob: f64) -> CipherReading {
    let (wt1, wt2, wt1_prev, wt2_prev) = indicators::wavetrend(highs, lows, closes, CIPHER_CHLEN, CIPHER_AVG, CIPHER_MALEN);
    let (buy, sell) = indicators::cipher_b_signals(wt1, wt2, wt1_prev, wt2_prev, os, ob);
    CipherReading {
        wt1,
        wt2,
        cipher_buy: buy,
        cipher_sell: sell,
    }
}

fn trend_exhaustion_reading(highs: &[f64], lows: &[f64], closes: &[f64]) -> TrendExhaustionReading {
    indicators::percent_r_trend_exhaustion(highs, lows, closes, 21, 7, 112, 3, -20.0, -80.0).into()
}

/// Assembles a [`MetricsSnapshot`] for one symbol from its rolling state.
/// `cipher_os`/`cipher_ob` come from config (`CIPHERB_OS_LEVEL`/`OB_LEVEL`).
pub fn compute_metrics(state: &SymbolState, now_ms: i64, cipher_os: f64, cipher_ob: f64) -> MetricsSnapshot {
    let closes_1m = state.closes_1m();
    let highs_1m = state.highs_1m();
    let lows_1m = state.lows_1m();
    let volumes_1m = state.volumes_1m();

    let closes_15m = state.htf_closes(Interval::FifteenMin);
    let highs_15m = state.htf_highs(Interval::FifteenMin);
    let lows_15m = state.htf_lows(Interval::FifteenMin);
    let opens_15m = state.htf_opens(Interval::FifteenMin);

    let closes_4h = state.htf_closes(Interval::FourHour);
    let highs_4h = state.htf_highs(Interval::FourHour);
    let lows_4h = state.htf_lows(Interval::FourHour);
    let opens_4h = state.htf_opens(Interval::FourHour);

    let last_price = state.last_price;

    let change_1m = last_price.and_then(|p| indicators::pct_change_with_current(&closes_1m, 1, p));
    let change_5m = last_price.and_then(|p| indicators::pct_change_with_current(&closes_1m, 5, p));
    let change_15m = last_price.and_then(|p| indicators::pct_change_with_current(&closes_1m, 15, p));
    let change_60m = last_price.and_then(|p| indicators::pct_change_with_current(&closes_1m, 60, p));
    let change_1d = last_price.and_then(|p| indicators::pct_change_with_current(&closes_4h, 6, p));

    let vol_zscore = indicators::zscore_abs_ret(&closes_1m, VOL_ZSCORE_LOOKBACK);
    let rvol = indicators::rvol_ratio(&volumes_1m, 1, RVOL_LOOKBACK);
    let breakout_15 = indicators::breakout(&closes_1m, &highs_1m, BREAKOUT_LOOKBACK);
    let breakdown_15 = indicators::breakdown(&closes_1m, &lows_1m, BREAKOUT_LOOKBACK);
    let vwap_15 = indicators::vwap(&closes_1m, &volumes_1m, BREAKOUT_LOOKBACK);

    let momentum_5m = last_price.and_then(|p| indicators::momentum_with_current(&closes_1m, 5, p));
    let momentum_15m = last_price.and_then(|p| indicators::momentum_with_current(&closes_1m, 15, p));
    let momentum_score = last_price.and_then(|p| indicators::momentum_score_with_current(&closes_1m, p));

    let cipher_15m = cipher_reading(&highs_15m, &lows_15m, &closes_15m, cipher_os, cipher_ob);
    let cipher_4h = cipher_reading(&highs_4h, &lows_4h, &closes_4h, cipher_os, cipher_ob);

    let (cipher_buy, cipher_sell, cipher_source_tf, cipher_reason) = if cipher_15m.cipher_buy || cipher_15m.cipher_sell {
        let dir = if cipher_15m.cipher_buy { "cross-up" } else { "cross-down" };
        (
            cipher_15m.cipher_buy,
            cipher_15m.cipher_sell,
            Some("15m"),
            Some(format!(
                "15m {dir}: wt1={:.2} wt2={:.2}",
                cipher_15m.wt1.unwrap_or_default(),
                cipher_15m.wt2.unwrap_or_default()
            )),
        )
    } else if cipher_4h.cipher_buy || cipher_4h.cipher_sell {
        let dir = if cipher_4h.cipher_buy { "cross-up" } else { "cross-down" };
        (
            cipher_4h.cipher_buy,
            cipher_4h.cipher_sell,
            Some("4h"),
            Some(format!(
                "4h {dir}: wt1={:.2} wt2={:.2}",
                cipher_4h.wt1.unwrap_or_default(),
                cipher_4h.wt2.unwrap_or_default()
            )),
        )
    } else {
        (false, false, None, None)
    };

    let trend_exhaustion_15m = trend_exhaustion_reading(&highs_15m, &lows_15m, &closes_15m);
    let trend_exhaustion_4h = trend_exhaustion_reading(&highs_4h, &lows_4h, &closes_4h);

    let (impulse_score, impulse_dir) = match change_1m {
        Some(c1m) => {
            let (score, dir) = indicators::impulse_score(c1m, vol_zscore, rvol, momentum_score);
            (Some(score), dir)
        }
        None => (None, 0),
    };

    let rsi_15m = indicators::rsi(&closes_15m, RSI_PERIOD);
    let rsi_4h = indicators::rsi(&closes_4h, RSI_PERIOD);
    let macd_15m = indicators::macd(&closes_15m, 12, 26, 9);
    let macd_4h = indicators::macd(&closes_4h, 12, 26, 9);
    let stoch_rsi_15m = indicators::stochastic_rsi(&closes_15m, 14, 14, 3, 3);
    let stoch_rsi_4h = indicators::stochastic_rsi(&closes_4h, 14, 14, 3, 3);
    let mfi_15m = indicators::money_flow_index(&opens_15m, &highs_15m, &lows_15m, &closes_15m, MFI_PERIOD, MFI_MULTIPLIER);
    let mfi_4h = indicators::money_flow_index(&opens_4h, &highs_4h, &lows_4h, &closes_4h, MFI_PERIOD, MFI_MULTIPLIER);

    let (mtf_bull_votes, mtf_bear_votes, mtf_aligned) = mtf_confluence(rsi_4h, macd_4h, momentum_score);

    let bollinger_15m = indicators::bollinger(&closes_15m, BOLLINGER_PERIOD, BOLLINGER_STD).map(Into::into);
    let bollinger_4h = indicators::bollinger(&closes_4h, BOLLINGER_PERIOD, BOLLINGER_STD).map(Into::into);

    let volatility_percentile = state
        .atr_1m
        .and_then(|atr| indicators::volatility_percentile(&state.atr_history(), atr, VOLATILITY_PCT_LOOKBACK));

    let oi_change_5m = indicators::pct_change(&state.oi_1m(), OI_CHANGE_WINDOW);
    let signal_composite = Some(indicators::signal_score(momentum_score, oi_change_5m, rvol, breakout_15, vol_zscore));
    let volume_1m = volumes_1m.last().copied();

    MetricsSnapshot {
        exchange: state.exchange.clone(),
        symbol: state.symbol.clone(),
        event_ts: now_ms,
        last_price,
        change_1m,
        change_5m,
        change_15m,
        change_60m,
        change_1d,
        atr_1m: state.atr_1m,
        atr_4h: indicators::atr(&highs_4h, &lows_4h, &closes_4h, 14),
        vol_zscore,
        rvol,
        breakout_15,
        breakdown_15,
        vwap_15,
        momentum_5m,
        momentum_15m,
        momentum_score,
        cipher_15m,
        cipher_4h,
        cipher_buy,
        cipher_sell,
        cipher_source_tf,
        cipher_reason,
        trend_exhaustion_15m,
        trend_exhaustion_4h,
        impulse_score,
        impulse_dir,
        rsi_15m,
        rsi_4h,
        macd_15m,
        macd_4h,
        stoch_rsi_15m,
        stoch_rsi_4h,
        mfi_15m,
        mfi_4h,
        mtf_bull_votes,
        mtf_bear_votes,
        mtf_aligned,
        bollinger_15m,
        bollinger_4h,
        volatility_percentile,
        vol_due_15m: state.vol_due_15m,
        vol_due_4h: state.vol_due_4h,
        // A bullish %R cross on the 4h book with RSI still mid-range reads
        // as a pullback inside an uptrend rather than a fresh breakout —
        // the swing-pullback plan variant targets this setup specifically.
        swing_long: trend_exhaustion_4h.cross_bull && rsi_4h.is_some_and(|r| (35.0..65.0).contains(&r)),
        liquidity_rank: None,
        liquidity_top200: false,
        market_cap: None,
        setup_score: None,
        setup_grade: None,
        avoid_reasons: Vec::new(),
        funding_rate: None,
        open_interest: state.open_interest,
        oi_change_5m,
        volume_1m,
        signal_composite,
        sector_tags: sector_tags(&state.symbol).to_vec(),
    }
}

/// ≥3-of-4 checks passing (1h+4h RSI not extreme, MACD histogram aligned
/// with momentum direction) counts as MTF-aligned and contributes to the
/// Grader's confluence bonus.
fn mtf_confluence(rsi_4h: Option<f64>, macd_4h: Option<Macd>, momentum_score: Option<f64>) -> (u8, u8, bool) {
    let mut bull = 0u8;
    let mut bear = 0u8;
    let mut checks_passing = 0u8;
    let mut checks_total = 0u8;

    if let Some(rsi) = rsi_4h {
        checks_total += 1;
        if rsi > 50.0 {
            bull += 1;
        } else {
            bear += 1;
        }
        if !(10.0..=90.0).contains(&rsi) {
            // extreme RSI fails the "not extreme" check
        } else {
            checks_passing += 1;
        }
    }
    if let (Some(macd), Some(mom)) = (macd_4h, momentum_score) {
        checks_total += 1;
        if macd.histogram > 0.0 {
            bull += 1;
        } else {
            bear += 1;
        }
        let aligned = (macd.histogram > 0.0 && mom > 0.0) || (macd.histogram < 0.0 && mom < 0.0);
        if aligned {
            checks_passing += 1;
        }
    }

    let aligned = checks_total > 0 && checks_passing as f64 / checks_total.max(1) as f64 >= 0.75;
    (bull, bear, aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_metrics_on_empty_state_is_all_none() {
        let state = SymbolState::new("binance", "BTCUSDT");
        let snap = compute_metrics(&state, 1_000, -40.0, 40.0);
        assert!(snap.last_price.is_none());
        assert!(snap.cipher_buy == false && snap.cipher_sell == false);
        assert_eq!(snap.cipher_source_tf, None);
    }

    #[test]
    fn sector_tags_flow_through_from_symbol() {
        let state = SymbolState::new("binance", "DOGEUSDT");
        let snap = compute_metrics(&state, 1_000, -40.0, 40.0);
        assert_eq!(snap.sector_tags, vec!["Meme", "Top 10"]);
    }
}

//! Pure indicator functions over plain `&[f64]` windows.
//!
//! Every function here returns `None` when its window is under-provisioned
//! rather than panicking or returning a misleading zero, matching the
//! "nullable float" indicator contract.

/// TradingView-style recursive EMA: seeded with the first value of the
/// series rather than an SMA warm-up, so it matches `_ema_series` in the
/// reference calculator bar-for-bar.
pub fn ema_series(values: &[f64], length: usize) -> Vec<f64> {
    if values.is_empty() || length == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (length as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    out.push(values[0]);
    for &v in &values[1..] {
        let prev = *out.last().unwrap();
        out.push(alpha * v + (1.0 - alpha) * prev);
    }
    out
}

fn sma_last(values: &[f64], length: usize) -> Option<f64> {
    if values.len() < length || length == 0 {
        return None;
    }
    let tail = &values[values.len() - length..];
    Some(tail.iter().sum::<f64>() / length as f64)
}

pub fn pct_change(values: &[f64], window: usize) -> Option<f64> {
    if values.len() <= window {
        return None;
    }
    let base = values[values.len() - 1 - window];
    if base == 0.0 {
        return None;
    }
    let current = *values.last().unwrap();
    Some((current - base) / base)
}

pub fn pct_change_with_current(values: &[f64], window: usize, current_price: f64) -> Option<f64> {
    if values.len() < window || window == 0 {
        return None;
    }
    let base = values[values.len() - window];
    if base == 0.0 {
        return None;
    }
    Some((current_price - base) / base)
}

/// True range mean over the last `period` bars. Wilder's *initial* ATR
/// value is defined exactly this way: the simple mean of the first N true
/// ranges, not a recursive smooth — so "mean of last 14 true ranges" and
/// "Wilder smoothing" describe the same computation here.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    if highs.len() < period + 1 || lows.len() < period + 1 || closes.len() < period + 1 {
        return None;
    }
    let n = closes.len();
    let mut trs = Vec::with_capacity(period);
    for i in (n - period)..n {
        let tr = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        trs.push(tr);
    }
    Some(trs.iter().sum::<f64>() / period as f64)
}

pub fn zscore_abs_ret(closes: &[f64], lookback: usize) -> Option<f64> {
    if closes.len() < lookback + 1 {
        return None;
    }
    let n = closes.len();
    let mut rets = Vec::with_capacity(lookback);
    for i in (n - lookback)..n {
        if closes[i - 1] == 0.0 {
            return None;
        }
        rets.push(((closes[i] - closes[i - 1]) / closes[i - 1]).abs());
    }
    let last_ret = *rets.last()?;
    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rets.len() as f64;
    let sd = var.sqrt();
    if sd == 0.0 {
        return None;
    }
    Some((last_ret - mean) / sd)
}

fn sum_tail(values: &[f64], n: usize) -> Option<f64> {
    if values.len() < n {
        return None;
    }
    Some(values[values.len() - n..].iter().sum())
}

pub fn rvol_ratio(volumes: &[f64], n: usize, lookback: usize) -> Option<f64> {
    if volumes.len() < n + lookback {
        return None;
    }
    let last_n = sum_tail(volumes, n)? / n as f64;
    let prior = &volumes[volumes.len() - n - lookback..volumes.len() - n];
    let prior_avg = prior.iter().sum::<f64>() / lookback as f64;
    if prior_avg == 0.0 {
        return None;
    }
    Some(last_n / prior_avg)
}

/// Breakout vs the last `n` *closed* bars, excluding the most recent
/// (possibly still-forming) one: `closes[-2] / max(highs[-n-1..-1]) - 1`.
pub fn breakout(closes: &[f64], highs: &[f64], n: usize) -> Option<f64> {
    if closes.len() < 2 || highs.len() < n + 1 {
        return None;
    }
    let last_closed = closes[closes.len() - 2];
    let window = &highs[highs.len() - n - 1..highs.len() - 1];
    let max_h = window.iter().cloned().fold(f64::MIN, f64::max);
    if max_h == 0.0 {
        return None;
    }
    Some(last_closed / max_h - 1.0)
}

pub fn breakdown(closes: &[f64], lows: &[f64], n: usize) -> Option<f64> {
    if closes.len() < 2 || lows.len() < n + 1 {
        return None;
    }
    let last_closed = closes[closes.len() - 2];
    let window = &lows[lows.len() - n - 1..lows.len() - 1];
    let min_l = window.iter().cloned().fold(f64::MAX, f64::min);
    if min_l == 0.0 {
        return None;
    }
    Some(last_closed / min_l - 1.0)
}

pub fn vwap(closes: &[f64], volumes: &[f64], n: usize) -> Option<f64> {
    if closes.len() < n + 1 || volumes.len() < n + 1 {
        return None;
    }
    let c = &closes[closes.len() - n - 1..closes.len() - 1];
    let v = &volumes[volumes.len() - n - 1..volumes.len() - 1];
    let vol_sum: f64 = v.iter().sum();
    if vol_sum == 0.0 {
        return None;
    }
    let num: f64 = c.iter().zip(v.iter()).map(|(c, v)| c * v).sum();
    Some(num / vol_sum)
}

const MOMENTUM_WEIGHTS: [(usize, f64); 5] = [(1, 0.1), (3, 0.15), (5, 0.25), (10, 0.25), (15, 0.25)];

pub fn momentum(closes: &[f64], window: usize) -> Option<f64> {
    pct_change(closes, window).map(|c| c * 100.0)
}

pub fn momentum_with_current(closes: &[f64], window: usize, current_price: f64) -> Option<f64> {
    pct_change_with_current(closes, window, current_price).map(|c| c * 100.0)
}

pub fn momentum_score_with_current(closes: &[f64], current_price: f64) -> Option<f64> {
    let mut weighted = 0.0;
    let mut weight_total = 0.0;
    for &(window, weight) in MOMENTUM_WEIGHTS.iter() {
        if let Some(m) = momentum_with_current(closes, window, current_price) {
            weighted += m * weight;
            weight_total += weight;
        }
    }
    if weight_total == 0.0 {
        return None;
    }
    let raw = weighted / weight_total;
    // normalize: +/-10% move maps to +/-100
    Some((raw / 0.75).clamp(-100.0, 100.0))
}

/// `esa/de/ci/wt1/wt2` WaveTrend chain. Always returns a 4-tuple
/// `(wt1, wt2, wt1_prev, wt2_prev)`, including the under-provisioned case —
/// there is no shorter-arity branch anywhere in this implementation.
pub fn wavetrend(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    chlen: usize,
    avg: usize,
    malen: usize,
) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
    let n = closes.len();
    if n < chlen + avg + malen + 2 || highs.len() != n || lows.len() != n {
        return (None, None, None, None);
    }
    let hlc3: Vec<f64> = (0..n).map(|i| (highs[i] + lows[i] + closes[i]) / 3.0).collect();
    let esa = ema_series(&hlc3, chlen);
    let abs_diff: Vec<f64> = hlc3.iter().zip(esa.iter()).map(|(h, e)| (h - e).abs()).collect();
    let de = ema_series(&abs_diff, chlen);
    let ci: Vec<f64> = hlc3
        .iter()
        .zip(esa.iter())
        .zip(de.iter())
        .map(|((h, e), d)| if *d == 0.0 { 0.0 } else { (h - e) / (0.015 * d) })
        .collect();
    let wt1 = ema_series(&ci, avg);
    // wt2 = SMA(wt1, malen) computed pointwise over the wt1 series.
    let wt2: Vec<Option<f64>> = (0..wt1.len())
        .map(|i| {
            if i + 1 < malen {
                None
            } else {
                Some(wt1[i + 1 - malen..=i].iter().sum::<f64>() / malen as f64)
            }
        })
        .collect();

    let last = wt1.len() - 1;
    let wt1_last = wt1[last];
    let wt2_last = wt2[last];
    let (wt1_prev, wt2_prev) = if last == 0 {
        (None, None)
    } else {
        (Some(wt1[last - 1]), wt2[last - 1])
    };
    (Some(wt1_last), wt2_last, wt1_prev, wt2_prev)
}

/// Fresh cross detection from a WaveTrend 4-tuple. `(cross_up, cross_down)`.
pub fn cipher_b_signals(
    wt1: Option<f64>,
    wt2: Option<f64>,
    wt1_prev: Option<f64>,
    wt2_prev: Option<f64>,
    os_level: f64,
    ob_level: f64,
) -> (bool, bool) {
    let (Some(wt1), Some(wt2), Some(wt1_prev), Some(wt2_prev)) = (wt1, wt2, wt1_prev, wt2_prev)
    else {
        return (false, false);
    };
    let oversold = wt2 <= os_level;
    let overbought = wt2 >= ob_level;
    let prev_diff = wt1_prev - wt2_prev;
    let curr_diff = wt1 - wt2;
    let cross_up = prev_diff < 0.0 && curr_diff >= 0.0;
    let cross_down = prev_diff > 0.0 && curr_diff <= 0.0;
    (oversold && cross_up, overbought && cross_down)
}

pub fn williams_r(highs: &[f64], lows: &[f64], closes: &[f64], length: usize) -> Option<f64> {
    if highs.len() < length || lows.len() < length || closes.is_empty() {
        return None;
    }
    let h = &highs[highs.len() - length..];
    let l = &lows[lows.len() - length..];
    let max_h = h.iter().cloned().fold(f64::MIN, f64::max);
    let min_l = l.iter().cloned().fold(f64::MAX, f64::min);
    if max_h == min_l {
        return None;
    }
    let close = *closes.last()?;
    Some(100.0 * (close - max_h) / (max_h - min_l))
}

/// Output of `percent_r_trend_exhaustion`: dual %R with edge-detected
/// zone entry/exit and slow/fast crossovers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrendExhaustion {
    pub fast_r: Option<f64>,
    pub slow_r: Option<f64>,
    pub ob_entry: bool,
    pub ob_exit: bool,
    pub os_entry: bool,
    pub os_exit: bool,
    pub cross_bull: bool,
    pub cross_bear: bool,
}

/// `short_length`/`short_smoothing` drive the fast %R, `long_length`/
/// `long_smoothing` the slow %R. Defaults per the indicator bank: 21/7 and
/// 112/3, ob=-20, os=-80.
pub fn percent_r_trend_exhaustion(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    short_length: usize,
    short_smoothing: usize,
    long_length: usize,
    long_smoothing: usize,
    ob_level: f64,
    os_level: f64,
) -> TrendExhaustion {
    let needed = long_length.max(short_length) + long_smoothing.max(short_smoothing) + 2;
    if closes.len() < needed {
        return TrendExhaustion::default();
    }

    let raw_fast: Vec<f64> = (short_length..=closes.len())
        .map(|i| williams_r(&highs[..i], &lows[..i], &closes[..i], short_length).unwrap_or(0.0))
        .collect();
    let raw_slow: Vec<f64> = (long_length..=closes.len())
        .map(|i| williams_r(&highs[..i], &lows[..i], &closes[..i], long_length).unwrap_or(0.0))
        .collect();

    if raw_fast.len() < short_smoothing + 2 || raw_slow.len() < long_smoothing + 2 {
        return TrendExhaustion::default();
    }

    let fast_smooth = ema_series(&raw_fast, short_smoothing);
    let slow_smooth = ema_series(&raw_slow, long_smoothing);

    let fast_last = *fast_smooth.last().unwrap();
    let fast_prev = fast_smooth[fast_smooth.len() - 2];
    let slow_last = *slow_smooth.last().unwrap();
    let slow_prev = slow_smooth[slow_smooth.len() - 2];

    let ob_now = fast_last >= ob_level && slow_last >= ob_level;
    let ob_prev = fast_prev >= ob_level && slow_prev >= ob_level;
    let os_now = fast_last <= os_level && slow_last <= os_level;
    let os_prev = fast_prev <= os_level && slow_prev <= os_level;

    let prev_diff = slow_prev - fast_prev;
    let curr_diff = slow_last - fast_last;
    let cross_bull = prev_diff > 0.0 && curr_diff <= 0.0; // slow crosses below fast
    let cross_bear = prev_diff < 0.0 && curr_diff >= 0.0; // slow crosses above fast

    TrendExhaustion {
        fast_r: Some(fast_last),
        slow_r: Some(slow_last),
        ob_entry: ob_now && !ob_prev,
        ob_exit: !ob_now && ob_prev,
        os_entry: os_now && !os_prev,
        os_exit: !os_now && os_prev,
        cross_bull,
        cross_bear,
    }
}

pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let n = closes.len();
    let mut gains = Vec::with_capacity(period);
    let mut losses = Vec::with_capacity(period);
    for i in (n - period)..n {
        let delta = closes[i] - closes[i - 1];
        gains.push(delta.max(0.0));
        losses.push((-delta).max(0.0));
    }
    let avg_gain = gains.iter().sum::<f64>() / period as f64;
    let avg_loss = losses.iter().sum::<f64>() / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if closes.len() < slow + signal {
        return None;
    }
    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);
    let diff: Vec<f64> = ema_fast.iter().zip(ema_slow.iter()).map(|(f, s)| f - s).collect();
    let signal_series = ema_series(&diff, signal);
    let macd_val = *diff.last()?;
    let signal_val = *signal_series.last()?;
    Some(Macd {
        macd: macd_val,
        signal: signal_val,
        histogram: macd_val - signal_val,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StochRsi {
    pub k: f64,
    pub d: f64,
}

/// Stoch-of-RSI with `%K = SMA(raw_stoch, k_smooth)` and
/// `%D = SMA(%K, d_smooth)` — the smoothed-K reading, per the indicator
/// bank's literal description (the %D is not taken from the raw series).
pub fn stochastic_rsi(
    closes: &[f64],
    rsi_period: usize,
    stoch_period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> Option<StochRsi> {
    if closes.len() < rsi_period + stoch_period + k_smooth + d_smooth {
        return None;
    }
    let rsi_series: Vec<f64> = (rsi_period..closes.len())
        .filter_map(|i| rsi(&closes[..=i], rsi_period))
        .collect();
    if rsi_series.len() < stoch_period + k_smooth + d_smooth {
        return None;
    }
    let raw_stoch: Vec<f64> = (stoch_period - 1..rsi_series.len())
        .map(|i| {
            let window = &rsi_series[i + 1 - stoch_period..=i];
            let lo = window.iter().cloned().fold(f64::MAX, f64::min);
            let hi = window.iter().cloned().fold(f64::MIN, f64::max);
            if hi == lo {
                0.0
            } else {
                100.0 * (rsi_series[i] - lo) / (hi - lo)
            }
        })
        .collect();
    if raw_stoch.len() < k_smooth + d_smooth {
        return None;
    }
    let k_series = sma_series(&raw_stoch, k_smooth)?;
    let d_series = sma_series(&k_series, d_smooth)?;
    Some(StochRsi {
        k: *k_series.last()?,
        d: *d_series.last()?,
    })
}

fn sma_series(values: &[f64], length: usize) -> Option<Vec<f64>> {
    if values.len() < length || length == 0 {
        return None;
    }
    Some(
        (length - 1..values.len())
            .map(|i| values[i + 1 - length..=i].iter().sum::<f64>() / length as f64)
            .collect(),
    )
}

/// Cipher-style MFI: SMA over the last `period` of `((c-o)/(h-l))*multiplier`.
pub fn money_flow_index(
    opens: &[f64],
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
    multiplier: f64,
) -> Option<f64> {
    if opens.len() < period || highs.len() < period || lows.len() < period || closes.len() < period {
        return None;
    }
    let n = closes.len();
    let mut vals = Vec::with_capacity(period);
    for i in (n - period)..n {
        let range = highs[i] - lows[i];
        vals.push(if range == 0.0 {
            0.0
        } else {
            (closes[i] - opens[i]) / range * multiplier
        });
    }
    Some(vals.iter().sum::<f64>() / period as f64)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
    pub position: f64,
}

pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<Bollinger> {
    if closes.len() < period {
        return None;
    }
    let tail = &closes[closes.len() - period..];
    let mean = tail.iter().sum::<f64>() / period as f64;
    let var = tail.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    let upper = mean + num_std * sd;
    let lower = mean - num_std * sd;
    if upper == lower || mean == 0.0 {
        return None;
    }
    let close = *closes.last()?;
    Some(Bollinger {
        upper,
        middle: mean,
        lower,
        width: (upper - lower) / mean,
        position: (close - lower) / (upper - lower),
    })
}

pub fn volatility_percentile(atr_history: &[f64], current_atr: f64, lookback: usize) -> Option<f64> {
    if atr_history.is_empty() {
        return None;
    }
    let n = lookback.min(atr_history.len());
    let tail = &atr_history[atr_history.len() - n..];
    let below = tail.iter().filter(|&&v| v < current_atr).count();
    Some(below as f64 / n as f64 * 100.0)
}

pub fn impulse_score(change_1m: f64, vol_zscore: Option<f64>, rvol: Option<f64>, momentum_score: Option<f64>) -> (f64, i8) {
    let dir = if change_1m > 0.0 {
        1
    } else if change_1m < 0.0 {
        -1
    } else {
        0
    };
    let mag = (change_1m.abs() * 100.0 / 0.75).min(1.0);
    let z = (vol_zscore.unwrap_or(0.0).max(0.0) / 5.0).min(1.0);
    let rv = (rvol.unwrap_or(0.0).max(0.0) / 3.0).min(1.0);
    let mom = (momentum_score.unwrap_or(0.0).abs() / 100.0).min(1.0);
    let score = (0.45 * mag + 0.25 * z + 0.20 * rv + 0.10 * mom) * 100.0;
    (score, dir)
}

pub fn signal_score(
    momentum_score: Option<f64>,
    oi_change_5m: Option<f64>,
    rvol: Option<f64>,
    breakout: Option<f64>,
    vol_zscore: Option<f64>,
) -> f64 {
    let _ = vol_zscore;
    let mom = momentum_score.unwrap_or(0.0) * 0.4;

    let oi_component = match oi_change_5m {
        Some(oi) if oi > 0.0 && momentum_score.unwrap_or(0.0) > 0.0 => 100.0,
        Some(oi) if oi < 0.0 && momentum_score.unwrap_or(0.0) < 0.0 => 100.0,
        Some(oi) if oi.abs() > 0.0 => -50.0,
        _ => 0.0,
    } * 0.25;

    let rvol_component = match rvol {
        Some(r) if r > 3.0 => 100.0,
        Some(r) if r > 2.0 => 70.0,
        Some(r) if r > 1.5 => 40.0,
        Some(r) if r < 0.5 => -40.0,
        _ => 0.0,
    } * 0.2;
    let rvol_aligned = if momentum_score.unwrap_or(0.0) < 0.0 {
        -rvol_component
    } else {
        rvol_component
    };

    let breakout_component = breakout.unwrap_or(0.0) * 100.0 * 0.15;

    (mom + oi_component + rvol_aligned + breakout_component).clamp(-100.0, 100.0)
}

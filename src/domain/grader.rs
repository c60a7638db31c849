//! Pure setup grading: `(metrics, side) -> (score, grade, avoid_reasons)`.

use super::metrics_snapshot::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// Per-symbol historical win rate, refreshed wholesale by the backtester
/// and read-only from here.
pub type WinRateTable = std::collections::HashMap<String, f64>;

#[derive(Debug, Clone)]
pub struct GradeResult {
    pub score: f64,
    pub grade: char,
    pub avoid_reasons: Vec<String>,
}

/// Sign convention: `dir` is +1 for BUY-favorable contributions, -1 for
/// SELL-favorable; every component below is expressed for BUY and mirrored
/// by negating its sign for SELL.
pub fn grade(metrics: &MetricsSnapshot, side: Side, win_rates: &WinRateTable) -> GradeResult {
    let dir = match side {
        Side::Buy => 1.0,
        Side::Sell => -1.0,
    };
    let mut score = 0.0;
    let mut reasons = Vec::new();

    // Base contribution for a fired signal.
    score += 2.0;

    // Open interest alignment.
    if let Some(oi_change_5m) = metrics.oi_change_5m {
        let aligned = oi_change_5m * dir > 0.0;
        if aligned {
            score += 2.0;
        } else if oi_change_5m != 0.0 {
            score -= 2.0;
            reasons.push("OI against momentum".to_string());
        }
    }

    // Composite momentum/OI/RVOL/breakout read, scaled to a small swing
    // so it nudges rather than dominates the additive score above.
    if let Some(composite) = metrics.signal_composite {
        score += composite * dir / 100.0;
    }

    // RVOL.
    match metrics.rvol {
        Some(r) if r >= 2.0 => score += 2.0,
        Some(r) if r >= 1.5 => score += 1.0,
        Some(r) if r < 0.5 => {
            score -= 2.0;
            reasons.push("Low volume".to_string());
        }
        Some(r) if r < 0.8 => {
            score -= 1.0;
            reasons.push("Below-average volume".to_string());
        }
        _ => {}
    }

    // Momentum alignment.
    if let Some(m) = metrics.momentum_score {
        let aligned = m * dir > 0.0;
        let strong = m.abs() >= 30.0;
        match (aligned, strong) {
            (true, true) => score += 1.5,
            (true, false) => score += 0.5,
            (false, true) => score -= 1.5,
            (false, false) => score -= 0.5,
        }
        if !aligned {
            reasons.push("Momentum against signal".to_string());
        }
    }

    // Volume magnitude (as a function of rvol already scored above; here a
    // lighter secondary check on raw 1m change magnitude).
    if let Some(c1m) = metrics.change_1m {
        if c1m.abs() * dir >= 0.0 && c1m.abs() > 0.02 {
            score += 0.5;
        } else if c1m.abs() < 0.002 {
            score -= 1.0;
            reasons.push("Negligible move".to_string());
        }
    }

    // 15m RSI extremes.
    if let Some(rsi) = metrics.rsi_15m {
        match side {
            Side::Buy if rsi <= 30.0 => score += 1.5,
            Side::Buy if rsi >= 70.0 => {
                score -= 1.5;
                reasons.push("15m RSI overbought".to_string());
            }
            Side::Sell if rsi >= 70.0 => score += 1.5,
            Side::Sell if rsi <= 30.0 => {
                score -= 1.5;
                reasons.push("15m RSI oversold".to_string());
            }
            _ => {}
        }
    }

    // Funding-rate sentiment (contrarian to a crowded funding skew).
    if let Some(funding) = metrics.funding_rate {
        if funding * dir < 0.0 {
            score += 1.0;
        } else if funding * dir > 0.0 {
            score -= 1.0;
            reasons.push("Funding against signal".to_string());
        }
    }

    // Volatility percentile bucket.
    if let Some(pct) = metrics.volatility_percentile {
        if pct <= 20.0 {
            score += 0.5;
        } else if pct >= 95.0 {
            reasons.push("Extreme volatility".to_string());
        }
    }

    // Bollinger position near bands, in the direction of the signal.
    let bollinger = match side {
        Side::Buy => metrics.bollinger_15m,
        Side::Sell => metrics.bollinger_15m,
    };
    if let Some(b) = bollinger {
        match side {
            Side::Buy if b.position <= 0.1 => score += 1.5,
            Side::Buy if b.position >= 0.95 => {
                score -= 1.5;
                reasons.push("Price stretched to upper band".to_string());
            }
            Side::Sell if b.position >= 0.9 => score += 1.5,
            Side::Sell if b.position <= 0.05 => {
                score -= 1.5;
                reasons.push("Price stretched to lower band".to_string());
            }
            _ => {}
        }
    }

    // ATR-%-of-price risk filter: reject setups where ATR is an outsized
    // fraction of price (thin, illiquid, or about to gap).
    if let (Some(atr), Some(price)) = (metrics.atr_1m, metrics.last_price) {
        if price > 0.0 {
            let atr_pct = atr / price;
            if atr_pct > 0.1 {
                score -= 1.0;
                reasons.push("ATR too large relative to price".to_string());
            }
        }
    }

    // VWAP distance.
    if let (Some(vwap), Some(price)) = (metrics.vwap_15, metrics.last_price) {
        if vwap > 0.0 {
            let dist = (price - vwap) / vwap * dir;
            if dist > 0.0 {
                score += 0.5;
            } else {
                score -= 0.5;
            }
        }
    }

    // MTF confluence.
    if metrics.mtf_aligned {
        score += 2.0;
    } else {
        reasons.push("MTF not aligned".to_string());
    }

    // Historical per-symbol win rate.
    if let Some(&wr) = win_rates.get(&metrics.symbol) {
        if wr < 0.35 {
            score -= 2.0;
            reasons.push("Poor historical win rate".to_string());
        } else if wr > 0.55 {
            score += 1.0;
        }
    }

    let grade = if score >= 6.0 && metrics.mtf_aligned {
        'A'
    } else if score >= 3.0 {
        'B'
    } else {
        'C'
    };

    GradeResult {
        score,
        grade,
        avoid_reasons: reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metrics() -> MetricsSnapshot {
        MetricsSnapshot {
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            last_price: Some(100.0),
            rvol: Some(1.0),
            momentum_score: Some(0.0),
            mtf_aligned: false,
            ..Default::default()
        }
    }

    #[test]
    fn higher_rvol_never_decreases_score() {
        let win_rates = WinRateTable::new();
        let mut low = base_metrics();
        low.rvol = Some(1.0);
        let mut high = low.clone();
        high.rvol = Some(2.5);

        let low_result = grade(&low, Side::Buy, &win_rates);
        let high_result = grade(&high, Side::Buy, &win_rates);
        assert!(high_result.score >= low_result.score);
    }

    #[test]
    fn a_grade_requires_mtf_alignment() {
        let win_rates = WinRateTable::new();
        let mut m = base_metrics();
        m.rvol = Some(3.0);
        m.momentum_score = Some(80.0);
        m.rsi_15m = Some(20.0);
        m.mtf_aligned = false;
        let result = grade(&m, Side::Buy, &win_rates);
        assert!(result.score >= 6.0);
        assert_ne!(result.grade, 'A', "score alone must not earn A without MTF alignment");
    }

    #[test]
    fn grade_c_is_default_floor() {
        let win_rates = WinRateTable::new();
        let m = base_metrics();
        let result = grade(&m, Side::Buy, &win_rates);
        assert_eq!(result.grade, 'C');
    }
}

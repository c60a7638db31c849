//! The backtester's per-trade record and its forward bar-resolution state
//! machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::grader::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Pending,
    Tp1,
    Tp2,
    Tp3,
    Sl,
    None,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Pending => "PENDING",
            Resolution::Tp1 => "TP1",
            Resolution::Tp2 => "TP2",
            Resolution::Tp3 => "TP3",
            Resolution::Sl => "SL",
            Resolution::None => "NONE",
        }
    }

    pub fn r_multiple(&self) -> Option<f64> {
        match self {
            Resolution::Tp1 => Some(1.0),
            Resolution::Tp2 => Some(2.0),
            Resolution::Tp3 => Some(3.0),
            Resolution::Sl => Some(-1.0),
            Resolution::None | Resolution::Pending => None,
        }
    }

    pub fn is_win_any_tp(&self) -> bool {
        matches!(self, Resolution::Tp1 | Resolution::Tp2 | Resolution::Tp3)
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Resolution::Pending),
            "TP1" => Ok(Resolution::Tp1),
            "TP2" => Ok(Resolution::Tp2),
            "TP3" => Ok(Resolution::Tp3),
            "SL" => Ok(Resolution::Sl),
            "NONE" => Ok(Resolution::None),
            other => anyhow::bail!("unknown resolution: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub alert_id: i64,
    pub window_days: u32,
    pub strategy_version: String,
    pub created_ts: i64,
    pub exchange: String,
    pub symbol: String,
    pub signal: String,
    pub source_tf: String,
    pub grade: char,
    pub score: f64,
    pub liquidity_top200: bool,
    pub entry: f64,
    pub stop: f64,
    pub tps: Vec<f64>,
    pub resolved: Resolution,
    pub r_multiple: Option<f64>,
    pub mae_r: f64,
    pub mfe_r: f64,
    pub bars_to_resolve: Option<u32>,
    pub resolved_ts: Option<i64>,
}

/// One forward 15m bar's OHLC, as consumed by [`resolve_forward`].
#[derive(Debug, Clone, Copy)]
pub struct ForwardBar {
    pub open_time_ms: i64,
    pub high: f64,
    pub low: f64,
}

pub struct ResolutionOutcome {
    pub resolved: Resolution,
    pub r_multiple: Option<f64>,
    pub mae_r: f64,
    pub mfe_r: f64,
    pub bars_to_resolve: Option<u32>,
    pub resolved_ts: Option<i64>,
}

/// Simulates forward bars one at a time against `entry`/`stop`/`tps`
/// (ascending distance from entry). On each bar the stop check runs
/// strictly before the TP scan, so a bar whose range crosses both resolves
/// as SL — the documented worst-case tie-break.
pub fn resolve_forward(side: Side, entry: f64, stop: f64, tps: &[f64], bars: &[ForwardBar]) -> ResolutionOutcome {
    let risk = (entry - stop).abs();
    let mut mae_r = 0.0f64;
    let mut mfe_r = 0.0f64;

    if risk == 0.0 {
        return ResolutionOutcome {
            resolved: Resolution::None,
            r_multiple: None,
            mae_r,
            mfe_r,
            bars_to_resolve: None,
            resolved_ts: None,
        };
    }

    for (idx, bar) in bars.iter().enumerate() {
        let (adverse, favorable) = match side {
            Side::Buy => (entry - bar.low, bar.high - entry),
            Side::Sell => (bar.high - entry, entry - bar.low),
        };
        mae_r = mae_r.max(adverse / risk);
        mfe_r = mfe_r.max(favorable / risk);

        let stop_hit = match side {
            Side::Buy => bar.low <= stop,
            Side::Sell => bar.high >= stop,
        };
        if stop_hit {
            return ResolutionOutcome {
                resolved: Resolution::Sl,
                r_multiple: Some(-1.0),
                mae_r,
                mfe_r,
                bars_to_resolve: Some(idx as u32 + 1),
                resolved_ts: Some(bar.open_time_ms),
            };
        }

        for (j, &tp) in tps.iter().enumerate() {
            let tp_hit = match side {
                Side::Buy => bar.high >= tp,
                Side::Sell => bar.low <= tp,
            };
            if tp_hit {
                let resolved = match j {
                    0 => Resolution::Tp1,
                    1 => Resolution::Tp2,
                    _ => Resolution::Tp3,
                };
                return ResolutionOutcome {
                    resolved,
                    r_multiple: Some(j as f64 + 1.0),
                    mae_r,
                    mfe_r,
                    bars_to_resolve: Some(idx as u32 + 1),
                    resolved_ts: Some(bar.open_time_ms),
                };
            }
        }
    }

    ResolutionOutcome {
        resolved: Resolution::None,
        r_multiple: None,
        mae_r,
        mfe_r,
        bars_to_resolve: None,
        resolved_ts: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, high: f64, low: f64) -> ForwardBar {
        ForwardBar {
            open_time_ms: ts,
            high,
            low,
        }
    }

    #[test]
    fn resolves_tp1_at_expected_bar() {
        let bars = vec![bar(1_000, 101.0, 99.5), bar(2_000, 103.4, 99.0)];
        let outcome = resolve_forward(Side::Buy, 100.0, 98.0, &[103.0, 105.0, 108.0], &bars);
        assert_eq!(outcome.resolved, Resolution::Tp1);
        assert_eq!(outcome.r_multiple, Some(1.0));
        assert_eq!(outcome.bars_to_resolve, Some(2));
    }

    #[test]
    fn strictly_rising_sequence_on_buy_never_resolves_sl() {
        let bars: Vec<ForwardBar> = (0..20)
            .map(|i| bar(i * 1_000, 100.0 + i as f64 * 2.0, 100.0 + i as f64 * 2.0 - 0.1))
            .collect();
        let outcome = resolve_forward(Side::Buy, 100.0, 98.0, &[103.0, 105.0, 108.0], &bars);
        assert!(outcome.resolved.is_win_any_tp());
    }

    #[test]
    fn strictly_falling_sequence_on_buy_resolves_sl() {
        let bars: Vec<ForwardBar> = (0..20)
            .map(|i| bar(i * 1_000, 100.0 - i as f64 * 2.0, 100.0 - i as f64 * 2.0 - 0.1))
            .collect();
        let outcome = resolve_forward(Side::Buy, 100.0, 98.0, &[103.0, 105.0, 108.0], &bars);
        assert_eq!(outcome.resolved, Resolution::Sl);
    }

    #[test]
    fn bar_crossing_both_stop_and_tp_resolves_as_sl() {
        let bars = vec![bar(1_000, 110.0, 90.0)];
        let outcome = resolve_forward(Side::Buy, 100.0, 98.0, &[103.0, 105.0, 108.0], &bars);
        assert_eq!(outcome.resolved, Resolution::Sl);
    }

    #[test]
    fn no_touch_within_horizon_resolves_none() {
        let bars = vec![bar(1_000, 100.5, 99.5); 5];
        let outcome = resolve_forward(Side::Buy, 100.0, 98.0, &[103.0, 105.0, 108.0], &bars);
        assert_eq!(outcome.resolved, Resolution::None);
        assert!(outcome.r_multiple.is_none());
    }
}

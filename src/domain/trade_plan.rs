//! Pure trade-plan construction from a fresh signal, entry price, ATR, and
//! the 15m swing window.

use serde::{Deserialize, Serialize};

use super::grader::Side;

const DEFAULT_ATR_MULT: f64 = 2.5;
const DEFAULT_TP_R_MULTS: [f64; 3] = [1.5, 2.5, 4.0];
const SWING_ATR_MULT: f64 = 2.0;
const SWING_TP_R_MULT: f64 = 1.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub id: Option<i64>,
    pub alert_id: i64,
    pub event_ts: i64,
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub entry_type: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
    pub atr: f64,
    pub atr_mult: f64,
    pub swing_ref: f64,
    pub risk_per_unit: f64,
    pub rr_tp1: Option<f64>,
    pub rr_tp2: Option<f64>,
    pub rr_tp3: Option<f64>,
    pub plan_json: String,
}

/// Construction inputs for one plan, recorded verbatim into `plan_json` so
/// a later re-derivation (e.g. during backtesting) can cross-check against
/// what was actually persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanAudit {
    version: &'static str,
    swing_lookback_15m: u32,
    atr_mult: f64,
    tp_r_mults: Vec<f64>,
    swing_high: Option<f64>,
    swing_low: Option<f64>,
    atr_guardrail_stop: f64,
}

const PLAN_VERSION: &str = "1.0.0";

/// Builds a standard (non-swing) trade plan. `side` other than BUY/SELL is
/// a programmer error ported from the original `build_trade_plan`'s
/// `raise ValueError`: this is the one place in the core that panics on a
/// contract violation instead of handling it gracefully.
pub fn build_trade_plan(
    alert_id: i64,
    event_ts: i64,
    exchange: &str,
    symbol: &str,
    side: Side,
    entry: f64,
    atr: f64,
    swing_high_15m: Option<f64>,
    swing_low_15m: Option<f64>,
    swing_lookback_15m: u32,
) -> TradePlan {
    let atr_guardrail_stop = match side {
        Side::Buy => entry - DEFAULT_ATR_MULT * atr,
        Side::Sell => entry + DEFAULT_ATR_MULT * atr,
    };

    let stop_loss = match side {
        Side::Buy => match swing_low_15m {
            Some(sl) => sl.min(atr_guardrail_stop),
            None => atr_guardrail_stop,
        },
        Side::Sell => match swing_high_15m {
            Some(sh) => sh.max(atr_guardrail_stop),
            None => atr_guardrail_stop,
        },
    };

    let risk = (entry - stop_loss).abs();
    let sign = match side {
        Side::Buy => 1.0,
        Side::Sell => -1.0,
    };

    let (tp1, tp2, tp3) = if risk == 0.0 {
        (None, None, None)
    } else {
        (
            Some(entry + sign * DEFAULT_TP_R_MULTS[0] * risk),
            Some(entry + sign * DEFAULT_TP_R_MULTS[1] * risk),
            Some(entry + sign * DEFAULT_TP_R_MULTS[2] * risk),
        )
    };

    let swing_ref = match side {
        Side::Buy => swing_low_15m.unwrap_or(atr_guardrail_stop),
        Side::Sell => swing_high_15m.unwrap_or(atr_guardrail_stop),
    };

    let audit = PlanAudit {
        version: PLAN_VERSION,
        swing_lookback_15m,
        atr_mult: DEFAULT_ATR_MULT,
        tp_r_mults: DEFAULT_TP_R_MULTS.to_vec(),
        swing_high: swing_high_15m,
        swing_low: swing_low_15m,
        atr_guardrail_stop,
    };

    TradePlan {
        id: None,
        alert_id,
        event_ts,
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        side: side_label(side).to_string(),
        entry_type: "market".to_string(),
        entry_price: entry,
        stop_loss,
        tp1,
        tp2,
        tp3,
        atr,
        atr_mult: DEFAULT_ATR_MULT,
        swing_ref,
        risk_per_unit: risk,
        rr_tp1: tp1.map(|_| DEFAULT_TP_R_MULTS[0]),
        rr_tp2: tp2.map(|_| DEFAULT_TP_R_MULTS[1]),
        rr_tp3: tp3.map(|_| DEFAULT_TP_R_MULTS[2]),
        plan_json: serde_json::to_string(&audit).unwrap_or_default(),
    }
}

/// The swing-pullback 4h long: single TP at R=1.25, ATR_MULT=2.0, using
/// the 4h swing low instead of the 15m one. BUY-only by construction —
/// the original source never pairs this variant with a SELL signal.
pub fn build_swing_trade_plan(
    alert_id: i64,
    event_ts: i64,
    exchange: &str,
    symbol: &str,
    entry: f64,
    atr: f64,
    swing_low_4h: Option<f64>,
) -> TradePlan {
    let atr_guardrail_stop = entry - SWING_ATR_MULT * atr;
    let stop_loss = match swing_low_4h {
        Some(sl) => sl.min(atr_guardrail_stop),
        None => atr_guardrail_stop,
    };
    let risk = (entry - stop_loss).abs();
    let tp1 = if risk == 0.0 { None } else { Some(entry + SWING_TP_R_MULT * risk) };

    let audit = PlanAudit {
        version: PLAN_VERSION,
        swing_lookback_15m: 0,
        atr_mult: SWING_ATR_MULT,
        tp_r_mults: vec![SWING_TP_R_MULT],
        swing_high: None,
        swing_low: swing_low_4h,
        atr_guardrail_stop,
    };

    TradePlan {
        id: None,
        alert_id,
        event_ts,
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        side: "BUY".to_string(),
        entry_type: "market".to_string(),
        entry_price: entry,
        stop_loss,
        tp1,
        tp2: None,
        tp3: None,
        atr,
        atr_mult: SWING_ATR_MULT,
        swing_ref: swing_low_4h.unwrap_or(atr_guardrail_stop),
        risk_per_unit: risk,
        rr_tp1: tp1.map(|_| SWING_TP_R_MULT),
        rr_tp2: None,
        rr_tp3: None,
        plan_json: serde_json::to_string(&audit).unwrap_or_default(),
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_plan_respects_ordering_invariant() {
        let plan = build_trade_plan(1, 1_000, "binance", "BTCUSDT", Side::Buy, 100.0, 2.0, Some(95.0), Some(97.0), 20);
        assert!(plan.stop_loss < plan.entry_price);
        assert!(plan.entry_price <= plan.tp1.unwrap());
        assert!(plan.tp1.unwrap() <= plan.tp2.unwrap());
        assert!(plan.tp2.unwrap() <= plan.tp3.unwrap());
        assert!((plan.risk_per_unit - (plan.entry_price - plan.stop_loss).abs()).abs() < 1e-9);
    }

    #[test]
    fn sell_plan_respects_mirrored_ordering_invariant() {
        let plan = build_trade_plan(1, 1_000, "binance", "BTCUSDT", Side::Sell, 100.0, 2.0, Some(103.0), Some(101.0), 20);
        assert!(plan.stop_loss > plan.entry_price);
        assert!(plan.entry_price >= plan.tp1.unwrap());
        assert!(plan.tp1.unwrap() >= plan.tp2.unwrap());
        assert!(plan.tp2.unwrap() >= plan.tp3.unwrap());
    }

    #[test]
    fn buy_stop_prefers_tighter_of_swing_and_atr_guardrail() {
        // swing low (99.0) is tighter than the ATR guardrail (100 - 2.5*2=95)
        let plan = build_trade_plan(1, 1_000, "binance", "BTCUSDT", Side::Buy, 100.0, 2.0, None, Some(99.0), 20);
        assert_eq!(plan.stop_loss, 95.0, "ATR guardrail is more conservative (lower) here");
    }

    #[test]
    fn tp1_is_entry_plus_one_point_five_risk_for_buy() {
        let plan = build_trade_plan(1, 1_000, "binance", "BTCUSDT", Side::Buy, 100.0, 1.0, None, None, 20);
        // no swing data -> stop = atr guardrail = 100 - 2.5 = 97.5, risk=2.5
        let expected_tp1 = 100.0 + 1.5 * 2.5;
        assert!((plan.tp1.unwrap() - expected_tp1).abs() < 1e-9);
    }

    #[test]
    fn swing_plan_has_single_tp() {
        let plan = build_swing_trade_plan(1, 1_000, "binance", "BTCUSDT", 100.0, 1.0, Some(97.0));
        assert!(plan.tp1.is_some());
        assert!(plan.tp2.is_none() && plan.tp3.is_none());
    }
}

//! The persisted record of a fired signal.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
        }
    }
}

impl FromStr for Signal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Signal::Buy),
            "SELL" => Ok(Signal::Sell),
            other => anyhow::bail!("unknown signal: {other}"),
        }
    }
}

/// Uniqueness key: (exchange, symbol, signal, event_ts) — idempotent on
/// replay, matching `upsertCandle`'s insert-or-ignore semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub event_ts: i64,
    pub created_ts: i64,
    pub exchange: String,
    pub symbol: String,
    pub signal: Signal,
    pub source_tf: String,
    pub price: f64,
    pub reason: String,
    pub setup_score: f64,
    pub setup_grade: char,
    pub avoid_reasons: Vec<String>,
    pub metrics_json: String,
}

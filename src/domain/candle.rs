use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Candle resolution. The core only ever resamples 1m into 15m and 4h;
/// any other interval string (e.g. an exchange's native "5m") is rejected
/// by `FromStr` rather than silently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    OneMin,
    FifteenMin,
    FourHour,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMin => "1m",
            Interval::FifteenMin => "15m",
            Interval::FourHour => "4h",
        }
    }

    pub fn millis(&self) -> i64 {
        match self {
            Interval::OneMin => 60_000,
            Interval::FifteenMin => 15 * 60_000,
            Interval::FourHour => 4 * 60 * 60_000,
        }
    }

    /// Start of the bucket that `open_time_ms` belongs to, aligned to the
    /// epoch (matches the reference resampler's `open_time - open_time % interval_ms`).
    pub fn bucket_start(&self, open_time_ms: i64) -> i64 {
        let m = self.millis();
        open_time_ms - open_time_ms.rem_euclid(m)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::OneMin),
            "15m" => Ok(Interval::FifteenMin),
            "4h" => Ok(Interval::FourHour),
            other => anyhow::bail!("unsupported interval: {other}"),
        }
    }
}

/// OHLCV candle. Uniqueness key: (exchange, symbol, interval, open_time_ms).
///
/// Stored as plain `f64` rather than a fixed-point decimal: the screener
/// never places an order against these prices, it only feeds them to
/// floating-point indicator math and a `REAL`-column sqlite table, so
/// there's no exactness boundary to protect here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

impl Candle {
    /// `h ≥ max(o,c) ≥ min(o,c) ≥ l` and `close_time > open_time`.
    pub fn is_valid(&self) -> bool {
        self.close_time_ms > self.open_time_ms
            && self.high >= self.open.max(self.close)
            && self.open.min(self.close) >= self.low
    }
}

/// Bounded FIFO of fixed maxlen. Not thread-safe; only ever touched from
/// the owning `SymbolState`'s single-writer update path.
#[derive(Debug, Clone)]
pub struct RollingSeries {
    maxlen: usize,
    values: VecDeque<f64>,
}

impl RollingSeries {
    pub fn new(maxlen: usize) -> Self {
        Self {
            maxlen: maxlen.max(1),
            values: VecDeque::with_capacity(maxlen.max(1)),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.maxlen {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Value `n` back from the end; `nth_from_end(1)` is the last value.
    pub fn nth_from_end(&self, n: usize) -> Option<f64> {
        if n == 0 || n > self.values.len() {
            return None;
        }
        self.values.get(self.values.len() - n).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_series_evicts_oldest_on_overflow() {
        let mut s = RollingSeries::new(3);
        s.push(1.0);
        s.push(2.0);
        s.push(3.0);
        s.push(4.0);
        assert_eq!(s.as_slice(), vec![2.0, 3.0, 4.0]);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn interval_bucket_start_aligns_to_epoch() {
        // 15m buckets: 17:07 falls into the 17:00 bucket.
        let ts = 1_700_000_000_000i64 + 7 * 60_000;
        let bucket = Interval::FifteenMin.bucket_start(1_700_000_000_000i64 - (1_700_000_000_000i64 % (15 * 60_000)) + 7 * 60_000);
        assert_eq!(bucket % (15 * 60_000), 0);
        let _ = ts;
    }

    #[test]
    fn interval_from_str_rejects_unknown() {
        assert!(Interval::from_str("5m").is_err());
        assert_eq!(Interval::from_str("15m").unwrap(), Interval::FifteenMin);
    }
}

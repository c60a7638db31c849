//! Flat configuration surface, read once at process start from environment
//! variables (see `.env` via `dotenvy`). Every option documented here is
//! the only way to influence runtime behavior — no hidden defaults live
//! outside this module.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// The three liquidity-cohort feature weights; must sum to ~1.0 but are
/// not renormalized — a misconfigured sum is a deliberate operator choice,
/// not a bug this layer corrects.
#[derive(Debug, Clone, Copy)]
pub struct LiquidityWeights {
    pub turnover: f64,
    pub open_interest: f64,
    pub activity: f64,
}

#[derive(Debug, Clone)]
pub struct TradePlanConfig {
    pub enabled: bool,
    pub atr_mult: f64,
    pub swing_lookback_15m: u32,
    pub tp_r_mults: [f64; 3],
}

#[derive(Debug, Clone)]
pub struct VolDueConfig {
    pub bb_width_15m: f64,
    pub bb_width_4h: f64,
    pub atr_pct_15m: f64,
    pub atr_pct_4h: f64,
    pub lookback_bars: usize,
    pub percentile: f64,
}

#[derive(Debug, Clone)]
pub struct FullRefreshConfig {
    pub enabled: bool,
    pub offset_sec: u64,
    pub backfill_limit: u32,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    // Universe & windows
    pub top_symbols: usize,
    pub window_short: usize,
    pub window_medium: usize,
    pub atr_period: usize,
    pub vol_lookback: usize,
    pub include_symbols: Vec<String>,
    pub exclude_symbols: Vec<String>,

    // Emission cadence
    pub snapshot_interval_ms: u64,
    pub ws_heartbeat_sec: u64,
    pub ws_ping_interval_sec: u64,

    // Cipher B
    pub cipherb_os_level: f64,
    pub cipherb_ob_level: f64,

    // Liquidity cohort
    pub liq_top_n: usize,
    pub liq_weights: LiquidityWeights,

    // Trade plan
    pub trade_plan: TradePlanConfig,

    // Volatility-due / squeeze
    pub vol_due: VolDueConfig,

    // Stream supervisor
    pub full_refresh: FullRefreshConfig,
    pub stale_ticker_ms: u64,
    pub stale_kline_ms: u64,

    // Alerting
    pub alert_cooldown_top200_sec: u64,
    pub alert_cooldown_other_sec: u64,
    pub alert_min_grade: char,

    // Backtester / analysis scheduler
    pub analysis_autorun_interval_min: u64,
    pub analysis_autorun_windows_days: Vec<u32>,

    // Ambient: storage
    pub database_url: String,

    // Ambient: exchanges
    pub exchanges: Vec<String>,
    pub binance_futures_ws: String,
    pub binance_futures_rest: String,
    pub bybit_rest: String,

    // Ambient: misc
    pub market_cap_cache_ttl_ms: u64,
    pub subscriber_queue_capacity: usize,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let liq_weights_raw = env_or("LIQ_WEIGHTS", "0.6,0.3,0.1");
        let liq_weights = parse_liq_weights(&liq_weights_raw).context("invalid LIQ_WEIGHTS")?;

        let tp_r_mults_raw = env_or("TRADEPLAN_TP_R_MULTS", "1.5,2.5,4.0");
        let tp_r_mults = parse_tp_r_mults(&tp_r_mults_raw).context("invalid TRADEPLAN_TP_R_MULTS")?;

        let alert_min_grade_raw = env_or("ALERT_MIN_GRADE", "B");
        let alert_min_grade = alert_min_grade_raw
            .chars()
            .next()
            .filter(|c| matches!(c, 'A' | 'B' | 'C'))
            .ok_or_else(|| anyhow::anyhow!("ALERT_MIN_GRADE must be one of A, B, C"))?;

        let analysis_autorun_windows_days = parse_u32_csv(&env_or("ANALYSIS_AUTORUN_WINDOWS_DAYS", "7,30"))
            .context("invalid ANALYSIS_AUTORUN_WINDOWS_DAYS")?;

        let database_url = match env::var("DATABASE_URL") {
            Ok(v) => v,
            Err(_) => env_or("OHLC_DB_PATH", "sqlite://ohlc.sqlite3"),
        };

        Ok(Self {
            top_symbols: env_parse_or("TOP_SYMBOLS", 150usize)?,
            window_short: env_parse_or("WINDOW_SHORT", 5usize)?,
            window_medium: env_parse_or("WINDOW_MEDIUM", 15usize)?,
            atr_period: env_parse_or("ATR_PERIOD", 14usize)?,
            vol_lookback: env_parse_or("VOL_LOOKBACK", 30usize)?,
            include_symbols: env_csv("INCLUDE_SYMBOLS", &[]),
            exclude_symbols: env_csv("EXCLUDE_SYMBOLS", &[]),

            snapshot_interval_ms: env_parse_or("SNAPSHOT_INTERVAL_MS", 30_000u64)?,
            ws_heartbeat_sec: env_parse_or("WS_HEARTBEAT_SEC", 15u64)?,
            ws_ping_interval_sec: env_parse_or("WS_PING_INTERVAL", 15u64)?,

            cipherb_os_level: env_parse_or("CIPHERB_OS_LEVEL", -40.0f64)?,
            cipherb_ob_level: env_parse_or("CIPHERB_OB_LEVEL", 40.0f64)?,

            liq_top_n: env_parse_or("LIQ_TOP_N", 200usize)?,
            liq_weights,

            trade_plan: TradePlanConfig {
                enabled: env_parse_or("TRADEPLAN_ENABLE", true)?,
                atr_mult: env_parse_or("TRADEPLAN_ATR_MULT", 2.5f64)?,
                swing_lookback_15m: env_parse_or("TRADEPLAN_SWING_LOOKBACK_15M", 20u32)?,
                tp_r_mults,
            },

            vol_due: VolDueConfig {
                bb_width_15m: env_parse_or("VOLDUE_BB_WIDTH_15M", 0.03f64)?,
                bb_width_4h: env_parse_or("VOLDUE_BB_WIDTH_4H", 0.05f64)?,
                atr_pct_15m: env_parse_or("VOLDUE_ATR_PCT_15M", 0.015f64)?,
                atr_pct_4h: env_parse_or("VOLDUE_ATR_PCT_4H", 0.02f64)?,
                lookback_bars: env_parse_or("VOLDUE_LOOKBACK_BARS", 96usize)?,
                percentile: env_parse_or("VOLDUE_PERCENTILE", 20.0f64)?,
            },

            full_refresh: FullRefreshConfig {
                enabled: env_parse_or("ENABLE_FULL_REFRESH_5M", false)?,
                offset_sec: env_parse_or("FULL_REFRESH_OFFSET_SEC", 2u64)?,
                backfill_limit: env_parse_or("FULL_REFRESH_BACKFILL_LIMIT", 200u32)?,
            },
            stale_ticker_ms: env_parse_or("STALE_TICKER_MS", 60_000u64)?,
            stale_kline_ms: env_parse_or("STALE_KLINE_MS", 60_000u64)?,

            alert_cooldown_top200_sec: env_parse_or("ALERT_COOLDOWN_TOP200_SEC", 120u64)?,
            alert_cooldown_other_sec: env_parse_or("ALERT_COOLDOWN_OTHER_SEC", 300u64)?,
            alert_min_grade,

            analysis_autorun_interval_min: env_parse_or("ANALYSIS_AUTORUN_INTERVAL_MIN", 60u64)?,
            analysis_autorun_windows_days,

            database_url,

            exchanges: env_csv("EXCHANGES", &["binance", "bybit"]),
            binance_futures_ws: env_or("BINANCE_FUTURES_WS", "wss://fstream.binance.com"),
            binance_futures_rest: env_or("BINANCE_FUTURES_REST", "https://fapi.binance.com"),
            bybit_rest: env_or("BYBIT_REST", "https://api.bybit.com"),

            market_cap_cache_ttl_ms: env_parse_or("MARKET_CAP_CACHE_TTL_MS", 6 * 60 * 60 * 1000u64)?,
            subscriber_queue_capacity: env_parse_or("SUBSCRIBER_QUEUE_CAPACITY", 100usize)?,
        })
    }
}

fn parse_liq_weights(raw: &str) -> Result<LiquidityWeights> {
    let parts: Vec<&str> = raw.split(',').collect();
    anyhow::ensure!(parts.len() == 3, "expected 3 comma-separated weights, got {}", parts.len());
    Ok(LiquidityWeights {
        turnover: parts[0].trim().parse()?,
        open_interest: parts[1].trim().parse()?,
        activity: parts[2].trim().parse()?,
    })
}

fn parse_tp_r_mults(raw: &str) -> Result<[f64; 3]> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()?;
    anyhow::ensure!(parts.len() == 3, "expected 3 comma-separated R-multiples, got {}", parts.len());
    Ok([parts[0], parts[1], parts[2]])
}

fn parse_u32_csv(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(|s| s.trim().parse::<u32>().map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liq_weights_parses_three_floats() {
        let w = parse_liq_weights("0.6,0.3,0.1").unwrap();
        assert_eq!(w.turnover, 0.6);
        assert_eq!(w.activity, 0.1);
    }

    #[test]
    fn liq_weights_rejects_wrong_arity() {
        assert!(parse_liq_weights("0.6,0.4").is_err());
    }

    #[test]
    fn tp_r_mults_parses_three_floats() {
        let mults = parse_tp_r_mults("1.5,2.5,4.0").unwrap();
        assert_eq!(mults, [1.5, 2.5, 4.0]);
    }

    #[test]
    fn windows_days_parses_u32_list() {
        assert_eq!(parse_u32_csv("7,30").unwrap(), vec![7, 30]);
    }
}

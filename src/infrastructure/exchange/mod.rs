//! Per-exchange adapter boundary: the supervisor's reconnect/watchdog/
//! backfill machinery is written once against this trait and reused
//! across every configured exchange.

pub mod binance;
pub mod bybit;
pub mod stub;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::candle::{Candle, Interval};
use crate::domain::errors::ScreenerError;

/// One normalized mini-ticker update.
#[derive(Debug, Clone, Copy)]
pub struct TickerUpdate {
    pub ts_ms: i64,
    pub price: f64,
}

/// A small adapter trait exposing the universe and the ingestion/backfill
/// surface the `StreamSupervisor` needs. A configured-but-unsupported
/// exchange name resolves to [`stub::StubAdapter`], which reports zero
/// symbols and never streams, rather than failing startup.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves the tradable perpetual universe: quoteAsset=USDT,
    /// contractType=PERPETUAL, status=TRADING, ranked by 24h quoteVolume
    /// and truncated to `top_n`, with include/exclude applied.
    async fn symbols(
        &self,
        top_n: usize,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<String>, ScreenerError>;

    /// Streams closed-and-intrabar 1m klines for `symbols` onto `tx` until
    /// cancelled or the connection drops. Returns on any terminal error so
    /// the supervisor's reconnect loop can apply backoff.
    async fn stream_1m_klines(&self, symbols: Vec<String>, tx: mpsc::Sender<(String, Candle)>) -> Result<(), ScreenerError>;

    /// Streams mini-ticker price updates for `symbols` onto `tx`.
    async fn stream_minitickers(&self, symbols: Vec<String>, tx: mpsc::Sender<(String, TickerUpdate)>) -> Result<(), ScreenerError>;

    /// Backfills up to `limit` candles at `interval` for `symbol`.
    async fn backfill_klines(&self, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>, ScreenerError>;

    /// Polls current open interest for `symbol`.
    async fn open_interest(&self, symbol: &str) -> Result<f64, ScreenerError>;
}

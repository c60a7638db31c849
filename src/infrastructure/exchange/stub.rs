//! The stub adapter: stands in for a configured-but-unsupported exchange
//! name so startup never fails on a typo or an exchange not yet wired up.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ExchangeAdapter, TickerUpdate};
use crate::domain::candle::{Candle, Interval};
use crate::domain::errors::ScreenerError;

pub struct StubAdapter {
    name: &'static str,
}

impl StubAdapter {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl ExchangeAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn symbols(&self, _top_n: usize, _include: &[String], _exclude: &[String]) -> Result<Vec<String>, ScreenerError> {
        Ok(Vec::new())
    }

    async fn stream_1m_klines(&self, _symbols: Vec<String>, _tx: mpsc::Sender<(String, Candle)>) -> Result<(), ScreenerError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn stream_minitickers(&self, _symbols: Vec<String>, _tx: mpsc::Sender<(String, TickerUpdate)>) -> Result<(), ScreenerError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn backfill_klines(&self, _symbol: &str, _interval: Interval, _limit: u32) -> Result<Vec<Candle>, ScreenerError> {
        Ok(Vec::new())
    }

    async fn open_interest(&self, _symbol: &str) -> Result<f64, ScreenerError> {
        Ok(0.0)
    }
}

//! Binance USDT-M perpetual futures adapter. REST calls go through a
//! retry-middleware client (exponential backoff, matching the teacher's
//! `HttpClientFactory`); the kline/miniTicker stream reconnects with the
//! same backoff policy the `StreamSupervisor` expects from every adapter.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;

use super::{ExchangeAdapter, TickerUpdate};
use crate::domain::candle::{Candle, Interval};
use crate::domain::errors::ScreenerError;

const REST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct BinanceAdapter {
    client: ClientWithMiddleware,
    rest_base: String,
    ws_base: String,
}

impl BinanceAdapter {
    pub fn new(rest_base: impl Into<String>, ws_base: impl Into<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .timeout(REST_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

        Self {
            client,
            rest_base: rest_base.into(),
            ws_base: ws_base.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "contractType")]
    contract_type: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn symbols(&self, top_n: usize, include: &[String], exclude: &[String]) -> Result<Vec<String>, ScreenerError> {
        let info_url = format!("{}/fapi/v1/exchangeInfo", self.rest_base);
        let info: ExchangeInfoResponse = self.client.get(&info_url).send().await?.json().await?;

        let tradable: std::collections::HashSet<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.quote_asset == "USDT" && s.contract_type == "PERPETUAL" && s.status == "TRADING")
            .map(|s| s.symbol)
            .collect();

        let ticker_url = format!("{}/fapi/v1/ticker/24hr", self.rest_base);
        let tickers: Vec<Ticker24h> = self.client.get(&ticker_url).send().await?.json().await?;

        let exclude_upper: std::collections::HashSet<String> = exclude.iter().map(|s| s.to_uppercase()).collect();
        let include_upper: std::collections::HashSet<String> = include.iter().map(|s| s.to_uppercase()).collect();

        let mut ranked: Vec<(String, f64)> = tickers
            .into_iter()
            .filter(|t| tradable.contains(&t.symbol))
            .filter(|t| !exclude_upper.contains(&t.symbol))
            .map(|t| {
                let vol = t.quote_volume.parse::<f64>().unwrap_or(0.0);
                (t.symbol, vol)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut symbols: Vec<String> = ranked.into_iter().map(|(s, _)| s).take(top_n).collect();
        for forced in include_upper {
            if !symbols.contains(&forced) && tradable.contains(&forced) {
                symbols.push(forced);
            }
        }
        Ok(symbols)
    }

    async fn stream_1m_klines(&self, symbols: Vec<String>, tx: mpsc::Sender<(String, Candle)>) -> Result<(), ScreenerError> {
        if symbols.is_empty() {
            std::future::pending::<()>().await;
            return Ok(());
        }
        let streams: Vec<String> = symbols.iter().map(|s| format!("{}@kline_1m", s.to_lowercase())).collect();
        let url = format!("{}/stream?streams={}", self.ws_base.trim_end_matches('/'), streams.join("/"));
        let (ws_stream, _) = connect_async(&url).await?;
        let (_write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            let msg = msg?;
            let Ok(text) = msg.into_text() else { continue };
            if let Some((symbol, candle)) = parse_kline_message(&text) {
                if tx.send((symbol, candle)).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn stream_minitickers(&self, symbols: Vec<String>, tx: mpsc::Sender<(String, TickerUpdate)>) -> Result<(), ScreenerError> {
        if symbols.is_empty() {
            std::future::pending::<()>().await;
            return Ok(());
        }
        let streams: Vec<String> = symbols.iter().map(|s| format!("{}@miniTicker", s.to_lowercase())).collect();
        let url = format!("{}/stream?streams={}", self.ws_base.trim_end_matches('/'), streams.join("/"));
        let (ws_stream, _) = connect_async(&url).await?;
        let (_write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            let msg = msg?;
            let Ok(text) = msg.into_text() else { continue };
            if let Some((symbol, ticker)) = parse_miniticker_message(&text) {
                if tx.send((symbol, ticker)).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn backfill_klines(&self, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>, ScreenerError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.rest_base,
            symbol,
            interval.as_str(),
            limit
        );
        let rows: Vec<serde_json::Value> = self.client.get(&url).send().await?.json().await?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(candle) = parse_kline_row(&row) {
                candles.push(candle);
            }
        }
        Ok(candles)
    }

    async fn open_interest(&self, symbol: &str) -> Result<f64, ScreenerError> {
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.rest_base, symbol);
        #[derive(Deserialize)]
        struct OiResponse {
            #[serde(rename = "openInterest")]
            open_interest: String,
        }
        let resp: OiResponse = self.client.get(&url).send().await?.json().await?;
        resp.open_interest
            .parse::<f64>()
            .map_err(|e| ScreenerError::MalformedPayload(format!("bad openInterest for {symbol}: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct CombinedStreamEnvelope {
    stream: String,
    data: serde_json::Value,
}

fn parse_kline_message(text: &str) -> Option<(String, Candle)> {
    let envelope: CombinedStreamEnvelope = serde_json::from_str(text).ok()?;
    if !envelope.stream.contains("@kline_1m") {
        return None;
    }
    let event = envelope.data.get("e")?.as_str()?;
    if event != "kline" {
        return None;
    }
    let k = envelope.data.get("k")?;
    let candle = parse_kline_row(k)?;
    let symbol = k.get("s")?.as_str()?.to_string();
    Some((symbol, candle))
}

fn parse_kline_row(value: &serde_json::Value) -> Option<Candle> {
    // Stream payload uses named fields {t,T,o,h,l,c,q,x}; REST backfill
    // rows are positional arrays. Handle both shapes.
    if let Some(arr) = value.as_array() {
        let open_time_ms = arr.first()?.as_i64()?;
        let open = arr.get(1)?.as_str()?.parse().ok()?;
        let high = arr.get(2)?.as_str()?.parse().ok()?;
        let low = arr.get(3)?.as_str()?.parse().ok()?;
        let close = arr.get(4)?.as_str()?.parse().ok()?;
        let volume = arr.get(7)?.as_str()?.parse().ok()?; // quote asset volume
        let close_time_ms = arr.get(6)?.as_i64()?;
        return Some(Candle {
            open_time_ms,
            close_time_ms,
            open,
            high,
            low,
            close,
            volume,
            closed: true,
        });
    }

    let open_time_ms = value.get("t")?.as_i64()?;
    let close_time_ms = value.get("T")?.as_i64()?;
    let open: f64 = value.get("o")?.as_str()?.parse().ok()?;
    let high: f64 = value.get("h")?.as_str()?.parse().ok()?;
    let low: f64 = value.get("l")?.as_str()?.parse().ok()?;
    let close: f64 = value.get("c")?.as_str()?.parse().ok()?;
    let volume: f64 = value.get("q")?.as_str()?.parse().ok()?;
    let closed = value.get("x")?.as_bool()?;
    Some(Candle {
        open_time_ms,
        close_time_ms,
        open,
        high,
        low,
        close,
        volume,
        closed,
    })
}

fn parse_miniticker_message(text: &str) -> Option<(String, TickerUpdate)> {
    let envelope: CombinedStreamEnvelope = serde_json::from_str(text).ok()?;
    if !envelope.stream.contains("@miniTicker") {
        return None;
    }
    let data = &envelope.data;
    if data.get("e")?.as_str()? != "24hrMiniTicker" {
        return None;
    }
    let symbol = data.get("s")?.as_str()?.to_string();
    let price: f64 = data.get("c")?.as_str()?.parse().ok()?;
    let ts_ms = data.get("E")?.as_i64()?;
    Some((symbol, TickerUpdate { ts_ms, price }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_kline_envelope() {
        let text = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"t":1000,"T":60999,"o":"1.0","h":"2.0","l":"0.5","c":"1.5","q":"10.0","s":"BTCUSDT","x":true}}}"#;
        let (symbol, candle) = parse_kline_message(text).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert!(candle.closed);
        assert_eq!(candle.close, 1.5);
    }

    #[test]
    fn parses_rest_kline_row_array() {
        let row = serde_json::json!([1000i64, "1.0", "2.0", "0.5", "1.5", "ignored", 60999i64, "10.0"]);
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.open_time_ms, 1000);
        assert_eq!(candle.volume, 10.0);
    }

    #[test]
    fn parses_miniticker_envelope() {
        let text = r#"{"stream":"btcusdt@miniTicker","data":{"e":"24hrMiniTicker","s":"BTCUSDT","c":"123.45","E":1700000000000}}"#;
        let (symbol, ticker) = parse_miniticker_message(text).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(ticker.price, 123.45);
    }

    #[test]
    fn non_kline_stream_is_ignored() {
        let text = r#"{"stream":"btcusdt@miniTicker","data":{"e":"24hrMiniTicker","s":"BTCUSDT","c":"1","E":1}}"#;
        assert!(parse_kline_message(text).is_none());
    }
}

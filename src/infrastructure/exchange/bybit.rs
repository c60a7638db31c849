//! Bybit USDT/USDC linear-perpetual adapter. Mirrors [`super::binance`]'s
//! shape (retry-middleware REST client, reconnect-by-returning WS loop) but
//! against Bybit's v5 market endpoints and single-stream WS topic model
//! instead of Binance's combined-stream URL.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{ExchangeAdapter, TickerUpdate};
use crate::domain::candle::{Candle, Interval};
use crate::domain::errors::ScreenerError;

const REST_TIMEOUT: Duration = Duration::from_secs(20);
const BYBIT_WS_LINEAR: &str = "wss://stream.bybit.com/v5/public/linear";
// Bybit batches subscribe args to stay under its WS frame-size limit.
const SUBSCRIBE_BATCH: usize = 50;

pub struct BybitAdapter {
    client: ClientWithMiddleware,
    rest_base: String,
}

impl BybitAdapter {
    pub fn new(rest_base: impl Into<String>) -> Self {
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
        }
    }

    fn interval_code(interval: Interval) -> &'static str {
        match interval {
            Interval::OneMin => "1",
            Interval::FifteenMin => "15",
            Interval::FourHour => "240",
        }
    }
}

#[derive(Debug, Deserialize)]
struct V5Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize, Default)]
struct InstrumentsResult {
    list: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    symbol: String,
    status: String,
    #[serde(rename = "contractType")]
    contract_type: String,
}

#[derive(Debug, Deserialize, Default)]
struct TickersResult {
    list: Vec<TickerInfo>,
}

#[derive(Debug, Deserialize)]
struct TickerInfo {
    symbol: String,
    turnover24h: String,
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        "bybit"
    }

    async fn symbols(&self, top_n: usize, include: &[String], exclude: &[String]) -> Result<Vec<String>, ScreenerError> {
        let instruments_url = format!("{}/v5/market/instruments-info?category=linear", self.rest_base);
        let instruments: V5Envelope<InstrumentsResult> = self.client.get(&instruments_url).send().await?.json().await?;

        let tradable: std::collections::HashSet<String> = instruments
            .result
            .list
            .into_iter()
            .filter(|i| i.status == "Trading" && i.contract_type == "LinearPerpetual")
            .map(|i| i.symbol)
            .collect();

        let tickers_url = format!("{}/v5/market/tickers?category=linear", self.rest_base);
        let tickers: V5Envelope<TickersResult> = self.client.get(&tickers_url).send().await?.json().await?;

        let exclude_upper: std::collections::HashSet<String> = exclude.iter().map(|s| s.to_uppercase()).collect();
        let include_upper: std::collections::HashSet<String> = include.iter().map(|s| s.to_uppercase()).collect();

        let mut ranked: Vec<(String, f64)> = tickers
            .result
            .list
            .into_iter()
            .filter(|t| tradable.contains(&t.symbol))
            .filter(|t| !exclude_upper.contains(&t.symbol))
            .map(|t| {
                let vol = t.turnover24h.parse::<f64>().unwrap_or(0.0);
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
        let args: Vec<String> = symbols.iter().map(|s| format!("kline.1.{s}")).collect();
        let (ws_stream, _) = connect_async(BYBIT_WS_LINEAR).await?;
        let (mut write, mut read) = ws_stream.split();
        subscribe_in_batches(&mut write, &args).await?;

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
        let args: Vec<String> = symbols.iter().map(|s| format!("tickers.{s}")).collect();
        let (ws_stream, _) = connect_async(BYBIT_WS_LINEAR).await?;
        let (mut write, mut read) = ws_stream.split();
        subscribe_in_batches(&mut write, &args).await?;

        while let Some(msg) = read.next().await {
            let msg = msg?;
            let Ok(text) = msg.into_text() else { continue };
            for ticker in parse_ticker_message(&text) {
                if tx.send(ticker).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn backfill_klines(&self, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>, ScreenerError> {
        let url = format!(
            "{}/v5/market/kline?category=linear&symbol={}&interval={}&limit={}",
            self.rest_base,
            symbol,
            Self::interval_code(interval),
            limit
        );
        let resp: V5Envelope<KlineResult> = self.client.get(&url).send().await?.json().await?;
        // Bybit returns newest-first; the rolling series expects oldest-first.
        let mut rows = resp.result.list;
        rows.reverse();
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(candle) = parse_kline_row(&row) {
                candles.push(candle);
            }
        }
        Ok(candles)
    }

    async fn open_interest(&self, symbol: &str) -> Result<f64, ScreenerError> {
        let url = format!(
            "{}/v5/market/open-interest?category=linear&symbol={}&intervalTime=5min",
            self.rest_base, symbol
        );
        #[derive(Deserialize)]
        struct OiRow {
            #[serde(rename = "openInterest")]
            open_interest: String,
        }
        #[derive(Deserialize, Default)]
        struct OiResult {
            list: Vec<OiRow>,
        }
        let resp: V5Envelope<OiResult> = self.client.get(&url).send().await?.json().await?;
        let row = resp
            .result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ScreenerError::MalformedPayload(format!("no open-interest rows for {symbol}")))?;
        row.open_interest
            .parse::<f64>()
            .map_err(|e| ScreenerError::MalformedPayload(format!("bad openInterest for {symbol}: {e}")))
    }
}

async fn subscribe_in_batches(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    args: &[String],
) -> Result<(), ScreenerError> {
    for chunk in args.chunks(SUBSCRIBE_BATCH) {
        let sub = serde_json::json!({ "op": "subscribe", "args": chunk });
        write.send(Message::Text(sub.to_string().into())).await?;
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct KlineResult {
    list: Vec<serde_json::Value>,
}

/// Bybit's v5 kline rows are positional arrays:
/// `[start, open, high, low, close, volume, turnover]`.
fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
    let arr = row.as_array()?;
    let open_time_ms = arr.first()?.as_str()?.parse().ok()?;
    let open = arr.get(1)?.as_str()?.parse().ok()?;
    let high = arr.get(2)?.as_str()?.parse().ok()?;
    let low = arr.get(3)?.as_str()?.parse().ok()?;
    let close = arr.get(4)?.as_str()?.parse().ok()?;
    let volume = arr.get(6)?.as_str()?.parse().ok()?; // turnover = quote volume
    Some(Candle {
        open_time_ms,
        close_time_ms: open_time_ms + 60_000,
        open,
        high,
        low,
        close,
        volume,
        closed: true,
    })
}

#[derive(Debug, Deserialize)]
struct TopicEnvelope {
    topic: Option<String>,
    data: Option<serde_json::Value>,
}

fn parse_kline_message(text: &str) -> Option<(String, Candle)> {
    let envelope: TopicEnvelope = serde_json::from_str(text).ok()?;
    let topic = envelope.topic?;
    if !topic.starts_with("kline.1.") {
        return None;
    }
    let items = envelope.data?.as_array()?.clone();
    let item = items.first()?;
    let symbol = item.get("symbol").and_then(|v| v.as_str()).unwrap_or_else(|| topic.rsplit('.').next().unwrap_or_default()).to_string();
    let open_time_ms = item.get("start")?.as_i64()?;
    let close_time_ms = item.get("end")?.as_i64()?;
    let open: f64 = parse_num(item.get("open")?)?;
    let high: f64 = parse_num(item.get("high")?)?;
    let low: f64 = parse_num(item.get("low")?)?;
    let close: f64 = parse_num(item.get("close")?)?;
    let volume: f64 = item.get("turnover").and_then(parse_num).unwrap_or(0.0);
    let closed = item.get("confirm")?.as_bool()?;
    Some((
        symbol,
        Candle {
            open_time_ms,
            close_time_ms,
            open,
            high,
            low,
            close,
            volume,
            closed,
        },
    ))
}

fn parse_ticker_message(text: &str) -> Vec<(String, TickerUpdate)> {
    let Ok(envelope) = serde_json::from_str::<TopicEnvelope>(text) else {
        return Vec::new();
    };
    let Some(topic) = envelope.topic else { return Vec::new() };
    if !topic.starts_with("tickers.") {
        return Vec::new();
    }
    let Some(data) = envelope.data else { return Vec::new() };
    let items: Vec<serde_json::Value> = match data {
        serde_json::Value::Array(a) => a,
        obj @ serde_json::Value::Object(_) => vec![obj],
        _ => Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            let symbol = item.get("symbol")?.as_str()?.to_string();
            let price = item.get("lastPrice").and_then(parse_num)?;
            let ts_ms = item.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
            Some((symbol, TickerUpdate { ts_ms, price }))
        })
        .collect()
}

fn parse_num(value: &serde_json::Value) -> Option<f64> {
    value.as_str().and_then(|s| s.parse().ok()).or_else(|| value.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kline_topic_message() {
        let text = r#"{"topic":"kline.1.BTCUSDT","data":[{"symbol":"BTCUSDT","start":1000,"end":60999,"open":"1.0","high":"2.0","low":"0.5","close":"1.5","turnover":"10.0","confirm":true}]}"#;
        let (symbol, candle) = parse_kline_message(text).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert!(candle.closed);
        assert_eq!(candle.close, 1.5);
    }

    #[test]
    fn parses_ticker_topic_message() {
        let text = r#"{"topic":"tickers.BTCUSDT","data":{"symbol":"BTCUSDT","lastPrice":"123.45","ts":1700000000000}}"#;
        let out = parse_ticker_message(text);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "BTCUSDT");
        assert_eq!(out[0].1.price, 123.45);
    }

    #[test]
    fn non_kline_topic_is_ignored() {
        let text = r#"{"topic":"tickers.BTCUSDT","data":{"symbol":"BTCUSDT","lastPrice":"1","ts":1}}"#;
        assert!(parse_kline_message(text).is_none());
    }

    #[test]
    fn positional_kline_row_parses_quote_turnover() {
        let row = serde_json::json!(["1000", "1.0", "2.0", "0.5", "1.5", "ignored", "10.0"]);
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.open_time_ms, 1000);
        assert_eq!(candle.volume, 10.0);
    }
}

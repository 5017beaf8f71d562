use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::ExchangeAdapter;
use crate::model::{Market, Ticker, Trade};

const BINANCE_BASE_URL: &str = "https://api.binance.com";
const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/stream";
// Reconnect before Binance's 24-hour auto-disconnect (23 hours)
const WS_RECONNECT_SECS: u64 = 23 * 60 * 60;
/// ~5000 weight/min allowed; 20 req/s leaves a wide safety margin.
const BINANCE_REQUESTS_PER_SECOND: std::num::NonZeroU32 = nonzero!(20u32);

/// Multi-symbol watch adapter: one websocket carries `@trade` streams for
/// every subscribed symbol; `watch_trades_for_symbols` drains whatever
/// arrived since the previous call.
pub struct BinanceAdapter {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    trades_limit: usize,
    markets: RwLock<HashMap<String, Market>>,
    stream: Mutex<Option<TradeStream>>,
}

struct TradeStream {
    rx: mpsc::Receiver<Trade>,
    task: JoinHandle<()>,
}

impl BinanceAdapter {
    pub fn new(trades_limit: usize) -> Self {
        let quota = Quota::per_second(BINANCE_REQUESTS_PER_SECOND);
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            trades_limit: trades_limit.max(1),
            markets: RwLock::new(HashMap::new()),
            stream: Mutex::new(None),
        }
    }

    async fn connect_stream(&self, symbols: &[String]) -> Result<TradeStream, Report<ExchangeError>> {
        let mut id_to_symbol = HashMap::new();
        let mut streams = Vec::new();
        {
            let markets = self.markets.read();
            for symbol in symbols {
                match markets.get(symbol) {
                    Some(market) => {
                        streams.push(format!("{}@trade", market.id.to_lowercase()));
                        id_to_symbol.insert(market.id.clone(), symbol.clone());
                    }
                    None => warn!(symbol = %symbol, "market not found on binance, not watching"),
                }
            }
        }

        if streams.is_empty() {
            return Err(Report::new(ExchangeError::Connection {
                exchange: "binance".into(),
            })
            .attach("no known markets to watch"));
        }

        let ws_url = format!("{}?streams={}", BINANCE_WS_BASE, streams.join("/"));
        let (ws_stream, _) =
            connect_async(&ws_url)
                .await
                .change_context(ExchangeError::Connection {
                    exchange: "binance".into(),
                })?;

        info!(symbols = ?symbols, "binance trade stream connected");

        let (tx, rx) = mpsc::channel(self.trades_limit);
        let task = tokio::spawn(run_trade_stream(ws_stream, id_to_symbol, tx));
        Ok(TradeStream { rx, task })
    }
}

async fn run_trade_stream(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    id_to_symbol: HashMap<String, String>,
    tx: mpsc::Sender<Trade>,
) {
    let (mut write, mut read) = ws_stream.split();

    let reconnect_timer = tokio::time::sleep(Duration::from_secs(WS_RECONNECT_SECS));
    tokio::pin!(reconnect_timer);

    loop {
        tokio::select! {
            _ = &mut reconnect_timer => {
                info!("binance trade stream 23h limit reached, forcing reconnect");
                break;
            }
            msg = read.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "binance trade stream error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BinanceCombinedMsg<BinanceTradeData>>(&text) {
                            Ok(combined) => {
                                let Some(symbol) = id_to_symbol.get(&combined.data.symbol) else {
                                    continue;
                                };
                                if tx.send(combined.data.into_trade(symbol)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, raw = %text, "binance trade parse error");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Server pings every 20s; must pong within 60s
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> &str {
        "binance"
    }

    fn has_watch_for_symbols(&self) -> bool {
        true
    }

    fn load_markets(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/api/v3/exchangeInfo", BINANCE_BASE_URL);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let info: BinanceExchangeInfo =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            let mut markets = self.markets.write();
            markets.clear();
            for entry in info.symbols {
                if entry.status != "TRADING" {
                    continue;
                }
                let unified = format!("{}/{}", entry.base_asset, entry.quote_asset);
                markets.insert(unified, Market { id: entry.symbol });
            }
            info!(markets = markets.len(), "binance markets loaded");
            Ok(())
        })
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.markets.read().get(symbol).cloned()
    }

    fn watch_trades_for_symbols(
        &self,
        symbols: &[String],
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>> {
        let symbols = symbols.to_vec();
        Box::pin(async move {
            let mut guard = self.stream.lock().await;
            if guard.is_none() {
                *guard = Some(self.connect_stream(&symbols).await?);
            }

            let stream = guard.as_mut().unwrap();
            let Some(first) = stream.rx.recv().await else {
                *guard = None;
                return Err(Report::new(ExchangeError::Connection {
                    exchange: "binance".into(),
                })
                .attach("trade stream ended"));
            };

            let mut trades = vec![first];
            while trades.len() < self.trades_limit {
                match stream.rx.try_recv() {
                    Ok(trade) => trades.push(trade),
                    Err(_) => break,
                }
            }
            Ok(trades)
        })
    }

    fn fetch_trades(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let market = self.market(&symbol).ok_or_else(|| {
                Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("unknown market: {symbol}"))
            })?;

            self.rate_limiter.until_ready().await;

            let url = format!("{}/api/v3/trades", BINANCE_BASE_URL);
            let limit = self.trades_limit.min(1000).to_string();
            let params = [("symbol", market.id.as_str()), ("limit", limit.as_str())];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceRestTrade> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            let trades = raw
                .into_iter()
                .map(|row| row.into_trade(&symbol))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(trades)
        })
    }

    fn fetch_ticker(
        &self,
        market_id: &str,
    ) -> BoxFuture<'_, Result<Ticker, Report<ExchangeError>>> {
        let market_id = market_id.to_owned();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/api/v3/ticker/24hr", BINANCE_BASE_URL);
            let params = [("symbol", market_id.as_str())];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: BinanceTicker24h =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            let symbol = self
                .markets
                .read()
                .iter()
                .find(|(_, market)| market.id == market_id)
                .map(|(unified, _)| unified.clone())
                .unwrap_or(market_id);

            Ok(Ticker {
                symbol,
                last: raw.last_price.parse::<f64>().ok(),
                timestamp: Some(raw.close_time),
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(stream) = self.stream.lock().await.take() {
                stream.task.abort();
            }
        })
    }
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceSymbolInfo {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceRestTrade {
    price: String,
    qty: String,
    time: i64,
}

impl BinanceRestTrade {
    fn into_trade(self, symbol: &str) -> Result<Trade, Report<ExchangeError>> {
        let parse_f64 = |s: &str| -> Result<f64, Report<ExchangeError>> {
            s.parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "binance".into(),
                })
        };
        Ok(Trade {
            symbol: symbol.to_owned(),
            price: parse_f64(&self.price)?,
            amount: parse_f64(&self.qty)?,
            timestamp: Some(self.time),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceTicker24h {
    last_price: String,
    close_time: i64,
}

// ── WebSocket message types ───────────────────────────────────────────────────

/// Combined stream wrapper: `{ "stream": "...", "data": { ... } }`
#[derive(Debug, Deserialize)]
struct BinanceCombinedMsg<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct BinanceTradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

impl BinanceTradeData {
    fn into_trade(self, unified_symbol: &str) -> Trade {
        Trade {
            symbol: unified_symbol.to_owned(),
            price: self.price.parse::<f64>().unwrap_or(0.0),
            amount: self.quantity.parse::<f64>().unwrap_or(0.0),
            timestamp: Some(self.trade_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_trade_maps_to_unified_symbol() {
        let data = BinanceTradeData {
            symbol: "BTCUSDT".into(),
            price: "50000.5".into(),
            quantity: "0.25".into(),
            trade_time: 1_700_000_000_000,
        };
        let trade = data.into_trade("BTC/USDT");
        assert_eq!(trade.symbol, "BTC/USDT");
        assert_eq!(trade.price, 50_000.5);
        assert_eq!(trade.amount, 0.25);
        assert_eq!(trade.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn rest_trade_parses_decimal_strings() {
        let row = BinanceRestTrade {
            price: "42000.0".into(),
            qty: "1.5".into(),
            time: 1_704_067_200_000,
        };
        let trade = row.into_trade("BTC/USDT").unwrap();
        assert_eq!(trade.price, 42_000.0);
        assert_eq!(trade.amount, 1.5);
    }

    #[test]
    fn rest_trade_with_bad_number_is_an_error() {
        let row = BinanceRestTrade {
            price: "not-a-price".into(),
            qty: "1.5".into(),
            time: 0,
        };
        assert!(row.into_trade("BTC/USDT").is_err());
    }

    #[test]
    fn combined_stream_message_parses() {
        let raw = r#"{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","p":"50000.00","q":"0.10","T":1700000000000}}"#;
        let msg: BinanceCombinedMsg<BinanceTradeData> = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.data.symbol, "BTCUSDT");
        assert_eq!(msg.data.price, "50000.00");
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_load_markets_and_fetch_ticker() {
        let adapter = BinanceAdapter::new(100);
        adapter.load_markets().await.unwrap();
        let market = adapter.market("BTC/USDT").unwrap();
        let ticker = adapter.fetch_ticker(&market.id).await.unwrap();
        assert!(ticker.last.unwrap() > 0.0);
    }
}

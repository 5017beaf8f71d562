use std::collections::HashMap;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::ExchangeAdapter;
use crate::model::{Market, Ticker, Trade};

const UPBIT_BASE_URL: &str = "https://api.upbit.com";
const UPBIT_WS_URL: &str = "wss://api.upbit.com/websocket/v1";
const MAX_TRADES_PER_REQUEST: usize = 500;
/// Upbit allows 10 req/s; use 8 for safety margin
const UPBIT_REQUESTS_PER_SECOND: std::num::NonZeroU32 = nonzero!(8u32);

/// Per-symbol watch adapter: upbit's stream protocol subscribes one trade
/// channel per connection, so each watched symbol gets its own session.
pub struct UpbitAdapter {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    trades_limit: usize,
    markets: RwLock<HashMap<String, Market>>,
    sessions: SyncMutex<HashMap<String, Arc<Mutex<Option<TradeStream>>>>>,
}

struct TradeStream {
    rx: mpsc::Receiver<Trade>,
    task: JoinHandle<()>,
}

impl UpbitAdapter {
    pub fn new(trades_limit: usize) -> Self {
        let quota = Quota::per_second(UPBIT_REQUESTS_PER_SECOND);
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            trades_limit: trades_limit.max(1),
            markets: RwLock::new(HashMap::new()),
            sessions: SyncMutex::new(HashMap::new()),
        }
    }

    fn session(&self, symbol: &str) -> Arc<Mutex<Option<TradeStream>>> {
        let mut sessions = self.sessions.lock();
        Arc::clone(
            sessions
                .entry(symbol.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    async fn connect_stream(&self, symbol: &str) -> Result<TradeStream, Report<ExchangeError>> {
        let market = self.market(symbol).ok_or_else(|| {
            Report::new(ExchangeError::Connection {
                exchange: "upbit".into(),
            })
            .attach(format!("unknown market: {symbol}"))
        })?;

        let (ws_stream, _) =
            connect_async(UPBIT_WS_URL)
                .await
                .change_context(ExchangeError::Connection {
                    exchange: "upbit".into(),
                })?;

        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!([
            { "ticket": Uuid::new_v4().to_string() },
            { "type": "trade", "codes": [market.id] },
            { "format": "DEFAULT" },
        ]);
        write
            .send(Message::Text(subscribe.to_string().into()))
            .await
            .change_context(ExchangeError::Connection {
                exchange: "upbit".into(),
            })?;

        info!(symbol = %symbol, "upbit trade stream connected");

        let (tx, rx) = mpsc::channel(self.trades_limit);
        let unified = symbol.to_owned();
        let task = tokio::spawn(async move {
            loop {
                let payload = match read.next().await {
                    None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "upbit trade stream error");
                        break;
                    }
                    // Upbit delivers events as binary frames holding JSON
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                };

                match serde_json::from_slice::<UpbitTradeEvent>(&payload) {
                    Ok(event) if event.kind == "trade" => {
                        if tx.send(event.into_trade(&unified)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "upbit trade parse error");
                    }
                }
            }
        });

        Ok(TradeStream { rx, task })
    }
}

impl ExchangeAdapter for UpbitAdapter {
    fn id(&self) -> &str {
        "upbit"
    }

    fn has_watch_per_symbol(&self) -> bool {
        true
    }

    fn load_markets(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/v1/market/all", UPBIT_BASE_URL);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "upbit".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "upbit".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<UpbitMarketInfo> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "upbit".into(),
                    })?;

            let mut markets = self.markets.write();
            markets.clear();
            for entry in raw {
                // Market codes are quote-base, e.g. "USDT-BTC" is BTC in USDT
                let Some((quote, base)) = entry.market.split_once('-') else {
                    continue;
                };
                let unified = format!("{base}/{quote}");
                markets.insert(unified, Market { id: entry.market });
            }
            info!(markets = markets.len(), "upbit markets loaded");
            Ok(())
        })
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.markets.read().get(symbol).cloned()
    }

    fn watch_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let session = self.session(&symbol);
            let mut guard = session.lock().await;
            if guard.is_none() {
                *guard = Some(self.connect_stream(&symbol).await?);
            }

            let stream = guard.as_mut().unwrap();
            let Some(first) = stream.rx.recv().await else {
                *guard = None;
                return Err(Report::new(ExchangeError::Connection {
                    exchange: "upbit".into(),
                })
                .attach(format!("trade stream for {symbol} ended")));
            };

            let mut trades = vec![first];
            while trades.len() < self.trades_limit {
                match stream.rx.try_recv() {
                    Ok(trade) => trades.push(trade),
                    Err(_) => break,
                }
            }

            if let Some(since) = since {
                trades.retain(|t| t.timestamp.is_some_and(|ts| ts >= since));
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
                    exchange: "upbit".into(),
                })
                .attach(format!("unknown market: {symbol}"))
            })?;

            self.rate_limiter.until_ready().await;

            let url = format!("{}/v1/trades/ticks", UPBIT_BASE_URL);
            let count = self.trades_limit.min(MAX_TRADES_PER_REQUEST).to_string();
            let params = [("market", market.id.as_str()), ("count", count.as_str())];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "upbit".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "upbit".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<UpbitTick> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "upbit".into(),
                    })?;

            Ok(raw
                .into_iter()
                .map(|tick| Trade {
                    symbol: symbol.clone(),
                    price: tick.trade_price,
                    amount: tick.trade_volume,
                    timestamp: Some(tick.timestamp),
                })
                .collect())
        })
    }

    fn fetch_ticker(
        &self,
        market_id: &str,
    ) -> BoxFuture<'_, Result<Ticker, Report<ExchangeError>>> {
        let market_id = market_id.to_owned();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/v1/ticker", UPBIT_BASE_URL);
            let params = [("markets", market_id.as_str())];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "upbit".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "upbit".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<UpbitTickerData> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "upbit".into(),
                    })?;

            let data = raw.into_iter().next().ok_or_else(|| {
                Report::new(ExchangeError::ResponseParse {
                    exchange: "upbit".into(),
                })
                .attach(format!("empty ticker response for {market_id}"))
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
                last: Some(data.trade_price),
                timestamp: Some(data.timestamp),
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
            for session in sessions {
                if let Some(stream) = session.lock().await.take() {
                    stream.task.abort();
                }
            }
        })
    }
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpbitMarketInfo {
    market: String,
}

#[derive(Debug, Deserialize)]
struct UpbitTick {
    trade_price: f64,
    trade_volume: f64,
    /// Trade epoch milliseconds
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct UpbitTickerData {
    trade_price: f64,
    timestamp: i64,
}

// ── WebSocket message types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpbitTradeEvent {
    #[serde(rename = "type")]
    kind: String,
    trade_price: f64,
    trade_volume: f64,
    trade_timestamp: i64,
}

impl UpbitTradeEvent {
    fn into_trade(self, unified_symbol: &str) -> Trade {
        Trade {
            symbol: unified_symbol.to_owned(),
            price: self.trade_price,
            amount: self.trade_volume,
            timestamp: Some(self.trade_timestamp),
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::error::ExchangeError;
use crate::exchange::ExchangeAdapter;
use crate::model::{Market, Ticker, Trade};

const KRAKEN_BASE_URL: &str = "https://api.kraken.com";
/// Public endpoints allow ~1 call/s sustained
const KRAKEN_REQUESTS_PER_SECOND: std::num::NonZeroU32 = nonzero!(1u32);

/// REST-only adapter; trades are polled, never streamed. Every kraken
/// payload wraps the result in `{ "error": [...], "result": ... }` and a
/// non-empty error array means the request failed regardless of HTTP status.
pub struct KrakenAdapter {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    trades_limit: usize,
    markets: RwLock<HashMap<String, Market>>,
}

impl KrakenAdapter {
    pub fn new(trades_limit: usize) -> Self {
        let quota = Quota::per_second(KRAKEN_REQUESTS_PER_SECOND);
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            trades_limit: trades_limit.max(1),
            markets: RwLock::new(HashMap::new()),
        }
    }

    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, Report<ExchangeError>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{KRAKEN_BASE_URL}{path}");
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .change_context(ExchangeError::Request {
                exchange: "kraken".into(),
            })?;

        if !response.status().is_success() {
            return Err(Report::new(ExchangeError::Request {
                exchange: "kraken".into(),
            })
            .attach(format!("HTTP status: {}", response.status())));
        }

        let envelope: KrakenResponse<T> =
            response
                .json()
                .await
                .change_context(ExchangeError::ResponseParse {
                    exchange: "kraken".into(),
                })?;

        if !envelope.error.is_empty() {
            return Err(Report::new(ExchangeError::Request {
                exchange: "kraken".into(),
            })
            .attach(envelope.error.join("; ")));
        }

        envelope.result.ok_or_else(|| {
            Report::new(ExchangeError::ResponseParse {
                exchange: "kraken".into(),
            })
            .attach("missing result field")
        })
    }

    fn unified_symbol(&self, market_id: &str) -> Option<String> {
        self.markets
            .read()
            .iter()
            .find(|(_, market)| market.id == market_id)
            .map(|(unified, _)| unified.clone())
    }
}

/// Kraken keeps legacy asset codes on a few majors.
fn unalias(asset: &str) -> &str {
    match asset {
        "XBT" => "BTC",
        "XDG" => "DOGE",
        other => other,
    }
}

impl ExchangeAdapter for KrakenAdapter {
    fn id(&self) -> &str {
        "kraken"
    }

    fn load_markets(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            let pairs: HashMap<String, KrakenPairInfo> =
                self.get_public("/0/public/AssetPairs", &[]).await?;

            let mut markets = self.markets.write();
            markets.clear();
            for (pair_id, pair) in pairs {
                let Some(wsname) = pair.wsname else { continue };
                let Some((base, quote)) = wsname.split_once('/') else {
                    continue;
                };
                let unified = format!("{}/{}", unalias(base), unalias(quote));
                markets.insert(unified, Market { id: pair_id });
            }
            info!(markets = markets.len(), "kraken markets loaded");
            Ok(())
        })
    }

    fn market(&self, symbol: &str) -> Option<Market> {
        self.markets.read().get(symbol).cloned()
    }

    fn fetch_trades(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let market = self.market(&symbol).ok_or_else(|| {
                Report::new(ExchangeError::Request {
                    exchange: "kraken".into(),
                })
                .attach(format!("unknown market: {symbol}"))
            })?;

            let result: HashMap<String, Value> = self
                .get_public("/0/public/Trades", &[("pair", market.id.as_str())])
                .await?;

            // The result object holds one pair key (not always the requested
            // spelling) plus a "last" cursor.
            let rows = result
                .iter()
                .find(|(key, _)| key.as_str() != "last")
                .and_then(|(_, value)| value.as_array())
                .ok_or_else(|| {
                    Report::new(ExchangeError::ResponseParse {
                        exchange: "kraken".into(),
                    })
                    .attach("no trade rows in response")
                })?;

            let mut trades = Vec::new();
            for row in rows.iter().take(self.trades_limit) {
                if let Some(trade) = parse_trade_row(row, &symbol) {
                    trades.push(trade);
                }
            }
            Ok(trades)
        })
    }

    fn fetch_ticker(
        &self,
        market_id: &str,
    ) -> BoxFuture<'_, Result<Ticker, Report<ExchangeError>>> {
        let market_id = market_id.to_owned();
        Box::pin(async move {
            let result: HashMap<String, KrakenTickerInfo> = self
                .get_public("/0/public/Ticker", &[("pair", market_id.as_str())])
                .await?;

            let ticker = result.into_values().next().ok_or_else(|| {
                Report::new(ExchangeError::ResponseParse {
                    exchange: "kraken".into(),
                })
                .attach(format!("empty ticker response for {market_id}"))
            })?;

            let last = ticker
                .c
                .first()
                .and_then(|price| price.parse::<f64>().ok());

            Ok(Ticker {
                symbol: self.unified_symbol(&market_id).unwrap_or(market_id),
                last,
                // Kraken tickers carry no timestamp; callers default to now
                timestamp: None,
            })
        })
    }
}

/// Trade rows are positional arrays: `[price, volume, time, side, type, misc, id]`.
fn parse_trade_row(row: &Value, symbol: &str) -> Option<Trade> {
    let fields = row.as_array()?;
    let price = fields.first()?.as_str()?.parse::<f64>().ok()?;
    let amount = fields.get(1)?.as_str()?.parse::<f64>().ok()?;
    let time_sec = fields.get(2)?.as_f64()?;
    Some(Trade {
        symbol: symbol.to_owned(),
        price,
        amount,
        timestamp: Some((time_sec * 1000.0) as i64),
    })
}

#[derive(Debug, Deserialize)]
struct KrakenResponse<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KrakenPairInfo {
    wsname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KrakenTickerInfo {
    /// Last trade closed: `[price, lot volume]`
    c: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_row_parses_price_volume_and_seconds() {
        let row = serde_json::json!(["50000.10000", "0.25000000", 1700000000.4321, "b", "l", "", 123]);
        let trade = parse_trade_row(&row, "BTC/USD").unwrap();
        assert_eq!(trade.symbol, "BTC/USD");
        assert_eq!(trade.price, 50_000.1);
        assert_eq!(trade.amount, 0.25);
        assert_eq!(trade.timestamp, Some(1_700_000_000_432));
    }

    #[test]
    fn malformed_trade_row_is_dropped() {
        let row = serde_json::json!(["not-a-price", "0.25", 1.0]);
        assert!(parse_trade_row(&row, "BTC/USD").is_none());
    }

    #[test]
    fn legacy_asset_codes_are_unaliased() {
        assert_eq!(unalias("XBT"), "BTC");
        assert_eq!(unalias("XDG"), "DOGE");
        assert_eq!(unalias("ETH"), "ETH");
    }

    #[test]
    fn error_envelope_is_a_request_failure() {
        let raw = r#"{"error":["EQuery:Unknown asset pair"]}"#;
        let envelope: KrakenResponse<HashMap<String, Value>> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.error.len(), 1);
        assert!(envelope.result.is_none());
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_markets_and_ticker() {
        let adapter = KrakenAdapter::new(100);
        adapter.load_markets().await.unwrap();
        let market = adapter.market("BTC/USD").unwrap();
        let ticker = adapter.fetch_ticker(&market.id).await.unwrap();
        assert!(ticker.last.unwrap() > 0.0);
    }
}

pub mod binance;
pub mod kraken;
pub mod upbit;

use std::sync::Arc;

use error_stack::Report;
use futures::future::BoxFuture;
use tracing::warn;

use crate::config::Config;
use crate::error::ExchangeError;
use crate::model::{Market, Ticker, Trade};

/// Capability-typed handle over a single exchange.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn ExchangeAdapter`).
///
/// The `watch_*` calls follow stream semantics: each call blocks until the
/// next batch of trades arrives on the underlying connection and returns
/// only trades not delivered by a prior invocation. The `fetch_*` calls are
/// plain REST requests.
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Supports one shared stream covering many symbols.
    fn has_watch_for_symbols(&self) -> bool {
        false
    }

    /// Supports one stream per symbol.
    fn has_watch_per_symbol(&self) -> bool {
        false
    }

    /// Populates the unified-symbol → market map. Must complete before any
    /// watch or ticker call.
    fn load_markets(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>>;

    /// Market handle for a unified symbol, once markets are loaded.
    fn market(&self, symbol: &str) -> Option<Market>;

    fn watch_trades_for_symbols(
        &self,
        _symbols: &[String],
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>> {
        let exchange = self.id().to_owned();
        Box::pin(async move { Err(Report::new(ExchangeError::WatchUnsupported { exchange })) })
    }

    fn watch_trades(
        &self,
        _symbol: &str,
        _since: Option<i64>,
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>> {
        let exchange = self.id().to_owned();
        Box::pin(async move { Err(Report::new(ExchangeError::WatchUnsupported { exchange })) })
    }

    /// REST fallback for exchanges without any trade stream.
    fn fetch_trades(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<Vec<Trade>, Report<ExchangeError>>>;

    /// Last-price ticker by exchange-native market id, used for cold-start
    /// backfill.
    fn fetch_ticker(
        &self,
        market_id: &str,
    ) -> BoxFuture<'_, Result<Ticker, Report<ExchangeError>>>;

    /// Tears down any open stream connections.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Maps a catalog exchange name to a concrete adapter. Unknown names are
/// dropped with a warning so one bad catalog entry cannot take the process
/// down.
pub fn build_adapter(name: &str, config: &Config) -> Option<Arc<dyn ExchangeAdapter>> {
    match name {
        "binance" => Some(Arc::new(binance::BinanceAdapter::new(
            config.trades_history_size,
        ))),
        "upbit" => Some(Arc::new(upbit::UpbitAdapter::new(
            config.trades_history_size,
        ))),
        "kraken" => Some(Arc::new(kraken::KrakenAdapter::new(
            config.trades_history_size,
        ))),
        other => {
            warn!(exchange = other, "unknown exchange in catalog, skipping");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn known_exchanges_build() {
        let config = Config::for_tests();
        for name in ["binance", "upbit", "kraken"] {
            let adapter = build_adapter(name, &config).unwrap();
            assert_eq!(adapter.id(), name);
        }
    }

    #[test]
    fn unknown_exchange_is_dropped() {
        let config = Config::for_tests();
        assert!(build_adapter("definitely-not-real", &config).is_none());
    }

    #[test]
    fn capability_flags_match_strategy_expectations() {
        let config = Config::for_tests();
        let binance = build_adapter("binance", &config).unwrap();
        assert!(binance.has_watch_for_symbols());

        let upbit = build_adapter("upbit", &config).unwrap();
        assert!(!upbit.has_watch_for_symbols());
        assert!(upbit.has_watch_per_symbol());

        let kraken = build_adapter("kraken", &config).unwrap();
        assert!(!kraken.has_watch_for_symbols());
        assert!(!kraken.has_watch_per_symbol());
    }
}

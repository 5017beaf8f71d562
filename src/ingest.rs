use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineInner;
use crate::error::ExchangeError;
use crate::exchange::ExchangeAdapter;
use crate::model::Trade;
use crate::retry::retry;

const IDLE_SLEEP_MS: u64 = 1_000;
const MULTI_WATCH_ERROR_SLEEP_MS: u64 = 10_000;
const SYMBOL_WATCH_ERROR_BASE_MS: u64 = 5_000;
const SYMBOL_WATCH_ERROR_JITTER_MS: u64 = 10_000;
const FETCH_MAX_RETRIES: u32 = 5;
const FETCH_RETRY_BACKOFF_MS: u64 = 2_000;
const FETCH_COOLDOWN_MS: u64 = 300_000;

/// One ingestor per exchange. Picks the cheapest strategy the adapter
/// supports: a single multi-symbol stream, one stream per symbol, or REST
/// polling. Failures stay inside this task; other exchanges and the query
/// surface never see them.
pub(crate) async fn run(
    inner: Arc<EngineInner>,
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: Vec<String>,
    cancel: CancellationToken,
) {
    info!(exchange = adapter.id(), symbols = ?symbols, "watching trades");

    if adapter.has_watch_for_symbols() && !inner.config.multi_watch_exclude.contains(adapter.id())
    {
        watch_multi(inner, adapter, symbols, cancel).await;
    } else if adapter.has_watch_per_symbol() {
        for symbol in symbols {
            let handle = tokio::spawn(watch_symbol(
                Arc::clone(&inner),
                Arc::clone(&adapter),
                symbol,
                cancel.clone(),
            ));
            inner.tasks.lock().push(handle);
        }
    } else {
        warn!(
            exchange = adapter.id(),
            "exchange does not support watching trades, polling for trades instead"
        );
        poll_trades(inner, adapter, symbols, cancel).await;
    }
}

/// Returns true when the token fired before the timer.
async fn sleep_or_cancel(cancel: &CancellationToken, ms: u64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(Duration::from_millis(ms)) => false,
    }
}

/// One shared stream for all symbols. Only the last trade's symbol advances
/// its `since` cursor; the stream may re-deliver other symbols' trades and
/// the volume rings drop what they have already counted.
async fn watch_multi(
    inner: Arc<EngineInner>,
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: Vec<String>,
    cancel: CancellationToken,
) {
    let mut since: HashMap<String, i64> = HashMap::new();

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = adapter.watch_trades_for_symbols(&symbols) => batch,
        };

        match batch {
            Ok(trades) => {
                let mut fresh: Vec<Trade> = trades
                    .into_iter()
                    .filter(|t| {
                        t.timestamp
                            .is_some_and(|ts| ts > since.get(&t.symbol).copied().unwrap_or(0))
                    })
                    .collect();

                if fresh.is_empty() {
                    if sleep_or_cancel(&cancel, IDLE_SLEEP_MS).await {
                        break;
                    }
                    continue;
                }

                fresh.sort_by_key(|t| t.timestamp);
                let last = fresh.last().unwrap().clone();
                inner
                    .prices
                    .set(adapter.id(), &last.symbol, last.price, last.timestamp);
                if let Some(ts) = last.timestamp {
                    since.insert(last.symbol.clone(), ts);
                }
                process_volumes(&inner, adapter.id(), &fresh);
            }
            Err(e) => {
                debug!(
                    exchange = adapter.id(),
                    error = ?e,
                    "failed to watch trades, will retry"
                );
                if sleep_or_cancel(&cancel, MULTI_WATCH_ERROR_SLEEP_MS).await {
                    break;
                }
            }
        }
    }
}

/// Dedicated stream for a single symbol; `since` advances past the last
/// processed trade so reconnects never replay it.
async fn watch_symbol(
    inner: Arc<EngineInner>,
    adapter: Arc<dyn ExchangeAdapter>,
    symbol: String,
    cancel: CancellationToken,
) {
    let mut since: Option<i64> = None;

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = adapter.watch_trades(&symbol, since) => batch,
        };

        match batch {
            Ok(trades) => {
                let mut trades: Vec<Trade> =
                    trades.into_iter().filter(|t| t.timestamp.is_some()).collect();

                if trades.is_empty() {
                    if sleep_or_cancel(&cancel, IDLE_SLEEP_MS).await {
                        break;
                    }
                    continue;
                }

                trades.sort_by_key(|t| t.timestamp);
                let last = trades.last().unwrap().clone();
                inner
                    .prices
                    .set(adapter.id(), &last.symbol, last.price, last.timestamp);
                since = last.timestamp.map(|ts| ts + 1);
                inner.volumes.process_trades(adapter.id(), &symbol, &trades);
            }
            Err(e) => {
                debug!(
                    exchange = adapter.id(),
                    symbol = %symbol,
                    error = ?e,
                    "failed to watch trades, will retry"
                );
                let jitter = rand::thread_rng().gen_range(0..SYMBOL_WATCH_ERROR_JITTER_MS);
                if sleep_or_cancel(&cancel, SYMBOL_WATCH_ERROR_BASE_MS + jitter).await {
                    break;
                }
            }
        }
    }
}

/// REST fallback: sweep every symbol, keep only a strictly newer latest
/// trade. A sweep that exhausts its retries backs off for five minutes.
async fn poll_trades(
    inner: Arc<EngineInner>,
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: Vec<String>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = retry(
                || {
                    let inner = Arc::clone(&inner);
                    let adapter = Arc::clone(&adapter);
                    let symbols = symbols.clone();
                    async move { sweep_once(&inner, adapter.as_ref(), &symbols).await }
                },
                FETCH_MAX_RETRIES,
                FETCH_RETRY_BACKOFF_MS,
            ) => result,
        };

        match result {
            Ok(()) => {
                if sleep_or_cancel(&cancel, IDLE_SLEEP_MS).await {
                    break;
                }
            }
            Err(e) => {
                debug!(
                    exchange = adapter.id(),
                    error = ?e,
                    "failed to fetch trades after multiple retries, will attempt again in 5 minutes"
                );
                if sleep_or_cancel(&cancel, FETCH_COOLDOWN_MS).await {
                    break;
                }
            }
        }
    }
}

async fn sweep_once(
    inner: &EngineInner,
    adapter: &dyn ExchangeAdapter,
    symbols: &[String],
) -> Result<(), Report<ExchangeError>> {
    for symbol in symbols {
        let mut trades = adapter.fetch_trades(symbol).await?;
        if trades.is_empty() {
            warn!(exchange = adapter.id(), symbol = %symbol, "no trades found");
            continue;
        }

        trades.sort_by_key(|t| std::cmp::Reverse(t.timestamp));
        let Some(newest) = trades.first() else { continue };
        let Some(ts) = newest.timestamp else { continue };

        if ts > inner.prices.time(&newest.symbol, adapter.id()) {
            inner
                .prices
                .set(adapter.id(), &newest.symbol, newest.price, Some(ts));
        }
    }
    Ok(())
}

/// Volume pipeline: every trade in the batch counts, grouped onto its own
/// symbol's ring; the rings themselves discard out-of-order entries.
fn process_volumes(inner: &EngineInner, exchange: &str, trades: &[Trade]) {
    let mut by_symbol: HashMap<&str, Vec<Trade>> = HashMap::new();
    for trade in trades {
        by_symbol
            .entry(trade.symbol.as_str())
            .or_default()
            .push(trade.clone());
    }
    for (symbol, batch) in by_symbol {
        inner.volumes.process_trades(exchange, symbol, &batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::exchange::testing::MockAdapter;
    use crate::model::now_ms;

    fn trade(symbol: &str, timestamp_ms: i64, price: f64, amount: f64) -> Trade {
        Trade {
            symbol: symbol.into(),
            price,
            amount,
            timestamp: Some(timestamp_ms),
        }
    }

    fn test_engine() -> Engine {
        Engine::new(Arc::new(Config::for_tests()))
    }

    #[tokio::test(start_paused = true)]
    async fn multi_watch_prices_from_last_trade_and_volumes_from_all() {
        let now = now_ms();
        let adapter = Arc::new(
            MockAdapter::new("mock")
                .with_watch_for_symbols()
                .with_multi_batch(vec![
                    trade("BTC/USDT", now - 3_000, 50_000.0, 1.0),
                    trade("ETH/USDT", now - 2_000, 3_000.0, 2.0),
                    trade("BTC/USDT", now - 1_000, 50_100.0, 0.5),
                ]),
        );
        let engine = test_engine();
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            Arc::clone(&engine.inner),
            adapter,
            vec!["BTC/USDT".into(), "ETH/USDT".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Price comes from the batch's last trade only.
        let btc = engine.inner.prices.get("BTC/USDT", "mock").unwrap();
        assert_eq!(btc.value, 50_100.0);
        assert_eq!(btc.time, now - 1_000);
        // The earlier ETH trade set no price (only the last trade does) but
        // still contributed volume.
        assert!(engine.inner.prices.get("ETH/USDT", "mock").is_none());
        assert_eq!(engine.inner.volumes.volumes_for("ETH/USDT", 3_600).unwrap().len(), 1);
        assert_eq!(engine.inner.volumes.volumes_for("BTC/USDT", 3_600).unwrap().len(), 1);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn multi_watch_filters_stale_trades_by_since_cursor() {
        let now = now_ms();
        let adapter = Arc::new(
            MockAdapter::new("mock")
                .with_watch_for_symbols()
                .with_multi_batch(vec![trade("BTC/USDT", now - 5_000, 50_000.0, 1.0)])
                // Entirely stale second batch: filtered out, no price change.
                .with_multi_batch(vec![trade("BTC/USDT", now - 8_000, 1.0, 1.0)]),
        );
        let engine = test_engine();
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            Arc::clone(&engine.inner),
            adapter,
            vec!["BTC/USDT".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let btc = engine.inner.prices.get("BTC/USDT", "mock").unwrap();
        assert_eq!(btc.value, 50_000.0);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_exchange_falls_back_to_per_symbol_watch() {
        let now = now_ms();
        // bybit advertises the multi-symbol capability but is excluded by
        // config, so the per-symbol path must serve its trades.
        let adapter = Arc::new(
            MockAdapter::new("bybit")
                .with_watch_for_symbols()
                .with_watch_per_symbol()
                .with_symbol_batch(vec![trade("BTC/USDT", now - 1_000, 49_500.0, 1.0)]),
        );
        let engine = test_engine();
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            Arc::clone(&engine.inner),
            adapter.clone(),
            vec!["BTC/USDT".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            engine.inner.prices.get("BTC/USDT", "bybit").unwrap().value,
            49_500.0
        );
        assert_eq!(adapter.multi_watch_calls(), 0);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn per_symbol_watch_sets_price_and_volume() {
        let now = now_ms();
        let adapter = Arc::new(
            MockAdapter::new("mock")
                .with_watch_per_symbol()
                .with_symbol_batch(vec![
                    trade("SOL/USDT", now - 2_000, 150.0, 1.0),
                    trade("SOL/USDT", now - 1_000, 151.0, 2.0),
                ]),
        );
        let engine = test_engine();
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            Arc::clone(&engine.inner),
            adapter,
            vec!["SOL/USDT".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sol = engine.inner.prices.get("SOL/USDT", "mock").unwrap();
        assert_eq!(sol.value, 151.0);
        assert_eq!(engine.inner.volumes.volumes_for("SOL/USDT", 3_600).unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn polled_fetch_only_writes_strictly_newer_trades() {
        let now = now_ms();
        let adapter = Arc::new(
            MockAdapter::new("mock")
                .with_fetch_batch(vec![
                    trade("BTC/USD", now - 2_000, 50_000.0, 1.0),
                    trade("BTC/USD", now - 1_000, 50_200.0, 1.0),
                ])
                // An older snapshot on the next sweep must not overwrite.
                .with_fetch_batch(vec![trade("BTC/USD", now - 5_000, 1.0, 1.0)]),
        );
        let engine = test_engine();
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            Arc::clone(&engine.inner),
            adapter,
            vec!["BTC/USD".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let btc = engine.inner.prices.get("BTC/USD", "mock").unwrap();
        assert_eq!(btc.value, 50_200.0);
        assert_eq!(btc.time, now - 1_000);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_exchange_does_not_affect_others() {
        let now = now_ms();
        let broken = Arc::new(MockAdapter::new("broken").with_failing_multi_watch());
        let healthy = Arc::new(
            MockAdapter::new("healthy")
                .with_watch_for_symbols()
                .with_multi_batch(vec![trade("BTC/USD", now - 1_000, 49_000.0, 1.0)]),
        );
        let engine = test_engine();
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            Arc::clone(&engine.inner),
            broken,
            vec!["BTC/USD".into()],
            cancel.clone(),
        ));
        tokio::spawn(run(
            Arc::clone(&engine.inner),
            healthy,
            vec!["BTC/USD".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(engine.inner.prices.get("BTC/USD", "broken").is_none());
        assert_eq!(
            engine.inner.prices.get("BTC/USD", "healthy").unwrap().value,
            49_000.0
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let adapter = Arc::new(MockAdapter::new("mock").with_watch_for_symbols());
        let engine = test_engine();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            Arc::clone(&engine.inner),
            adapter,
            vec!["BTC/USDT".into()],
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ingestor did not exit on cancellation")
            .unwrap();
    }
}

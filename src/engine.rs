use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use error_stack::Report;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{FeedConfig, FeedRegistry, feed_key, usdt_usd_feed_id};
use crate::config::Config;
use crate::error::{ConfigError, VolumeError};
use crate::exchange::{ExchangeAdapter, build_adapter};
use crate::ingest;
use crate::model::{FeedId, FeedValueData, FeedVolumeData, PriceSample, Volume, now_ms};
use crate::price::PriceTable;
use crate::provider::ValueProvider;
use crate::retry::retry;
use crate::volume::{HISTORY_SEC, VolumeMap};

pub(crate) const RETRY_BACKOFF_MS: u64 = 10_000;
const MARKET_LOAD_RETRIES: u32 = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live aggregation engine: owns the price table, the volume rings, the
/// feed registry, and one ingestor task per exchange. Cloning shares the
/// underlying state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: RwLock<Option<FeedRegistry>>,
    pub(crate) prices: PriceTable,
    pub(crate) volumes: VolumeMap,
    pub(crate) adapters: RwLock<HashMap<String, Arc<dyn ExchangeAdapter>>>,
    fetch_attempted: Mutex<HashSet<String>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) cancel: CancellationToken,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: RwLock::new(None),
                prices: PriceTable::new(),
                volumes: VolumeMap::new(),
                adapters: RwLock::new(HashMap::new()),
                fetch_attempted: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                initialized: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Loads the catalog, connects every referenced exchange, and spawns the
    /// ingestors. Only catalog problems are fatal; a broken exchange is
    /// dropped with a warning and the rest keep running.
    pub async fn start(&self) -> Result<(), Report<ConfigError>> {
        let config = &self.inner.config;
        let registry = FeedRegistry::load(&config.config_dir, &config.network)?;

        let mut exchange_to_symbols: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for feed_config in registry.configs() {
            for source in &feed_config.sources {
                exchange_to_symbols
                    .entry(source.exchange.clone())
                    .or_default()
                    .insert(source.symbol.clone());
            }
        }

        info!(
            exchanges = ?exchange_to_symbols.keys().collect::<Vec<_>>(),
            trades_limit = config.trades_history_size,
            "connecting to exchanges"
        );

        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        for exchange in exchange_to_symbols.keys() {
            if let Some(adapter) = build_adapter(exchange, config) {
                adapters.insert(exchange.clone(), adapter);
            }
        }

        let load_results = join_all(adapters.iter().map(|(exchange, adapter)| {
            let exchange = exchange.clone();
            let adapter = Arc::clone(adapter);
            async move {
                let result = retry(
                    || {
                        let adapter = Arc::clone(&adapter);
                        async move { adapter.load_markets().await }
                    },
                    MARKET_LOAD_RETRIES,
                    RETRY_BACKOFF_MS,
                )
                .await;
                (exchange, result)
            }
        }))
        .await;

        for (exchange, result) in load_results {
            match result {
                Ok(()) => info!(exchange = %exchange, "exchange initialized"),
                Err(e) => {
                    warn!(exchange = %exchange, error = ?e, "failed to load markets, dropping exchange");
                    adapters.remove(&exchange);
                }
            }
        }

        *self.inner.registry.write() = Some(registry);
        *self.inner.adapters.write() = adapters.clone();

        for (exchange, adapter) in adapters {
            let Some(symbols) = exchange_to_symbols.get(&exchange) else {
                continue;
            };
            let symbols: Vec<String> = symbols
                .iter()
                .filter(|symbol| {
                    let known = adapter.market(symbol).is_some();
                    if !known {
                        warn!(symbol = %symbol, exchange = %exchange, "market not found, skipping symbol");
                    }
                    known
                })
                .cloned()
                .collect();

            let handle = tokio::spawn(ingest::run(
                Arc::clone(&self.inner),
                adapter,
                symbols,
                self.inner.cancel.clone(),
            ));
            self.inner.tasks.lock().push(handle);
        }

        self.inner.initialized.store(true, Ordering::Relaxed);
        info!("initialization done, watching trades");
        Ok(())
    }

    #[allow(dead_code)]
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Relaxed)
    }

    /// Cancels every ingestor and closes adapter connections. Queries after
    /// stop return absent values.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        self.inner.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, task).await;
        }

        let adapters: Vec<Arc<dyn ExchangeAdapter>> =
            self.inner.adapters.read().values().cloned().collect();
        for adapter in adapters {
            adapter.close().await;
        }
        info!("feed engine stopped");
    }
}

impl EngineInner {
    fn feed_config(&self, feed: &FeedId) -> Option<FeedConfig> {
        self.registry.read().as_ref().and_then(|r| r.get(feed)).cloned()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Read path for one feed. Boxed because resolving a USDT-quoted source
    /// recurses into the USDT/USD feed; `depth` caps that recursion so a
    /// catalog mistake (USDT/USD itself defined through USDT sources) cannot
    /// loop forever.
    pub(crate) fn feed_price(
        self: &Arc<Self>,
        feed: FeedId,
        depth: u8,
    ) -> BoxFuture<'static, Option<f64>> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            if inner.is_stopped() {
                return None;
            }
            if depth > 1 {
                warn!(feed = %feed, "nested USDT/USD conversion detected, returning no value");
                return None;
            }
            let Some(config) = inner.feed_config(&feed) else {
                warn!(feed = %feed, "no config found for feed");
                return None;
            };

            // Resolved at most once per call; sources sharing the conversion
            // reuse it.
            let mut usdt_to_usd: Option<Option<f64>> = None;
            let mut samples: Vec<PriceSample> = Vec::new();

            for source in &config.sources {
                let Some(info) = inner.prices.get(&source.symbol, &source.exchange) else {
                    continue;
                };

                let mut value = info.value;
                if source.symbol.ends_with("USDT") {
                    let rate = match usdt_to_usd {
                        Some(rate) => rate,
                        None => {
                            let rate = inner.feed_price(usdt_usd_feed_id(), depth + 1).await;
                            usdt_to_usd = Some(rate);
                            rate
                        }
                    };
                    let Some(rate) = rate else {
                        warn!(
                            symbol = %source.symbol,
                            exchange = %source.exchange,
                            "unable to retrieve USDT to USD conversion rate"
                        );
                        continue;
                    };
                    value *= rate;
                }

                samples.push(PriceSample {
                    value,
                    time: info.time,
                    exchange: info.exchange,
                });
            }

            if samples.is_empty() {
                warn!(feed = %feed, "no prices found");
                let backfill = Arc::clone(&inner);
                tokio::spawn(async move { backfill.fetch_last_prices(&config).await });
                return None;
            }

            debug!(feed = %feed, samples = samples.len(), "calculating weighted median");
            weighted_median(samples, inner.config.median_decay, now_ms())
        })
    }

    pub(crate) async fn feed_volumes(
        self: &Arc<Self>,
        feeds: Vec<FeedId>,
        window_sec: i64,
    ) -> Result<Vec<FeedVolumeData>, Report<VolumeError>> {
        if window_sec <= 0 || window_sec > HISTORY_SEC {
            return Err(Report::new(VolumeError::BadWindow {
                window_sec,
                history_sec: HISTORY_SEC,
            }));
        }

        if self.is_stopped() {
            return Ok(feeds
                .into_iter()
                .map(|feed| FeedVolumeData {
                    feed,
                    volumes: Vec::new(),
                })
                .collect());
        }

        let usdt_to_usd = self.feed_price(usdt_usd_feed_id(), 0).await;

        let mut results = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let mut vol_map: HashMap<String, f64> = HashMap::new();
            for (exchange, volume) in self.volumes.volumes_for(&feed.name, window_sec)? {
                vol_map.insert(exchange, volume);
            }

            // USD feeds also count volume traded on the parallel USDT
            // market, converted and rounded to whole quote units. Without a
            // conversion rate the addend is skipped, not an error.
            if let Some(rate) = usdt_to_usd {
                if let Some(base) = feed.name.strip_suffix("/USD") {
                    let usdt_symbol = format!("{base}/USDT");
                    for (exchange, volume) in self.volumes.volumes_for(&usdt_symbol, window_sec)? {
                        *vol_map.entry(exchange).or_insert(0.0) += (volume * rate).round();
                    }
                }
            }

            results.push(FeedVolumeData {
                feed,
                volumes: vol_map
                    .into_iter()
                    .map(|(exchange, volume)| Volume { exchange, volume })
                    .collect(),
            });
        }
        Ok(results)
    }

    /// One-shot REST backfill for a feed with no live samples yet. Runs at
    /// most once per feed key for the process lifetime; individual ticker
    /// failures are logged and ignored.
    async fn fetch_last_prices(&self, config: &FeedConfig) {
        let key = feed_key(&config.feed);
        if !self.fetch_attempted.lock().insert(key) {
            return;
        }

        for source in &config.sources {
            let adapter = self.adapters.read().get(&source.exchange).cloned();
            let Some(adapter) = adapter else { continue };
            let Some(market) = adapter.market(&source.symbol) else {
                continue;
            };

            info!(market = %market.id, exchange = %source.exchange, "fetching last price");
            match adapter.fetch_ticker(&market.id).await {
                Ok(ticker) => match ticker.last {
                    Some(last) => {
                        self.prices
                            .set(&source.exchange, &ticker.symbol, last, ticker.timestamp)
                    }
                    None => {
                        info!(market = %market.id, exchange = %source.exchange, "no last price found")
                    }
                },
                Err(e) => {
                    warn!(
                        error = ?e,
                        market = %market.id,
                        exchange = %source.exchange,
                        "failed to fetch ticker"
                    );
                }
            }
        }
    }
}

impl ValueProvider for Engine {
    fn get_value(&self, feed: FeedId) -> BoxFuture<'_, FeedValueData> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let value = inner.feed_price(feed.clone(), 0).await;
            FeedValueData { feed, value }
        })
    }

    fn get_volumes(
        &self,
        feeds: Vec<FeedId>,
        window_sec: i64,
    ) -> BoxFuture<'_, Result<Vec<FeedVolumeData>, Report<VolumeError>>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.feed_volumes(feeds, window_sec).await })
    }
}

/// Exponentially time-weighted median: weights decay with staleness
/// (`exp(-lambda * age_ms)`), then the value-sorted cumulative weight walk
/// returns the first value crossing one half.
pub(crate) fn weighted_median(
    mut samples: Vec<PriceSample>,
    lambda: f64,
    now_ms: i64,
) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by_key(|s| s.time);

    let weights: Vec<f64> = samples
        .iter()
        .map(|s| (-lambda * (now_ms - s.time) as f64).exp())
        .collect();
    let weight_sum: f64 = weights.iter().sum();

    // Every weight underflowed; fall back to the time-earliest sample.
    if weight_sum == 0.0 {
        return samples.first().map(|s| s.value);
    }

    let mut weighted: Vec<(f64, f64)> = samples
        .iter()
        .zip(&weights)
        .map(|(s, w)| (s.value, w / weight_sum))
        .collect();
    weighted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cumulative = 0.0;
    for (value, weight) in weighted {
        cumulative += weight;
        if cumulative >= 0.5 {
            return Some(value);
        }
    }

    warn!("unable to calculate weighted median");
    None
}

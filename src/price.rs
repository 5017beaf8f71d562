use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{PriceSample, now_ms};

/// Latest price per symbol per exchange. Writes for a given (symbol,
/// exchange) pair come only from that exchange's ingestor, so entries are
/// naturally serialized; readers get a cloned snapshot.
#[derive(Default)]
pub struct PriceTable {
    inner: RwLock<HashMap<String, HashMap<String, PriceSample>>>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes unconditionally; callers have already checked monotonicity.
    /// A missing timestamp defaults to now.
    pub fn set(&self, exchange: &str, symbol: &str, value: f64, timestamp: Option<i64>) {
        let sample = PriceSample {
            value,
            time: timestamp.unwrap_or_else(now_ms),
            exchange: exchange.to_owned(),
        };
        self.inner
            .write()
            .entry(symbol.to_owned())
            .or_default()
            .insert(exchange.to_owned(), sample);
    }

    pub fn get(&self, symbol: &str, exchange: &str) -> Option<PriceSample> {
        self.inner
            .read()
            .get(symbol)
            .and_then(|by_exchange| by_exchange.get(exchange))
            .cloned()
    }

    /// Timestamp of the stored sample, or 0 when none exists. Used by the
    /// polled ingestion strategy's newer-than check.
    pub fn time(&self, symbol: &str, exchange: &str) -> i64 {
        self.get(symbol, exchange).map_or(0, |sample| sample.time)
    }
}

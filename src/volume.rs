use std::collections::HashMap;
use std::sync::Arc;

use error_stack::{Report, bail};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::VolumeError;
use crate::model::{Trade, now_ms};

/// Seconds of volume history kept per (symbol, exchange).
pub const HISTORY_SEC: i64 = 3600;

/// Quote-denominated traded volume at one-second resolution for a single
/// (symbol, exchange) pair.
///
/// Buckets are addressed by absolute wall-second modulo [`HISTORY_SEC`];
/// seconds skipped between two trades are zeroed lazily when the ring
/// advances, so no background sweeper is needed.
pub struct VolumeRing {
    buckets: Vec<f64>,
    last_ts_ms: Option<i64>,
}

impl VolumeRing {
    pub fn new() -> Self {
        Self {
            buckets: vec![0.0; HISTORY_SEC as usize],
            last_ts_ms: None,
        }
    }

    /// Folds a batch of trades into the ring, in arrival order. Trades with
    /// a missing timestamp are skipped, as are trades older than the last
    /// processed one.
    pub fn process_trades(&mut self, trades: &[Trade]) {
        for trade in trades {
            let Some(ts) = trade.timestamp else {
                warn!(symbol = %trade.symbol, "trade with missing timestamp, skipping");
                continue;
            };
            if let Some(last) = self.last_ts_ms {
                if ts < last {
                    debug!(
                        timestamp = ts,
                        last_ts = last,
                        symbol = %trade.symbol,
                        "out-of-order trade, skipping"
                    );
                    continue;
                }
            }

            let t_sec = ts / 1000;
            let prev_sec = self.last_ts_ms.map_or(t_sec, |last| last / 1000);

            if t_sec - prev_sec >= HISTORY_SEC {
                self.buckets.fill(0.0);
            } else {
                for t in (prev_sec + 1)..=t_sec {
                    self.buckets[(t.rem_euclid(HISTORY_SEC)) as usize] = 0.0;
                }
            }

            self.buckets[(t_sec.rem_euclid(HISTORY_SEC)) as usize] += trade.amount * trade.price;
            self.last_ts_ms = Some(ts);
        }
    }

    /// Total volume over the trailing `window_sec` seconds.
    pub fn get_volume(&self, window_sec: i64) -> Result<f64, Report<VolumeError>> {
        self.volume_at(now_ms(), window_sec)
    }

    /// The window starts at wall-clock now but ends (exclusively) at the last
    /// observed trade second: buckets past the last trade were lazily zeroed
    /// by an arbitrarily stale writer and must not be read. An empty range
    /// means no recent volume and sums to zero.
    pub(crate) fn volume_at(&self, now_ms: i64, window_sec: i64) -> Result<f64, Report<VolumeError>> {
        if window_sec > HISTORY_SEC {
            bail!(VolumeError::BadWindow {
                window_sec,
                history_sec: HISTORY_SEC,
            });
        }
        let Some(last) = self.last_ts_ms else {
            return Ok(0.0);
        };

        let start = now_ms / 1000 - window_sec;
        let end = last / 1000;

        let mut volume = 0.0;
        for t in start..end {
            volume += self.buckets[(t.rem_euclid(HISTORY_SEC)) as usize];
        }
        Ok(volume)
    }
}

impl Default for VolumeRing {
    fn default() -> Self {
        Self::new()
    }
}

/// All volume rings, keyed symbol → exchange. Each ring is mutated only by
/// the owning exchange's ingestor; the outer map lock is never held while a
/// ring is being updated or read.
#[derive(Default)]
pub struct VolumeMap {
    inner: RwLock<HashMap<String, HashMap<String, Arc<Mutex<VolumeRing>>>>>,
}

impl VolumeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_trades(&self, exchange: &str, symbol: &str, trades: &[Trade]) {
        let ring = {
            let mut map = self.inner.write();
            Arc::clone(
                map.entry(symbol.to_owned())
                    .or_default()
                    .entry(exchange.to_owned())
                    .or_default(),
            )
        };
        ring.lock().process_trades(trades);
    }

    /// Per-exchange volumes for one symbol over the trailing window.
    pub fn volumes_for(
        &self,
        symbol: &str,
        window_sec: i64,
    ) -> Result<Vec<(String, f64)>, Report<VolumeError>> {
        let rings: Vec<(String, Arc<Mutex<VolumeRing>>)> = self
            .inner
            .read()
            .get(symbol)
            .map(|by_exchange| {
                by_exchange
                    .iter()
                    .map(|(exchange, ring)| (exchange.clone(), Arc::clone(ring)))
                    .collect()
            })
            .unwrap_or_default();

        let mut volumes = Vec::with_capacity(rings.len());
        for (exchange, ring) in rings {
            volumes.push((exchange, ring.lock().get_volume(window_sec)?));
        }
        Ok(volumes)
    }
}

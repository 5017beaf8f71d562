use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Logical feed identity, e.g. `(1, "BTC/USD")`. Equality is structural over
/// both fields; category 1 is the crypto category used by the reserved
/// USDT/USD conversion feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedId {
    pub category: u32,
    pub name: String,
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.name)
    }
}

/// Latest observed price for one (symbol, exchange) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSample {
    pub value: f64,
    /// Epoch milliseconds of the trade the value came from.
    pub time: i64,
    pub exchange: String,
}

/// A single executed trade as reported by an exchange.
///
/// Some exchanges omit trade timestamps; consumers must treat a missing
/// timestamp as skippable, never as fatal.
#[derive(Debug, Clone)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub amount: f64,
    pub timestamp: Option<i64>,
}

/// REST ticker snapshot used for cold-start price backfill.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub last: Option<f64>,
    pub timestamp: Option<i64>,
}

/// Exchange-native market handle resolved from a unified symbol.
#[derive(Debug, Clone)]
pub struct Market {
    pub id: String,
}

/// Query result for one feed; `value: None` is the structural absent marker
/// and serializes as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedValueData {
    pub feed: FeedId,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub exchange: String,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedVolumeData {
    pub feed: FeedId,
    pub volumes: Vec<Volume>,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_id_equality_is_structural() {
        let a = FeedId {
            category: 1,
            name: "BTC/USD".into(),
        };
        let b = FeedId {
            category: 1,
            name: "BTC/USD".into(),
        };
        let c = FeedId {
            category: 2,
            name: "BTC/USD".into(),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn feed_id_display_is_category_colon_name() {
        let feed = FeedId {
            category: 1,
            name: "ETH/USD".into(),
        };
        assert_eq!(feed.to_string(), "1:ETH/USD");
    }

    #[test]
    fn feed_id_deserializes_from_catalog_json() {
        let feed: FeedId = serde_json::from_str(r#"{"category":1,"name":"BTC/USD"}"#).unwrap();
        assert_eq!(feed.category, 1);
        assert_eq!(feed.name, "BTC/USD");
    }

    #[test]
    fn absent_value_serializes_as_null() {
        let data = FeedValueData {
            feed: FeedId {
                category: 1,
                name: "BTC/USD".into(),
            },
            value: None,
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"value\":null"));
    }
}

use std::collections::HashMap;
use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::model::FeedId;

/// The reserved feed every catalog must define; its price converts
/// USDT-quoted samples to USD.
pub fn usdt_usd_feed_id() -> FeedId {
    FeedId {
        category: 1,
        name: "USDT/USD".into(),
    }
}

pub fn feed_key(feed: &FeedId) -> String {
    format!("{}:{}", feed.category, feed.name)
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSource {
    pub exchange: String,
    /// Exchange-native unified symbol, e.g. `"BTC/USDT"`.
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed: FeedId,
    pub sources: Vec<FeedSource>,
}

/// Immutable mapping from feed key to its configured sources, loaded once at
/// startup from the JSON catalog.
#[derive(Debug, Default)]
pub struct FeedRegistry {
    by_key: HashMap<String, FeedConfig>,
}

impl FeedRegistry {
    pub fn load(dir: &Path, network: &str) -> Result<Self, Report<ConfigError>> {
        let file = if network == "local-test" {
            "test-feeds.json"
        } else {
            "feeds.json"
        };
        let path = dir.join(file);
        let raw = std::fs::read_to_string(&path)
            .change_context(ConfigError::Read)
            .attach_with(|| format!("path: {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, Report<ConfigError>> {
        let configs: Vec<FeedConfig> =
            serde_json::from_str(raw).change_context(ConfigError::Parse)?;

        for config in &configs {
            if config.sources.is_empty() {
                return Err(Report::new(ConfigError::Validation {
                    field: format!("feed {} has no sources", config.feed),
                }));
            }
        }

        let usdt_usd = usdt_usd_feed_id();
        if !configs.iter().any(|c| c.feed == usdt_usd) {
            return Err(Report::new(ConfigError::MissingConversionFeed));
        }

        let mut by_key = HashMap::new();
        for config in configs {
            by_key.insert(feed_key(&config.feed), config);
        }

        info!(
            feeds = ?by_key.keys().collect::<Vec<_>>(),
            "feed catalog loaded"
        );
        Ok(Self { by_key })
    }

    pub fn get(&self, feed: &FeedId) -> Option<&FeedConfig> {
        self.by_key.get(&feed_key(feed))
    }

    pub fn configs(&self) -> impl Iterator<Item = &FeedConfig> {
        self.by_key.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"[
        {"feed": {"category": 1, "name": "USDT/USD"},
         "sources": [{"exchange": "kraken", "symbol": "USDT/USD"}]},
        {"feed": {"category": 1, "name": "BTC/USD"},
         "sources": [{"exchange": "binance", "symbol": "BTC/USDT"},
                     {"exchange": "kraken", "symbol": "BTC/USD"}]}
    ]"#;

    #[test]
    fn parses_catalog_and_keys_by_category_and_name() {
        let registry = FeedRegistry::parse(CATALOG).unwrap();
        let btc = FeedId {
            category: 1,
            name: "BTC/USD".into(),
        };
        let config = registry.get(&btc).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].exchange, "binance");
        assert_eq!(config.sources[0].symbol, "BTC/USDT");
    }

    #[test]
    fn rejects_catalog_without_usdt_usd() {
        let raw = r#"[
            {"feed": {"category": 1, "name": "BTC/USD"},
             "sources": [{"exchange": "kraken", "symbol": "BTC/USD"}]}
        ]"#;
        assert!(FeedRegistry::parse(raw).is_err());
    }

    #[test]
    fn rejects_feed_with_empty_sources() {
        let raw = r#"[
            {"feed": {"category": 1, "name": "USDT/USD"}, "sources": []}
        ]"#;
        assert!(FeedRegistry::parse(raw).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(FeedRegistry::parse("not json").is_err());
    }

    #[test]
    fn unknown_feed_lookup_returns_none() {
        let registry = FeedRegistry::parse(CATALOG).unwrap();
        let eth = FeedId {
            category: 1,
            name: "ETH/USD".into(),
        };
        assert!(registry.get(&eth).is_none());
    }

    #[test]
    fn feed_key_format() {
        assert_eq!(feed_key(&usdt_usd_feed_id()), "1:USDT/USD");
    }
}

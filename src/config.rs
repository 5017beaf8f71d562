use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use error_stack::Report;

use crate::error::ConfigError;

/// Weighted-median staleness decay per millisecond.
pub const DEFAULT_MEDIAN_DECAY: f64 = 0.00005;
pub const DEFAULT_TRADES_HISTORY_SIZE: usize = 1000;
pub const DEFAULT_PORT: u16 = 3101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderImpl {
    Live,
    Fixed,
    Random,
}

impl fmt::Display for ProviderImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "ccxt"),
            Self::Fixed => write!(f, "fixed"),
            Self::Random => write!(f, "random"),
        }
    }
}

/// Immutable process configuration, read from the environment exactly once in
/// `main` and passed by reference from there on.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider_impl: ProviderImpl,
    pub port: u16,
    /// Selects the catalog file: `local-test` reads `test-feeds.json`.
    pub network: String,
    pub median_decay: f64,
    pub trades_history_size: usize,
    /// Exchange ids barred from the multi-symbol watch strategy; they fall
    /// through to per-symbol watch even when the adapter advertises support.
    pub multi_watch_exclude: HashSet<String>,
    pub log_format: String,
    pub config_dir: PathBuf,
}

impl Config {
    pub fn from_env(config_dir: PathBuf) -> Result<Self, Report<ConfigError>> {
        let provider_impl = match env::var("VALUE_PROVIDER_IMPL").as_deref() {
            Ok("fixed") => ProviderImpl::Fixed,
            Ok("random") => ProviderImpl::Random,
            _ => ProviderImpl::Live,
        };

        let multi_watch_exclude = env::var("MULTI_SYMBOL_WATCH_EXCLUDE")
            .unwrap_or_else(|_| "bybit".into())
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            provider_impl,
            port: parse_env("VALUE_PROVIDER_CLIENT_PORT", DEFAULT_PORT)?,
            network: env::var("NETWORK").unwrap_or_else(|_| "prod".into()),
            median_decay: parse_env("MEDIAN_DECAY", DEFAULT_MEDIAN_DECAY)?,
            trades_history_size: parse_env("TRADES_HISTORY_SIZE", DEFAULT_TRADES_HISTORY_SIZE)?,
            multi_watch_exclude,
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            config_dir,
        })
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T, Report<ConfigError>> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| {
            Report::new(ConfigError::Env { name: name.into() }).attach(format!("value: {raw}"))
        }),
    }
}

#[cfg(test)]
impl Config {
    /// Config with catalog-independent defaults for engine and ingestor tests.
    pub fn for_tests() -> Self {
        Self {
            provider_impl: ProviderImpl::Live,
            port: DEFAULT_PORT,
            network: "local-test".into(),
            median_decay: DEFAULT_MEDIAN_DECAY,
            trades_history_size: DEFAULT_TRADES_HISTORY_SIZE,
            multi_watch_exclude: ["bybit".to_owned()].into_iter().collect(),
            log_format: "text".into(),
            config_dir: PathBuf::from("config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default_when_unset() {
        let port: u16 = parse_env("THIS_VARIABLE_IS_NEVER_SET_1927", 3101).unwrap();
        assert_eq!(port, 3101);
    }

    #[test]
    fn default_exclusion_contains_bybit() {
        let config = Config::for_tests();
        assert!(config.multi_watch_exclude.contains("bybit"));
        assert!(!config.multi_watch_exclude.contains("binance"));
    }
}

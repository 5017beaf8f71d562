use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read feed catalog")]
    Read,
    #[display("failed to parse feed catalog")]
    Parse,
    #[display("invalid environment variable {name}")]
    Env { name: String },
    #[display("feed catalog must provide USDT/USD sources, used for USD conversion")]
    MissingConversionFeed,
    #[display("invalid feed catalog: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
    #[display("{exchange} does not support watching trades")]
    WatchUnsupported { exchange: String },
}

/// Returned by [`crate::retry::retry`] once every attempt has failed.
#[derive(Debug, Display, Error)]
#[display("action failed after {attempts} attempts")]
pub struct RetryError {
    pub attempts: u32,
}

#[derive(Debug, Display, Error)]
pub enum VolumeError {
    #[display("requested volume for {window_sec} seconds, but only {history_sec} seconds of history are kept")]
    BadWindow { window_sec: i64, history_sec: i64 },
}

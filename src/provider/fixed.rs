use error_stack::Report;
use futures::future::BoxFuture;
use tracing::warn;

use crate::error::VolumeError;
use crate::model::{FeedId, FeedValueData, FeedVolumeData};
use crate::provider::ValueProvider;

const DEFAULT_VALUE: f64 = 0.01;

/// Test provider returning the same constant for every feed.
pub struct FixedProvider;

impl FixedProvider {
    pub fn new() -> Self {
        warn!(value = DEFAULT_VALUE, "initializing fixed provider, all feeds get the same value");
        Self
    }
}

impl Default for FixedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueProvider for FixedProvider {
    fn get_value(&self, feed: FeedId) -> BoxFuture<'_, FeedValueData> {
        Box::pin(async move {
            FeedValueData {
                feed,
                value: Some(DEFAULT_VALUE),
            }
        })
    }

    fn get_volumes(
        &self,
        _feeds: Vec<FeedId>,
        _window_sec: i64,
    ) -> BoxFuture<'_, Result<Vec<FeedVolumeData>, Report<VolumeError>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_feed_gets_the_fixed_value() {
        let provider = FixedProvider::new();
        let data = provider
            .get_value(FeedId {
                category: 1,
                name: "BTC/USD".into(),
            })
            .await;
        assert_eq!(data.value, Some(DEFAULT_VALUE));
    }

    #[tokio::test]
    async fn volumes_are_empty() {
        let provider = FixedProvider::new();
        let volumes = provider.get_volumes(Vec::new(), 60).await.unwrap();
        assert!(volumes.is_empty());
    }
}

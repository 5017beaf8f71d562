pub mod fixed;
pub mod random;

use error_stack::Report;
use futures::future::{BoxFuture, join_all};

use crate::error::VolumeError;
use crate::model::{FeedId, FeedValueData, FeedVolumeData};

/// Query surface consumed by the HTTP layer.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn ValueProvider`).
///
/// Absent values are `None`, never errors: callers always get a full
/// response even when some feeds have no data.
pub trait ValueProvider: Send + Sync {
    fn get_value(&self, feed: FeedId) -> BoxFuture<'_, FeedValueData>;

    /// Resolves all feeds concurrently; the output preserves input order.
    fn get_values(&self, feeds: Vec<FeedId>) -> BoxFuture<'_, Vec<FeedValueData>> {
        Box::pin(async move { join_all(feeds.into_iter().map(|feed| self.get_value(feed))).await })
    }

    fn get_volumes(
        &self,
        feeds: Vec<FeedId>,
        window_sec: i64,
    ) -> BoxFuture<'_, Result<Vec<FeedVolumeData>, Report<VolumeError>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fixed::FixedProvider;

    fn feed(name: &str) -> FeedId {
        FeedId {
            category: 1,
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn get_values_preserves_input_order() {
        let provider = FixedProvider::new();
        let feeds = vec![feed("BTC/USD"), feed("ETH/USD"), feed("XRP/USD")];
        let values = provider.get_values(feeds.clone()).await;
        assert_eq!(values.len(), 3);
        for (input, output) in feeds.iter().zip(&values) {
            assert_eq!(&output.feed, input);
        }
    }
}

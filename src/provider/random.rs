use error_stack::Report;
use futures::future::BoxFuture;
use rand::Rng;

use crate::error::VolumeError;
use crate::model::{FeedId, FeedValueData, FeedVolumeData};
use crate::provider::ValueProvider;

const BASE_VALUE: f64 = 0.05;

/// Test provider returning `BASE_VALUE` scaled by Uniform(0.5, 1.5).
pub struct RandomProvider;

impl ValueProvider for RandomProvider {
    fn get_value(&self, feed: FeedId) -> BoxFuture<'_, FeedValueData> {
        Box::pin(async move {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
            FeedValueData {
                feed,
                value: Some(BASE_VALUE * factor),
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
    async fn values_stay_within_the_scaled_range() {
        let provider = RandomProvider;
        for _ in 0..50 {
            let data = provider
                .get_value(FeedId {
                    category: 1,
                    name: "BTC/USD".into(),
                })
                .await;
            let value = data.value.unwrap();
            assert!(value >= BASE_VALUE * 0.5);
            assert!(value < BASE_VALUE * 1.5);
        }
    }
}

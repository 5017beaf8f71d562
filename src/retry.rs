use std::error::Error;
use std::future::Future;
use std::time::Duration;

use error_stack::Report;
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::RetryError;

const BACKOFF_MULTIPLIER: u64 = 2;

/// Runs `action` up to `max_retries` times with exponentially growing,
/// jittered backoff between attempts. The final failure is wrapped in
/// [`RetryError`] so callers can distinguish exhaustion from other errors.
pub async fn retry<T, C, F, Fut>(
    mut action: F,
    max_retries: u32,
    initial_backoff_ms: u64,
) -> Result<T, Report<RetryError>>
where
    C: Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Report<C>>>,
{
    let max_retries = max_retries.max(1);
    let mut backoff_ms = initial_backoff_ms;

    for attempt in 1..=max_retries {
        match action().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                warn!(attempt, max_retries, error = ?error, "retry attempt failed");
                if attempt == max_retries {
                    return Err(error.change_context(RetryError {
                        attempts: max_retries,
                    }));
                }
                let jittered_ms =
                    backoff_ms / 2 + rand::thread_rng().gen_range(0..=backoff_ms);
                sleep(Duration::from_millis(jittered_ms)).await;
                backoff_ms *= BACKOFF_MULTIPLIER;
            }
        }
    }

    unreachable!("retry loop always returns")
}

//! Retry with exponential backoff
//!
//! Shared by every provider client. Delay doubles per attempt starting from
//! `base_delay`; the final error is wrapped in `ProviderError::Exhausted`.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::{ProviderError, ProviderResult};

/// Run `operation` up to `max_attempts` times with exponential backoff.
///
/// The delay before retry `n` (0-based) is `base_delay * 2^n`.
pub async fn retry_with_backoff<F, Fut, T>(
    max_attempts: usize,
    base_delay: Duration,
    mut operation: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt + 1 < max_attempts {
                    let delay = base_delay * 2u32.saturating_pow(attempt as u32);
                    warn!(
                        "Provider request failed (attempt {}/{}): {e}. Retrying after {:?}",
                        attempt + 1,
                        max_attempts,
                        delay
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(ProviderError::Exhausted {
        attempts: max_attempts,
        last: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no error recorded".to_string()),
    })
}

// ============================================================================
// TESTS
// ============================================================================

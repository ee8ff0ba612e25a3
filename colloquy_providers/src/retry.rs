use rand::Rng;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff schedule: `base_delay * 2^attempt`, optionally with up
/// to 20% random jitter added on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(retry.min(16)));
        if !self.jitter || exponential.is_zero() {
            return exponential;
        }
        let max_jitter_ms = u64::try_from(exponential.as_millis() / 5).unwrap_or(u64::MAX);
        let jitter_ms = rand::rng().random_range(0..=max_jitter_ms);
        exponential.saturating_add(Duration::from_millis(jitter_ms))
    }
}

/// Successful result together with the number of retries it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Retry an async operation with exponential backoff.
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `policy` - Backoff schedule and retry budget
/// * `should_retry` - Classifies an error as transient
///
/// # Returns
/// The value and retry count if any attempt succeeds, otherwise the first
/// non-retryable error or the last error once the budget is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    mut operation: F,
    policy: &RetryPolicy,
    should_retry: P,
) -> Result<Retried<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut retries = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(Retried { value, retries }),
            Err(e) if retries < policy.max_retries && should_retry(&e) => {
                let delay = policy.delay_for(retries);
                retries += 1;
                warn!(
                    "Request failed (attempt {}/{}): {e}. Retrying after {}ms...",
                    retries,
                    policy.max_retries + 1,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

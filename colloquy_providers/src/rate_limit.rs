//! Rolling-window request throttle.
//!
//! At most `max_requests` permits are handed out in any `window`. Waiters are
//! served strictly in the order they called [`RateLimiter::acquire`]: the
//! queue lock is a fair tokio mutex and is held while the head of the queue
//! sleeps, so later callers cannot overtake it.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests,
            window,
            issued: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    #[must_use]
    pub fn per_second(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    /// Waits until a slot in the current window is free and claims it.
    pub async fn acquire(&self) {
        let mut issued = self.issued.lock().await;
        loop {
            let now = Instant::now();
            while issued
                .front()
                .is_some_and(|&at| now.duration_since(at) >= self.window)
            {
                issued.pop_front();
            }

            if issued.len() < self.max_requests {
                issued.push_back(now);
                return;
            }

            if let Some(&oldest) = issued.front() {
                let ready_at = oldest + self.window;
                debug!(
                    "Rate limit reached ({} per {:?}), waiting {:?}",
                    self.max_requests,
                    self.window,
                    ready_at.saturating_duration_since(now)
                );
                sleep_until(ready_at).await;
            }
        }
    }

    #[must_use]
    pub const fn max_requests(&self) -> usize {
        self.max_requests
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_within_limit_is_immediate() {
        let limiter = RateLimiter::per_second(10);
        let started = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_five_calls_take_two_windows_in_order() {
        let limiter = Arc::new(RateLimiter::per_second(10));
        let completed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let started = Instant::now();

        let calls = (0..25).map(|i| {
            let limiter = Arc::clone(&limiter);
            let completed = Arc::clone(&completed);
            async move {
                limiter.acquire().await;
                if let Ok(mut done) = completed.lock() {
                    done.push(i);
                }
            }
        });
        join_all(calls).await;

        assert!(started.elapsed() >= Duration::from_millis(2000));
        let order = completed.lock().map(|d| d.clone()).unwrap_or_default();
        assert_eq!(order, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn slot_frees_once_window_rolls_past_oldest() {
        let limiter = RateLimiter::new(2, Duration::from_millis(500));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.acquire().await;

        let started = Instant::now();
        limiter.acquire().await;
        // oldest permit was issued 300ms ago, so 200ms remain in its window
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200), "waited {waited:?}");
        assert!(waited < Duration::from_millis(250), "waited {waited:?}");
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(RateLimiter::per_second(0).max_requests(), 1);
    }
}

//! Token-bucket rate limiting shared between protocol tasks.
//!
//! The bucket starts full. A background task adds one token per refill
//! period (`1s / capacity`), independently of how fast tokens are consumed,
//! and never lets the bucket exceed its capacity. [`RateLimiter::close`]
//! stops the refill task and wakes every waiter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    capacity: usize,
    period: Duration,
    cancel: CancellationToken,
}

impl RateLimiter {
    /// Creates a limiter allowing `tokens_per_second` operations per second
    /// with a burst of the same size.
    ///
    /// Must be called from within a Tokio runtime: the refill task is
    /// spawned immediately.
    pub fn new(tokens_per_second: u32) -> Self {
        let capacity = tokens_per_second.max(1);
        Self::with_period(capacity as usize, Duration::from_secs(1) / capacity)
    }

    /// Creates a limiter with an explicit capacity and refill period.
    pub fn with_period(capacity: usize, period: Duration) -> Self {
        let capacity = capacity.max(1);
        let tokens = Arc::new(Semaphore::new(capacity));
        let cancel = CancellationToken::new();

        tokio::spawn(refill(
            Arc::clone(&tokens),
            capacity,
            period,
            cancel.clone(),
        ));

        Self {
            tokens,
            capacity,
            period,
            cancel,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Waits for a token. Returns false once the limiter is closed.
    pub async fn wait(&self) -> bool {
        match self.tokens.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Takes a token if one is available, without blocking.
    pub fn try_wait(&self) -> bool {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.tokens.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn refill(
    tokens: Arc<Semaphore>,
    capacity: usize,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Only this task adds permits, so check-then-add cannot overshoot.
                if tokens.available_permits() < capacity {
                    tokens.add_permits(1);
                }
            }
            _ = cancel.cancelled() => {
                debug!("Rate limiter refill stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_exactly_capacity_tokens_then_exhausted() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.try_wait());
        }
        assert!(!limiter.try_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_tick_releases_one_token() {
        let limiter = RateLimiter::new(4);
        assert_eq!(limiter.period(), Duration::from_millis(250));

        for _ in 0..4 {
            assert!(limiter.try_wait());
        }
        assert!(!limiter.try_wait());

        tokio::time::sleep(Duration::from_millis(260)).await;

        assert!(limiter.try_wait());
        assert!(!limiter.try_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_never_exceeds_capacity() {
        let limiter = RateLimiter::new(3);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_refill() {
        let limiter = RateLimiter::with_period(1, Duration::from_secs(2));
        assert!(limiter.wait().await);

        let start = tokio::time::Instant::now();
        assert!(limiter.wait().await);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let limiter = Arc::new(RateLimiter::with_period(1, Duration::from_secs(3600)));
        assert!(limiter.try_wait());

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.wait().await })
        };

        tokio::task::yield_now().await;
        limiter.close();

        assert!(!waiter.await.unwrap());
        assert!(limiter.is_closed());
        assert!(!limiter.try_wait());
    }

    #[tokio::test]
    async fn test_zero_rate_is_clamped() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_wait());
    }
}

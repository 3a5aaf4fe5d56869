//! Token-bucket rate limiter with a burst of one.
//!
//! Callers queue on an internal schedule: each `wait` reserves the next
//! free slot and sleeps until it arrives. A limiter created at rate `r`
//! admits the first caller immediately and subsequent callers every `1/r`
//! seconds.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Cancellable token-bucket limiter (burst 1).
pub struct RateLimiter {
    period: Duration,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    /// Creates a limiter admitting `rps` requests per second.
    ///
    /// Non-positive rates are clamped to a very slow trickle rather than
    /// dividing by zero; config validation rejects them upstream.
    pub fn new(rps: f64) -> Self {
        let rps = if rps > 0.0 { rps } else { f64::MIN_POSITIVE };
        let period = Duration::from_secs_f64((1.0 / rps).min(86_400.0));
        Self {
            period,
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Blocks until a token is available or `cancel` fires.
    ///
    /// The sleep itself is the suspension point; the internal lock is only
    /// held long enough to claim a slot, so concurrent waiters on the same
    /// limiter serialise at the configured rate.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let wake = self.reserve();

        if wake <= Instant::now() {
            // Fast path; still honour a token that is already cancelled.
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep_until(wake) => Ok(()),
            _ = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    /// Claims the next free slot and advances the schedule by one period.
    fn reserve(&self) -> Instant {
        let mut next = self
            .next_free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let wake = (*next).max(now);
        *next = wake + self.period;
        wake
    }

    /// The spacing between admitted requests.
    pub fn period(&self) -> Duration {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn first_token_is_immediate() {
        let lim = RateLimiter::new(1.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        lim.wait(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn tokens_are_spaced_by_rate() {
        // 20 RPS → 50ms spacing; 4 extra waits ≥ 200ms total.
        let lim = RateLimiter::new(20.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..5 {
            lim.wait(&cancel).await.unwrap();
        }
        assert!(
            start.elapsed() >= Duration::from_millis(200),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn wait_returns_cancelled_promptly() {
        // 0.1 RPS → 10s until the second token.
        let lim = Arc::new(RateLimiter::new(0.1));
        let cancel = CancellationToken::new();
        lim.wait(&cancel).await.unwrap();

        let waiting = {
            let lim = Arc::clone(&lim);
            let cancel = cancel.clone();
            tokio::spawn(async move { lim.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = Instant::now();
        cancel.cancel();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn concurrent_waiters_serialise() {
        let lim = Arc::new(RateLimiter::new(50.0)); // 20ms period
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lim = Arc::clone(&lim);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { lim.wait(&cancel).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // 3 waiters behind the first → at least 60ms.
        assert!(
            start.elapsed() >= Duration::from_millis(60),
            "elapsed: {:?}",
            start.elapsed()
        );
    }
}

//! Per-domain backoff after transient failures.
//!
//! Each failing domain accumulates `{attempts, next_allowed}` state;
//! dispatch waits out `next_allowed` before touching the domain again. The
//! delay grows as a jittered exponential: uniform between the initial
//! delay and an exponential ceiling, both clamped to the configured
//! maximum. A success wipes the domain's state entirely.
//!
//! Locking is two-level: the outer map lock covers "which domains exist",
//! an inner per-domain lock covers that domain's counters. The two are
//! never held together, so updates on different domains proceed
//! concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::error::AppError;

#[derive(Debug)]
struct DomainBackoff {
    attempts: u32,
    next_allowed: Instant,
}

/// Tracks backoff state per domain.
pub struct BackoffRegistry {
    domains: Mutex<HashMap<String, Arc<Mutex<DomainBackoff>>>>,
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    max_attempts: u32,
}

impl BackoffRegistry {
    pub fn new(cfg: &BackoffConfig) -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            initial_ms: cfg.initial_ms,
            max_ms: cfg.max_ms,
            multiplier: cfg.multiplier,
            max_attempts: cfg.max_attempts,
        }
    }

    /// Notes a transient error for the domain and returns the delay that
    /// will be applied before the next attempt.
    pub fn record_error(&self, domain: &str) -> Duration {
        let state = {
            let mut domains = lock(&self.domains);
            Arc::clone(domains.entry(domain.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(DomainBackoff {
                    attempts: 0,
                    next_allowed: Instant::now(),
                }))
            }))
        };

        let mut state = lock(&state);
        state.attempts += 1;
        let delay = self.jittered_delay(state.attempts);
        state.next_allowed = Instant::now() + delay;
        delay
    }

    /// Clears the domain's backoff state after a success.
    pub fn record_success(&self, domain: &str) {
        lock(&self.domains).remove(domain);
    }

    /// Blocks until the domain's backoff delay has elapsed, or `cancel`
    /// fires. Returns immediately for domains with no state.
    ///
    /// A domain that has both served its delay and exhausted
    /// `max_attempts` is evicted here so the map stays bounded.
    pub async fn wait(&self, cancel: &CancellationToken, domain: &str) -> Result<(), AppError> {
        let state = match lock(&self.domains).get(domain).map(Arc::clone) {
            Some(state) => state,
            None => return Ok(()),
        };

        let (next_allowed, attempts) = {
            let state = lock(&state);
            (state.next_allowed, state.attempts)
        };

        let now = Instant::now();
        if next_allowed <= now {
            if attempts >= self.max_attempts {
                lock(&self.domains).remove(domain);
            }
            return Ok(());
        }

        let remaining = next_allowed - now;
        tokio::select! {
            _ = tokio::time::sleep(remaining) => Ok(()),
            _ = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    /// Current consecutive-failure count for a domain.
    pub fn attempts(&self, domain: &str) -> u32 {
        let state = lock(&self.domains).get(domain).map(Arc::clone);
        match state {
            Some(state) => lock(&state).attempts,
            None => 0,
        }
    }

    /// The configured maximum attempt count.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay for attempt `k`: uniform on `[initial, ceiling]` where
    /// `ceiling = initial * multiplier^(k-1)`, all clamped to `max`.
    /// Attempt 1 has `ceiling == initial`, so the delay is exactly the
    /// initial delay.
    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_ms as f64;
        let max = self.max_ms as f64;

        let mut ceiling = base;
        for _ in 1..attempt {
            ceiling *= self.multiplier;
            if ceiling > max {
                ceiling = max;
                break;
            }
        }

        let mut jittered = base + rand::thread_rng().gen::<f64>() * (ceiling - base);
        if jittered > max {
            jittered = max;
        }

        Duration::from_millis(jittered as u64)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_ms,
            max_ms,
            multiplier,
            max_attempts,
        }
    }

    #[test]
    fn first_error_delay_equals_initial() {
        let reg = BackoffRegistry::new(&config(100, 5000, 2.0, 3));
        let delay = reg.record_error("example.com");
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn delays_stay_within_bounds() {
        let reg = BackoffRegistry::new(&config(100, 500, 3.0, 10));
        for attempt in 1..=10 {
            let delay = reg.record_error("example.com");
            assert!(
                delay >= Duration::from_millis(100) && delay <= Duration::from_millis(500),
                "attempt {attempt}: {delay:?}"
            );
        }
    }

    #[test]
    fn attempts_count_consecutive_errors() {
        let reg = BackoffRegistry::new(&config(10, 100, 2.0, 5));
        assert_eq!(reg.attempts("example.com"), 0);
        for k in 1..=4u32 {
            reg.record_error("example.com");
            assert_eq!(reg.attempts("example.com"), k);
        }
    }

    #[test]
    fn success_resets_attempts() {
        let reg = BackoffRegistry::new(&config(10, 100, 2.0, 5));
        reg.record_error("example.com");
        reg.record_error("example.com");
        reg.record_success("example.com");
        assert_eq!(reg.attempts("example.com"), 0);

        reg.record_error("example.com");
        assert_eq!(reg.attempts("example.com"), 1);
    }

    #[test]
    fn domains_are_independent() {
        let reg = BackoffRegistry::new(&config(10, 100, 2.0, 5));
        reg.record_error("a.example");
        reg.record_error("a.example");
        reg.record_error("b.example");
        assert_eq!(reg.attempts("a.example"), 2);
        assert_eq!(reg.attempts("b.example"), 1);

        reg.record_success("a.example");
        assert_eq!(reg.attempts("a.example"), 0);
        assert_eq!(reg.attempts("b.example"), 1);
    }

    #[tokio::test]
    async fn wait_returns_immediately_without_state() {
        let reg = BackoffRegistry::new(&config(10_000, 60_000, 2.0, 3));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        reg.wait(&cancel, "unseen.example").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn wait_sleeps_out_the_delay() {
        let reg = BackoffRegistry::new(&config(80, 80, 2.0, 3));
        let cancel = CancellationToken::new();
        reg.record_error("example.com");

        let start = Instant::now();
        reg.wait(&cancel, "example.com").await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(70),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn wait_keeps_state_below_max_attempts() {
        let reg = BackoffRegistry::new(&config(10, 50, 2.0, 3));
        let cancel = CancellationToken::new();
        reg.record_error("example.com");
        tokio::time::sleep(Duration::from_millis(60)).await;

        reg.wait(&cancel, "example.com").await.unwrap();
        // Delay expired but attempts < max: state survives for further errors.
        assert_eq!(reg.attempts("example.com"), 1);
    }

    #[tokio::test]
    async fn wait_evicts_exhausted_expired_entries() {
        let reg = BackoffRegistry::new(&config(10, 30, 2.0, 2));
        let cancel = CancellationToken::new();
        reg.record_error("example.com");
        reg.record_error("example.com");
        assert_eq!(reg.attempts("example.com"), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        reg.wait(&cancel, "example.com").await.unwrap();
        assert_eq!(reg.attempts("example.com"), 0);
    }

    #[tokio::test]
    async fn wait_honours_cancellation() {
        let reg = Arc::new(BackoffRegistry::new(&config(10_000, 60_000, 2.0, 3)));
        let cancel = CancellationToken::new();
        reg.record_error("example.com");

        let waiting = {
            let reg = Arc::clone(&reg);
            let cancel = cancel.clone();
            tokio::spawn(async move { reg.wait(&cancel, "example.com").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        cancel.cancel();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}

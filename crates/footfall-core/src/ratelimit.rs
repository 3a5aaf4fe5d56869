//! Per-domain token-bucket rate limiting.
//!
//! One limiter per domain, created lazily on first sight at either the
//! domain's configured override rate or the registry default. Limiters are
//! never destroyed for the lifetime of the registry; a hot-reload replaces
//! the registry wholesale instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::limiter::RateLimiter;

/// Registry of per-domain request rate limiters.
pub struct RateLimitRegistry {
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    default_rps: f64,
    per_domain: HashMap<String, f64>,
}

impl RateLimitRegistry {
    pub fn new(default_rps: f64, per_domain: HashMap<String, f64>) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            default_rps,
            per_domain,
        }
    }

    /// Blocks until the domain's limiter admits the request, or `cancel`
    /// fires.
    pub async fn wait(&self, cancel: &CancellationToken, domain: &str) -> Result<(), AppError> {
        let limiter = self.limiter_for(domain);
        limiter.wait(cancel).await
    }

    /// The effective requests-per-second rate for a domain.
    pub fn rps_for(&self, domain: &str) -> f64 {
        self.per_domain
            .get(domain)
            .copied()
            .unwrap_or(self.default_rps)
    }

    fn limiter_for(&self, domain: &str) -> Arc<RateLimiter> {
        // Fast path: the domain has been seen before.
        {
            let limiters = self
                .limiters
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(lim) = limiters.get(domain) {
                return Arc::clone(lim);
            }
        }

        let mut limiters = self
            .limiters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another task may have created it between the two locks.
        if let Some(lim) = limiters.get(domain) {
            return Arc::clone(lim);
        }

        let lim = Arc::new(RateLimiter::new(self.rps_for(domain)));
        limiters.insert(domain.to_string(), Arc::clone(&lim));
        lim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn registry(default_rps: f64, overrides: &[(&str, f64)]) -> RateLimitRegistry {
        let per_domain = overrides
            .iter()
            .map(|(d, r)| (d.to_string(), *r))
            .collect();
        RateLimitRegistry::new(default_rps, per_domain)
    }

    #[test]
    fn override_takes_precedence_over_default() {
        let reg = registry(1.0, &[("slow.example", 0.25)]);
        assert_eq!(reg.rps_for("slow.example"), 0.25);
        assert_eq!(reg.rps_for("other.example"), 1.0);
    }

    #[test]
    fn limiter_is_created_once_per_domain() {
        let reg = registry(1.0, &[]);
        let a = reg.limiter_for("example.com");
        let b = reg.limiter_for("example.com");
        assert!(Arc::ptr_eq(&a, &b));

        let c = reg.limiter_for("other.example");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn wait_enforces_domain_rate() {
        let reg = registry(20.0, &[]); // 50ms spacing
        let cancel = CancellationToken::new();

        let start = Instant::now();
        reg.wait(&cancel, "example.com").await.unwrap();
        reg.wait(&cancel, "example.com").await.unwrap();
        reg.wait(&cancel, "example.com").await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn domains_do_not_throttle_each_other() {
        let reg = registry(5.0, &[]); // 200ms spacing within a domain
        let cancel = CancellationToken::new();

        reg.wait(&cancel, "a.example").await.unwrap();
        let start = Instant::now();
        reg.wait(&cancel, "b.example").await.unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn wait_honours_cancellation() {
        let reg = Arc::new(registry(0.1, &[])); // 10s spacing
        let cancel = CancellationToken::new();
        reg.wait(&cancel, "example.com").await.unwrap();

        let waiting = {
            let reg = Arc::clone(&reg);
            let cancel = cancel.clone();
            tokio::spawn(async move { reg.wait(&cancel, "example.com").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
    }
}

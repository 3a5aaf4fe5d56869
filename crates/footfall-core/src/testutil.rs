//! Test utilities: a scriptable mock driver and config builders.
//!
//! Handwritten mocks, `Arc<Mutex<_>>`-backed for interior mutability so
//! tests can assert on recorded calls after the fact.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PacingMode, TargetConfig};
use crate::driver::{Driver, DriverError};
use crate::task::{Task, TaskKind, TaskResult};

/// Scripted outcome for one mock execution.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Status(u16),
    Error(DriverError),
}

/// Mock driver that replays a scripted sequence of outcomes.
///
/// Each call pops the next script entry; once the script is exhausted
/// every call returns the configured fallback status. Calls are recorded
/// for later assertions.
#[derive(Clone)]
pub struct MockDriver {
    script: Arc<Mutex<Vec<MockOutcome>>>,
    fallback_status: u16,
    delay: Duration,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockDriver {
    /// A driver that always returns the given status.
    pub fn with_status(status: u16) -> Self {
        Self {
            script: Arc::new(Mutex::new(Vec::new())),
            fallback_status: status,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A driver that replays `script` then falls back to `fallback`.
    pub fn with_script(script: Vec<MockOutcome>, fallback: u16) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            fallback_status: fallback,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Adds a fixed per-call latency (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn execute(&self, cancel: &CancellationToken, task: Task) -> TaskResult {
        self.calls.lock().unwrap().push(task.url.clone());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return TaskResult::from_error(task, self.delay, DriverError::Cancelled);
                }
            }
        }

        let outcome = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                MockOutcome::Status(self.fallback_status)
            } else {
                script.remove(0)
            }
        };

        match outcome {
            MockOutcome::Status(code) => TaskResult {
                task,
                status_code: code,
                duration: self.delay,
                bytes_read: 64,
                error: None,
            },
            MockOutcome::Error(err) => TaskResult::from_error(task, self.delay, err),
        }
    }
}

/// A single-target HTTP test target.
pub fn make_target(url: &str, weight: u32) -> TargetConfig {
    TargetConfig {
        url: url.to_string(),
        weight,
        kind: TaskKind::Http,
        ..TargetConfig::default()
    }
}

/// A config tuned for fast engine tests: one HTTP target, immediate
/// pacing, generous limits, and sub-second backoff delays.
pub fn test_config(url: &str) -> Config {
    let mut cfg = Config {
        targets: vec![make_target(url, 1)],
        ..Config::default()
    };
    cfg.pacing.mode = PacingMode::Human;
    cfg.pacing.min_delay_ms = 0;
    cfg.pacing.max_delay_ms = 0;
    cfg.limits.max_workers = 10;
    cfg.limits.max_browser_workers = 2;
    cfg.limits.cpu_threshold_pct = 100.0;
    cfg.limits.memory_threshold_mb = u64::MAX;
    cfg.rate_limits.default_rps = 1000.0;
    cfg.backoff.initial_ms = 100;
    cfg.backoff.max_ms = 500;
    cfg.backoff.multiplier = 2.0;
    cfg.backoff.max_attempts = 3;
    cfg
}

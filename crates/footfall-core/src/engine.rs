//! The dispatch loop.
//!
//! One engine task walks the gate sequence — pacing, resource admission,
//! target pick, worker slot — and spawns a dispatch task per request. The
//! per-domain gates (backoff, rate limit) run inside the spawned task so a
//! slow domain never stalls the loop or holds a worker slot hostage for
//! other domains.
//!
//! Selector and registries live behind atomic pointers ([`ArcSwap`]):
//! hot-reload swaps them wholesale while readers keep whatever snapshot
//! they already loaded. A dispatch snapshots the registries once at entry,
//! so its `wait` and the matching `record_*` always touch the same
//! registry even if a reload lands mid-flight.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffRegistry;
use crate::classify::{classify_error, classify_status, ErrorClass};
use crate::config::Config;
use crate::driver::Driver;
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::output::ResultWriter;
use crate::pool::WorkerPool;
use crate::ratelimit::RateLimitRegistry;
use crate::resource::ResourceMonitor;
use crate::scheduler::Scheduler;
use crate::selector::Selector;
use crate::task::{Task, TaskKind};
use crate::util::hostname_of;

/// Orchestrates the dispatch pipeline.
pub struct Engine {
    cfg: ArcSwap<Config>,
    selector: ArcSwap<Selector>,
    rl: ArcSwap<RateLimitRegistry>,
    backoff: ArcSwap<BackoffRegistry>,
    scheduler: Scheduler,
    pool: WorkerPool,
    monitor: ResourceMonitor,
    drivers: HashMap<TaskKind, Arc<dyn Driver>>,
    metrics: Arc<Metrics>,
    writer: Option<ResultWriter>,
}

impl Engine {
    /// Wires an engine from a validated config and an injected driver set.
    pub async fn new(
        cfg: Config,
        metrics: Arc<Metrics>,
        drivers: HashMap<TaskKind, Arc<dyn Driver>>,
    ) -> Result<Engine, AppError> {
        let selector = Selector::new(&cfg.targets)?;

        let writer = if cfg.output.enabled {
            Some(ResultWriter::new(&cfg.output).await?)
        } else {
            None
        };

        let engine = Engine {
            selector: ArcSwap::from_pointee(selector),
            rl: ArcSwap::from_pointee(RateLimitRegistry::new(
                cfg.rate_limits.default_rps,
                cfg.rate_limits.per_domain_map(),
            )),
            backoff: ArcSwap::from_pointee(BackoffRegistry::new(&cfg.backoff)),
            scheduler: Scheduler::new(cfg.pacing.clone()),
            pool: WorkerPool::new(cfg.limits.max_workers, cfg.limits.max_browser_workers),
            monitor: ResourceMonitor::new(
                cfg.limits.cpu_threshold_pct,
                cfg.limits.memory_threshold_mb,
            ),
            drivers,
            metrics,
            writer,
            cfg: ArcSwap::from_pointee(cfg),
        };

        Ok(engine)
    }

    /// Runs the dispatch loop until `cancel` fires, then drains in-flight
    /// tasks and closes the result output.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.monitor.start(cancel.clone());
        self.scheduler.start(cancel.clone());

        {
            let cfg = self.cfg.load();
            tracing::info!(
                mode = %cfg.pacing.mode,
                max_workers = cfg.limits.max_workers,
                targets = cfg.targets.len(),
                "engine started"
            );
        }

        loop {
            // --- Pacing delay ---
            if self.scheduler.wait(&cancel).await.is_err() {
                break;
            }

            let task = self.selector.load().pick();

            // --- Resource gate ---
            if self.monitor.admit(&cancel).await.is_err() {
                break;
            }

            // --- Worker slot ---
            // Backoff and rate-limit waits happen inside the spawned task
            // so a slow or throttled domain does not stall the loop.
            if self.pool.acquire(&cancel, task.kind).await.is_err() {
                break;
            }

            let engine = Arc::clone(&self);
            let task_cancel = cancel.clone();
            tokio::spawn(async move {
                let kind = task.kind;
                engine.dispatch(task_cancel, task).await;
                engine.pool.release(kind);
            });
        }

        tracing::info!("engine shutting down, waiting for in-flight tasks");
        self.pool.drain().await;
        if let Some(writer) = &self.writer {
            writer.close().await;
        }
        tracing::info!("engine stopped");
    }

    async fn dispatch(&self, cancel: CancellationToken, task: Task) {
        let driver = match self.drivers.get(&task.kind) {
            Some(driver) => Arc::clone(driver),
            None => {
                tracing::error!(kind = %task.kind, "unknown driver type");
                return;
            }
        };

        let host = hostname_of(&task.url);

        // Snapshot the registries once so a concurrent reload cannot swap
        // them between the waits and the record calls below.
        let rl = self.rl.load_full();
        let backoff = self.backoff.load_full();

        // --- Backoff wait ---
        if backoff.wait(&cancel, &host).await.is_err() {
            return;
        }

        // --- Per-domain rate limit ---
        if rl.wait(&cancel, &host).await.is_err() {
            return;
        }

        tracing::debug!(url = %task.url, kind = %task.kind, "dispatching task");

        let result = driver.execute(&cancel, task).await;

        self.metrics.record(&result);
        if let Some(writer) = &self.writer {
            writer.send(&result);
        }

        if let Some(err) = &result.error {
            match classify_error(Some(err)) {
                ErrorClass::Fatal => {}
                ErrorClass::Transient => {
                    if backoff.attempts(&host) < backoff.max_attempts() {
                        let delay = backoff.record_error(&host);
                        tracing::warn!(
                            host = %host,
                            backoff_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient error, backing off"
                        );
                    } else {
                        tracing::error!(
                            host = %host,
                            error = %err,
                            "max backoff attempts reached, skipping domain temporarily"
                        );
                    }
                }
                // Unreachable with the current classifier; kept so an
                // evolved classifier cannot silently fall through.
                ErrorClass::Permanent | ErrorClass::None => {
                    tracing::error!(url = %result.task.url, error = %err, "permanent error, skipping");
                }
            }
            return;
        }

        match classify_status(result.status_code) {
            ErrorClass::Transient => {
                if backoff.attempts(&host) < backoff.max_attempts() {
                    let delay = backoff.record_error(&host);
                    tracing::warn!(
                        host = %host,
                        status = result.status_code,
                        backoff_ms = delay.as_millis() as u64,
                        "transient HTTP error, backing off"
                    );
                }
            }
            ErrorClass::Permanent => {
                tracing::error!(
                    url = %result.task.url,
                    status = result.status_code,
                    "permanent HTTP error, skipping"
                );
            }
            ErrorClass::None => {
                backoff.record_success(&host);
                tracing::info!(
                    url = %result.task.url,
                    kind = %result.task.kind,
                    status = result.status_code,
                    duration_ms = result.duration.as_millis() as u64,
                    bytes = result.bytes_read,
                    "task complete"
                );
            }
            ErrorClass::Fatal => {}
        }
    }

    /// Atomically applies a new configuration to the running engine.
    ///
    /// Targets, rate limits, backoff, and pacing parameters update
    /// in-place; accumulated per-domain limiter and backoff state is
    /// deliberately dropped with the old registries. Pacing-mode, worker,
    /// and resource-limit changes require a restart and only log.
    pub fn reload(&self, new_cfg: Config) -> Result<(), AppError> {
        let old = self.cfg.load();

        // Build the new selector first: an invalid target set must leave
        // every piece of live state untouched.
        let selector = Selector::new(&new_cfg.targets)
            .map_err(|e| AppError::Config(format!("hot-reload: {e}")))?;

        log_target_diff(&old.targets, &new_cfg.targets);

        self.selector.store(Arc::new(selector));
        self.rl.store(Arc::new(RateLimitRegistry::new(
            new_cfg.rate_limits.default_rps,
            new_cfg.rate_limits.per_domain_map(),
        )));
        self.backoff
            .store(Arc::new(BackoffRegistry::new(&new_cfg.backoff)));

        self.scheduler.update_pacing(&new_cfg.pacing);

        if old.limits != new_cfg.limits {
            tracing::warn!(
                "hot-reload: resource limit changes (workers, cpu, memory) require restart"
            );
        }

        self.cfg.store(Arc::new(new_cfg));
        tracing::info!("hot-reload: config reloaded");
        Ok(())
    }

    /// The live configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.cfg.load_full()
    }

    #[cfg(test)]
    pub(crate) fn backoff_attempts(&self, host: &str) -> u32 {
        self.backoff.load().attempts(host)
    }

    #[cfg(test)]
    pub(crate) fn pick(&self) -> Task {
        self.selector.load().pick()
    }
}

fn log_target_diff(old: &[crate::config::TargetConfig], new: &[crate::config::TargetConfig]) {
    let old_urls: std::collections::HashSet<&str> =
        old.iter().map(|t| t.url.as_str()).collect();
    let new_urls: std::collections::HashSet<&str> =
        new.iter().map(|t| t.url.as_str()).collect();

    for url in new_urls.difference(&old_urls) {
        tracing::info!(url = %url, "hot-reload: target added");
    }
    for url in old_urls.difference(&new_urls) {
        tracing::info!(url = %url, "hot-reload: target removed");
    }
}

//! Host resource monitoring and the dispatch admission gate.
//!
//! A background task samples CPU utilisation and memory-in-use every
//! couple of seconds and publishes the latest reading through a watch
//! channel. [`ResourceMonitor::admit`] parks dispatch while either reading
//! exceeds its threshold and wakes on the next sample that clears it —
//! every send wakes all waiters, so nobody polls.

use std::time::Duration;

use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Spacing between the two CPU refreshes a utilisation reading needs.
const CPU_MEASURE_INTERVAL: Duration = Duration::from_millis(200);

/// One point-in-time reading of host resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub mem_used_mb: u64,
    pub over_limit: bool,
}

/// Polls CPU and memory usage; gates dispatch while over threshold.
pub struct ResourceMonitor {
    cpu_threshold_pct: f64,
    mem_threshold_mb: u64,
    // None until the first sample lands; doubles as the readiness signal.
    sample_tx: watch::Sender<Option<ResourceSample>>,
}

impl ResourceMonitor {
    pub fn new(cpu_threshold_pct: f64, mem_threshold_mb: u64) -> Self {
        let (sample_tx, _) = watch::channel(None);
        Self {
            cpu_threshold_pct,
            mem_threshold_mb,
            sample_tx,
        }
    }

    /// Spawns the background sampler; it stops when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) {
        let tx = self.sample_tx.clone();
        let cpu_threshold = self.cpu_threshold_pct;
        let mem_threshold = self.mem_threshold_mb;

        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                let sample = take_sample(&mut sys, cpu_threshold, mem_threshold).await;
                if sample.over_limit {
                    tracing::debug!(
                        cpu_pct = sample.cpu_pct,
                        mem_used_mb = sample.mem_used_mb,
                        "resource monitor: over threshold, dispatch paused"
                    );
                }
                let _ = tx.send(Some(sample));

                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Blocks until resources are below threshold or `cancel` fires.
    ///
    /// Waits for the first sample before evaluating, then re-checks on
    /// every published sample — at most one poll interval after the system
    /// drops under threshold.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let mut rx = self.sample_tx.subscribe();
        loop {
            let latest: Option<ResourceSample> = *rx.borrow_and_update();
            match latest.map(|s| s.over_limit) {
                Some(false) => return Ok(()),
                // Over limit, or no sample yet: wait for the next reading.
                Some(true) | None => {}
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sampler gone; only happens on shutdown.
                        return Err(AppError::Cancelled);
                    }
                }
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
    }

    /// Most recent reading, if the first poll has completed.
    pub fn stats(&self) -> Option<ResourceSample> {
        *self.sample_tx.borrow()
    }
}

async fn take_sample(sys: &mut System, cpu_threshold: f64, mem_threshold_mb: u64) -> ResourceSample {
    // CPU utilisation is a delta between two refreshes.
    sys.refresh_cpu();
    tokio::time::sleep(CPU_MEASURE_INTERVAL).await;
    sys.refresh_cpu();
    let cpu_pct = f64::from(sys.global_cpu_info().cpu_usage());

    sys.refresh_memory();
    let mem_used_mb = sys.used_memory() / (1024 * 1024);

    ResourceSample {
        cpu_pct,
        mem_used_mb,
        over_limit: cpu_pct >= cpu_threshold || mem_used_mb >= mem_threshold_mb,
    }
}

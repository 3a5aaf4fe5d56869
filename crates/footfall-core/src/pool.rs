//! Dispatch concurrency limits.
//!
//! A global semaphore bounds in-flight tasks of every kind; a second,
//! smaller semaphore additionally bounds browser tasks (each one costs a
//! whole Chromium tab). An outstanding-work counter lets shutdown drain
//! every spawned task before the engine returns.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::task::TaskKind;

/// Concurrency gate for spawned dispatch tasks.
pub struct WorkerPool {
    global: Semaphore,
    browser: Semaphore,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl WorkerPool {
    pub fn new(max_workers: usize, max_browser_workers: usize) -> Self {
        Self {
            global: Semaphore::new(max_workers),
            browser: Semaphore::new(max_browser_workers),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Obtains a global slot (and a browser slot for browser tasks).
    /// Blocks until slots are available or `cancel` fires.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        kind: TaskKind,
    ) -> Result<(), AppError> {
        tokio::select! {
            permit = self.global.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(AppError::Cancelled),
            },
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        }

        if kind == TaskKind::Browser {
            tokio::select! {
                permit = self.browser.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        self.global.add_permits(1);
                        return Err(AppError::Cancelled);
                    }
                },
                _ = cancel.cancelled() => {
                    // Give the global slot back before bailing out.
                    self.global.add_permits(1);
                    return Err(AppError::Cancelled);
                }
            }
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Frees the slots acquired for the given task kind.
    pub fn release(&self, kind: TaskKind) {
        if kind == TaskKind::Browser {
            self.browser.add_permits(1);
        }
        self.global.add_permits(1);

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Blocks until every acquired slot has been released.
    pub async fn drain(&self) {
        loop {
            // Register interest before the check so a release between the
            // two cannot be missed.
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of tasks currently holding a slot.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

//! Inter-request pacing.
//!
//! Three modes:
//!
//! - **human** — a uniform random delay between requests.
//! - **rate_limited** — a token bucket at `requests_per_minute / 60` RPS
//!   plus a small anti-herd jitter.
//! - **scheduled** — cron-driven windows; inside a window the scheduler
//!   behaves like rate_limited at the window's own rate, outside it
//!   dispatch idles on a fixed re-check cadence.
//!
//! The active token bucket sits behind an atomic pointer so hot-reload and
//! the cron driver can substitute it without locks; `wait` takes a single
//! atomic load.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{PacingConfig, PacingMode, ScheduleEntry};
use crate::error::AppError;
use crate::limiter::RateLimiter;

/// How long `wait` idles before re-checking window state in scheduled
/// mode, outside any window.
const WINDOW_RECHECK: Duration = Duration::from_secs(5);
/// Upper bound of the anti-herd jitter added after each token.
const HERD_JITTER_MS: u64 = 200;

/// Pacing gate for the dispatch loop.
pub struct Scheduler {
    // The mode is fixed for the scheduler's lifetime; hot-reload may only
    // adjust parameters within it.
    mode: PacingMode,
    params: ArcSwap<PacingConfig>,
    limiter: Arc<ArcSwapOption<RateLimiter>>,
    in_window: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(cfg: PacingConfig) -> Self {
        let limiter = match cfg.mode {
            PacingMode::RateLimited => Some(Arc::new(RateLimiter::new(
                cfg.requests_per_minute / 60.0,
            ))),
            _ => None,
        };

        Self {
            mode: cfg.mode,
            params: ArcSwap::from_pointee(cfg),
            limiter: Arc::new(ArcSwapOption::new(limiter)),
            in_window: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> PacingMode {
        self.mode
    }

    /// True while a cron window is open (scheduled mode only).
    pub fn in_window(&self) -> bool {
        self.in_window.load(Ordering::Acquire)
    }

    /// Launches background machinery needed by the mode (the cron driver
    /// for scheduled pacing). Other modes need none.
    pub fn start(&self, cancel: CancellationToken) {
        if self.mode != PacingMode::Scheduled {
            return;
        }

        let entries = self.params.load().schedule.clone();
        let limiter = Arc::clone(&self.limiter);
        let in_window = Arc::clone(&self.in_window);
        tokio::spawn(run_cron_driver(entries, limiter, in_window, cancel));
    }

    /// Blocks until it is appropriate to dispatch the next request.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        match self.mode {
            PacingMode::Human => self.human_wait(cancel).await,
            PacingMode::RateLimited => self.rate_limited_wait(cancel).await,
            PacingMode::Scheduled => self.scheduled_wait(cancel).await,
        }
    }

    /// Applies new pacing parameters in place.
    ///
    /// A mode change cannot be applied to a live scheduler and is ignored
    /// with a warning; so are edits to the cron window list.
    pub fn update_pacing(&self, new: &PacingConfig) {
        if new.mode != self.mode {
            tracing::warn!(
                old = %self.mode,
                new = %new.mode,
                "pacing mode change requires restart; keeping current mode"
            );
            return;
        }

        if self.mode == PacingMode::Scheduled {
            let current = self.params.load();
            if !same_schedule(&current.schedule, &new.schedule) {
                tracing::warn!(
                    "changes to pacing.schedule require restart; keeping current windows"
                );
            }
        }

        if self.mode == PacingMode::RateLimited {
            self.limiter.store(Some(Arc::new(RateLimiter::new(
                new.requests_per_minute / 60.0,
            ))));
        }

        self.params.store(Arc::new(new.clone()));
    }

    async fn human_wait(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let (min_ms, max_ms) = {
            let params = self.params.load();
            (params.min_delay_ms, params.max_delay_ms)
        };

        let delay_ms = if max_ms <= min_ms {
            min_ms
        } else {
            rand::thread_rng().gen_range(min_ms..=max_ms)
        };

        sleep_cancellable(cancel, Duration::from_millis(delay_ms)).await
    }

    async fn rate_limited_wait(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        if let Some(limiter) = self.limiter.load_full() {
            limiter.wait(cancel).await?;
        }

        // Small extra jitter so aligned instances spread out.
        let jitter_ms = rand::thread_rng().gen_range(0..HERD_JITTER_MS);
        sleep_cancellable(cancel, Duration::from_millis(jitter_ms)).await
    }

    async fn scheduled_wait(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        if !self.in_window.load(Ordering::Acquire) {
            // Idle until the next re-check; the cron driver flips the flag.
            tokio::select! {
                _ = tokio::time::sleep(WINDOW_RECHECK) => return Ok(()),
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
        self.rate_limited_wait(cancel).await
    }
}

/// Evaluates cron windows and maintains the single pending close deadline.
///
/// One task owns both the next-fire computation and the window close, so a
/// window that fires repeatedly never accumulates timers: each opening
/// simply overwrites the close deadline (the last opener wins the close).
async fn run_cron_driver(
    entries: Vec<ScheduleEntry>,
    limiter: Arc<ArcSwapOption<RateLimiter>>,
    in_window: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let schedules: Vec<(Schedule, ScheduleEntry)> = entries
        .into_iter()
        .filter_map(|entry| match parse_cron(&entry.cron) {
            Ok(schedule) => Some((schedule, entry)),
            Err(err) => {
                tracing::error!(cron = %entry.cron, error = %err, "invalid cron expression");
                None
            }
        })
        .collect();

    if schedules.is_empty() {
        tracing::warn!("scheduled pacing has no valid cron entries; no windows will open");
        return;
    }

    let mut pending_close: Option<tokio::time::Instant> = None;

    loop {
        let next_fire = next_firing(&schedules);

        let fire_sleep = async {
            match next_fire {
                Some((at, _)) => tokio::time::sleep(until(at)).await,
                // No future firing; park until close or cancel.
                None => std::future::pending::<()>().await,
            }
        };
        let close_sleep = async {
            match pending_close {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                in_window.store(false, Ordering::Release);
                return;
            }
            _ = fire_sleep => {
                // There may be several entries firing at the same instant;
                // apply them in order so the last one wins.
                let fired_at = next_fire.map(|(at, _)| at);
                for (schedule, entry) in &schedules {
                    if fires_at(schedule, fired_at) {
                        open_window(entry, &limiter, &in_window);
                        pending_close = Some(
                            tokio::time::Instant::now()
                                + Duration::from_secs(entry.duration_minutes * 60),
                        );
                    }
                }
            }
            _ = close_sleep => {
                in_window.store(false, Ordering::Release);
                pending_close = None;
                tracing::info!("scheduled window closed");
            }
        }
    }
}

fn open_window(
    entry: &ScheduleEntry,
    limiter: &ArcSwapOption<RateLimiter>,
    in_window: &AtomicBool,
) {
    tracing::info!(
        rpm = entry.requests_per_minute,
        duration_minutes = entry.duration_minutes,
        "scheduled window opening"
    );
    limiter.store(Some(Arc::new(RateLimiter::new(
        entry.requests_per_minute / 60.0,
    ))));
    in_window.store(true, Ordering::Release);
}

/// Parses a cron expression, accepting the common 5-field form by
/// normalising it to the 6-field (with seconds) form the parser expects.
fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

/// Earliest upcoming firing across all schedules.
fn next_firing(schedules: &[(Schedule, ScheduleEntry)]) -> Option<(DateTime<Utc>, usize)> {
    schedules
        .iter()
        .enumerate()
        .filter_map(|(i, (schedule, _))| schedule.upcoming(Utc).next().map(|at| (at, i)))
        .min_by_key(|(at, _)| *at)
}

/// Whether `schedule` fires at `at` (within the same second).
fn fires_at(schedule: &Schedule, at: Option<DateTime<Utc>>) -> bool {
    let at = match at {
        Some(at) => at,
        None => return false,
    };
    schedule
        .after(&(at - chrono::Duration::seconds(1)))
        .next()
        .map(|next| next == at)
        .unwrap_or(false)
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn same_schedule(a: &[ScheduleEntry], b: &[ScheduleEntry]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.cron == y.cron
                && x.duration_minutes == y.duration_minutes
                && x.requests_per_minute == y.requests_per_minute
        })
}

async fn sleep_cancellable(cancel: &CancellationToken, d: Duration) -> Result<(), AppError> {
    if d.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => Ok(()),
        _ = cancel.cancelled() => Err(AppError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pacing(mode: PacingMode) -> PacingConfig {
        PacingConfig {
            mode,
            ..PacingConfig::default()
        }
    }

    #[tokio::test]
    async fn human_wait_sleeps_min_when_bounds_collapse() {
        let mut cfg = pacing(PacingMode::Human);
        cfg.min_delay_ms = 50;
        cfg.max_delay_ms = 50;
        let scheduler = Scheduler::new(cfg);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        scheduler.wait(&cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "elapsed: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed: {elapsed:?}");
    }

    #[tokio::test]
    async fn human_wait_stays_within_bounds() {
        let mut cfg = pacing(PacingMode::Human);
        cfg.min_delay_ms = 10;
        cfg.max_delay_ms = 60;
        let scheduler = Scheduler::new(cfg);
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let start = Instant::now();
            scheduler.wait(&cancel).await.unwrap();
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(8), "elapsed: {elapsed:?}");
            assert!(elapsed < Duration::from_millis(250), "elapsed: {elapsed:?}");
        }
    }

    #[tokio::test]
    async fn human_wait_cancels_promptly() {
        let mut cfg = pacing(PacingMode::Human);
        cfg.min_delay_ms = 10_000;
        cfg.max_delay_ms = 10_000;
        let scheduler = Arc::new(Scheduler::new(cfg));
        let cancel = CancellationToken::new();

        let waiting = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let start = Instant::now();
        cancel.cancel();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rate_limited_wait_bounds_the_rate() {
        // 600 rpm = 10 RPS → 100ms spacing; 5 waits take at least 400ms.
        let mut cfg = pacing(PacingMode::RateLimited);
        cfg.requests_per_minute = 600.0;
        let scheduler = Scheduler::new(cfg);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..5 {
            scheduler.wait(&cancel).await.unwrap();
        }
        assert!(
            start.elapsed() >= Duration::from_millis(400),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn update_pacing_replaces_rate() {
        let mut cfg = pacing(PacingMode::RateLimited);
        cfg.requests_per_minute = 6.0; // 10s spacing
        let scheduler = Scheduler::new(cfg.clone());
        let cancel = CancellationToken::new();
        scheduler.wait(&cancel).await.unwrap();

        // Swap in a much faster limiter; the old 10s schedule is dropped.
        cfg.requests_per_minute = 6000.0;
        scheduler.update_pacing(&cfg);

        let start = Instant::now();
        scheduler.wait(&cancel).await.unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn update_pacing_ignores_mode_change() {
        let scheduler = Scheduler::new(pacing(PacingMode::Human));
        let new = pacing(PacingMode::RateLimited);
        scheduler.update_pacing(&new);
        assert_eq!(scheduler.mode(), PacingMode::Human);
    }

    #[tokio::test]
    async fn scheduled_wait_cancels_outside_window() {
        let mut cfg = pacing(PacingMode::Scheduled);
        cfg.schedule = vec![ScheduleEntry {
            cron: "0 0 1 1 *".into(), // once a year
            duration_minutes: 1,
            requests_per_minute: 60.0,
        }];
        let scheduler = Arc::new(Scheduler::new(cfg));
        let cancel = CancellationToken::new();
        scheduler.start(cancel.clone());

        let waiting = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn cron_driver_opens_a_window() {
        // Fires every second; 6-field expression with a seconds column.
        let mut cfg = pacing(PacingMode::Scheduled);
        cfg.schedule = vec![ScheduleEntry {
            cron: "* * * * * *".into(),
            duration_minutes: 1,
            requests_per_minute: 6000.0,
        }];
        let scheduler = Scheduler::new(cfg);
        let cancel = CancellationToken::new();
        scheduler.start(cancel.clone());

        assert!(!scheduler.in_window());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(scheduler.in_window(), "window should have opened");

        // Inside the window the wait behaves like rate_limited.
        scheduler.wait(&cancel).await.unwrap();
        cancel.cancel();
    }

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }
}

//! Core dispatch pipeline for the footfall traffic generator.
//!
//! The [`engine::Engine`] owns the dispatch loop: pacing
//! ([`scheduler::Scheduler`]) → resource admission
//! ([`resource::ResourceMonitor`]) → weighted target pick
//! ([`selector::Selector`]) → worker slot ([`pool::WorkerPool`]), then a
//! spawned task walks the per-domain gates ([`backoff::BackoffRegistry`],
//! [`ratelimit::RateLimitRegistry`]) and executes the request through a
//! [`driver::Driver`] implementation.

pub mod backoff;
pub mod classify;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod output;
pub mod pool;
pub mod ratelimit;
pub mod resource;
pub mod scheduler;
pub mod selector;
pub mod task;
pub mod util;

#[cfg(test)]
mod testutil;

pub use classify::{classify_error, classify_status, ErrorClass};
pub use config::{Config, PacingMode};
pub use driver::{Driver, DriverError};
pub use engine::Engine;
pub use error::AppError;
pub use metrics::Metrics;
pub use task::{Task, TaskKind, TaskResult};
pub use util::hostname_of;

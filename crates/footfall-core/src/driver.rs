use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::task::{Task, TaskResult};

/// Failure modes a driver can report in a [`TaskResult`].
///
/// `Cancelled` is reserved for propagation of the engine's cancellation
/// token; every other variant describes a condition local to the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The engine's cancellation token fired mid-execution.
    #[error("cancelled")]
    Cancelled,

    /// The driver's own per-call timeout elapsed.
    #[error("timed out after {0}s")]
    Timeout(u64),

    /// Could not reach the remote endpoint.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The endpoint was reached but the exchange failed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The task configuration cannot be executed as given.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

/// Executes a single task and reports its outcome.
///
/// Implementations must be total: never panic, always return a
/// [`TaskResult`] with either a status code or an error set. They must
/// honour `cancel` promptly and enforce their own per-call timeout from the
/// task's driver configuration.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn execute(&self, cancel: &CancellationToken, task: Task) -> TaskResult;
}

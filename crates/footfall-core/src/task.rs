use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TargetConfig;
use crate::driver::DriverError;

/// Protocol family a target is dispatched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Http,
    Browser,
    Dns,
    Websocket,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Http => "http",
            TaskKind::Browser => "browser",
            TaskKind::Dns => "dns",
            TaskKind::Websocket => "websocket",
        }
    }
}

impl Default for TaskKind {
    fn default() -> Self {
        TaskKind::Http
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(TaskKind::Http),
            "browser" => Ok(TaskKind::Browser),
            "dns" => Ok(TaskKind::Dns),
            "websocket" => Ok(TaskKind::Websocket),
            _ => Err(format!(
                "unknown task type: {s} (must be http|browser|dns|websocket)"
            )),
        }
    }
}

/// A single unit of work handed to a driver.
///
/// Snapshot of a target at pick time; consumed by exactly one dispatch.
#[derive(Debug, Clone)]
pub struct Task {
    pub url: String,
    pub kind: TaskKind,
    pub config: TargetConfig,
}

/// Outcome of one driver execution.
///
/// `status_code` is HTTP-style for every driver; the DNS driver remaps
/// RCODEs into this space. When `error` is set the status code carries no
/// meaning.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub status_code: u16,
    pub duration: Duration,
    pub bytes_read: u64,
    pub error: Option<DriverError>,
}

impl TaskResult {
    /// A result carrying only an error (no meaningful status).
    pub fn from_error(task: Task, duration: Duration, error: DriverError) -> Self {
        Self {
            task,
            status_code: 0,
            duration,
            bytes_read: 0,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            TaskKind::Http,
            TaskKind::Browser,
            TaskKind::Dns,
            TaskKind::Websocket,
        ] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn kind_rejects_unknown() {
        assert!("gopher".parse::<TaskKind>().is_err());
    }
}

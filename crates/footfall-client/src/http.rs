use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use footfall_core::{AppError, Driver, DriverError, Task, TaskResult};

const DEFAULT_TIMEOUT_S: u64 = 15;

/// HTTP driver backed by a shared reqwest client.
///
/// Connections are pooled across tasks; per-task settings (method,
/// headers, body, timeout) come from the task's HTTP config. The response
/// body is drained and counted but never retained.
pub struct HttpDriver {
    client: Client,
}

impl HttpDriver {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("footfall/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::Config(format!("building HTTP client: {e}")))?;

        Ok(Self { client })
    }

    async fn perform(&self, task: &Task) -> Result<(u16, u64), DriverError> {
        let cfg = &task.config.http;

        let method = reqwest::Method::from_bytes(cfg.method.as_bytes())
            .map_err(|_| DriverError::InvalidTarget(format!("invalid method {:?}", cfg.method)))?;

        let mut request = self.client.request(method, &task.url);
        for (name, value) in &cfg.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !cfg.body.is_empty() {
            request = request.body(cfg.body.clone());
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();

        // Drain the body to measure it and to keep the connection reusable.
        let mut response = response;
        let mut bytes_read: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            bytes_read += chunk.len() as u64;
        }

        Ok((status, bytes_read))
    }
}

#[async_trait]
impl Driver for HttpDriver {
    async fn execute(&self, cancel: &CancellationToken, task: Task) -> TaskResult {
        let timeout_s = match task.config.http.timeout_s {
            0 => DEFAULT_TIMEOUT_S,
            t => t,
        };

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DriverError::Cancelled),
            outcome = tokio::time::timeout(
                Duration::from_secs(timeout_s),
                self.perform(&task),
            ) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(DriverError::Timeout(timeout_s)),
            },
        };
        let duration = start.elapsed();

        match outcome {
            Ok((status_code, bytes_read)) => TaskResult {
                task,
                status_code,
                duration,
                bytes_read,
                error: None,
            },
            Err(error) => TaskResult::from_error(task, duration, error),
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> DriverError {
    if err.is_timeout() {
        DriverError::Timeout(DEFAULT_TIMEOUT_S)
    } else if err.is_connect() {
        DriverError::Connect(err.to_string())
    } else {
        DriverError::Protocol(err.to_string())
    }
}

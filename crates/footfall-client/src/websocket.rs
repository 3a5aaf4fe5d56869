use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use footfall_core::{Driver, DriverError, Task, TaskResult};

const DEFAULT_DURATION_S: u64 = 10;
/// Grace on top of the hold duration for connect/send/read to finish.
const EXCHANGE_GRACE: Duration = Duration::from_secs(30);

/// WebSocket driver: connect, send the configured messages, read the
/// expected replies, then hold the connection open for the configured
/// duration before closing cleanly.
///
/// A successfully established connection reports status 101 (Switching
/// Protocols), which the classifier treats as a terminal non-retry
/// outcome.
pub struct WebsocketDriver;

impl WebsocketDriver {
    pub fn new() -> Self {
        Self
    }

    async fn exchange(&self, task: &Task, duration_s: u64) -> Result<u64, DriverError> {
        let cfg = &task.config.websocket;

        let (mut stream, _response) = connect_async(task.url.as_str())
            .await
            .map_err(|e| DriverError::Connect(format!("dialing: {e}")))?;

        for msg in &cfg.send_messages {
            stream
                .send(Message::Text(msg.clone()))
                .await
                .map_err(|e| DriverError::Protocol(format!("sending message: {e}")))?;
        }

        // Read up to the expected number of replies, bounded by the hold
        // duration; missing replies end the read early but do not fail the
        // task.
        let mut bytes_read: u64 = 0;
        if cfg.expect_messages > 0 {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(duration_s);
            let mut received = 0usize;
            while received < cfg.expect_messages {
                let next = tokio::time::timeout_at(deadline, stream.next()).await;
                match next {
                    Ok(Some(Ok(msg))) => {
                        bytes_read += msg.len() as u64;
                        received += 1;
                    }
                    Ok(Some(Err(_))) | Ok(None) | Err(_) => break,
                }
            }
        }

        let _ = stream.close(None).await;
        Ok(bytes_read)
    }
}

impl Default for WebsocketDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for WebsocketDriver {
    async fn execute(&self, cancel: &CancellationToken, task: Task) -> TaskResult {
        let duration_s = match task.config.websocket.duration_s {
            0 => DEFAULT_DURATION_S,
            d => d,
        };

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DriverError::Cancelled),
            outcome = tokio::time::timeout(
                Duration::from_secs(duration_s) + EXCHANGE_GRACE,
                self.exchange(&task, duration_s),
            ) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(DriverError::Timeout(duration_s + EXCHANGE_GRACE.as_secs())),
            },
        };

        let bytes_read = match outcome {
            Ok(bytes) => bytes,
            Err(error) => return TaskResult::from_error(task, start.elapsed(), error),
        };

        // Hold the connection window: keep pacing realistic by not
        // reconnecting immediately. Cancellation cuts the hold short but
        // the exchange above already succeeded.
        let elapsed = start.elapsed();
        let hold = Duration::from_secs(duration_s).saturating_sub(elapsed);
        if !hold.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(hold) => {}
                _ = cancel.cancelled() => {}
            }
        }

        TaskResult {
            task,
            status_code: 101,
            duration: start.elapsed(),
            bytes_read,
            error: None,
        }
    }
}

//! Per-result output serialisation (JSONL or CSV).
//!
//! Results flow through a bounded channel to a background writer task, so
//! serialisation never sits on the dispatch-critical path. `send` is
//! non-blocking and drops (with a warning) when the buffer is full;
//! `close` drains whatever is queued and flushes the file.

use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::{OutputConfig, OutputFormat};
use crate::error::AppError;
use crate::task::TaskResult;

const CHANNEL_BUF: usize = 512;

/// One serialised line of output.
#[derive(Debug, Serialize)]
struct Record {
    ts: String,
    url: String,
    #[serde(rename = "type")]
    kind: String,
    status: u16,
    duration_ms: u64,
    bytes: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

impl Record {
    fn from_result(r: &TaskResult) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            url: r.task.url.clone(),
            kind: r.task.kind.as_str().to_string(),
            status: r.status_code,
            duration_ms: r.duration.as_millis() as u64,
            bytes: r.bytes_read,
            error: r
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Asynchronous result writer; not on the dispatch-critical path.
pub struct ResultWriter {
    tx: Mutex<Option<mpsc::Sender<TaskResult>>>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ResultWriter {
    /// Opens the output file and starts the background writer task.
    pub async fn new(cfg: &OutputConfig) -> Result<ResultWriter, AppError> {
        let mut open = tokio::fs::OpenOptions::new();
        open.create(true).write(true);
        if cfg.append {
            open.append(true);
        } else {
            open.truncate(true);
        }
        let file = open
            .open(&cfg.file)
            .await
            .map_err(|e| AppError::Output(format!("opening {:?}: {e}", cfg.file)))?;

        let (tx, rx) = mpsc::channel(CHANNEL_BUF);
        let (done_tx, done_rx) = oneshot::channel();

        let format = cfg.format;
        let write_header = format == OutputFormat::Csv && !cfg.append;
        tokio::spawn(async move {
            run_writer(file, format, write_header, rx).await;
            let _ = done_tx.send(());
        });

        Ok(ResultWriter {
            tx: Mutex::new(Some(tx)),
            done: Mutex::new(Some(done_rx)),
        })
    }

    /// Enqueues a result for writing. Never blocks; drops when full or
    /// after `close`.
    pub fn send(&self, result: &TaskResult) {
        let tx = {
            let guard = self
                .tx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        };
        let Some(tx) = tx else { return };

        if tx.try_send(result.clone()).is_err() {
            tracing::warn!("result writer buffer full, dropping result");
        }
    }

    /// Drains queued results and flushes the file.
    pub async fn close(&self) {
        // Dropping the sender ends the writer loop once the queue empties.
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(tx);

        let done = self
            .done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }
}

async fn run_writer(
    file: tokio::fs::File,
    format: OutputFormat,
    write_header: bool,
    mut rx: mpsc::Receiver<TaskResult>,
) {
    let mut file = file;

    if write_header {
        let header = "ts,url,type,status,duration_ms,bytes,error\n";
        if let Err(err) = file.write_all(header.as_bytes()).await {
            tracing::warn!(error = %err, "result writer: failed to write CSV header");
        }
    }

    while let Some(result) = rx.recv().await {
        let record = Record::from_result(&result);
        let line = match format {
            OutputFormat::Jsonl => match serde_json::to_vec(&record) {
                Ok(mut buf) => {
                    buf.push(b'\n');
                    buf
                }
                Err(err) => {
                    tracing::warn!(error = %err, "result writer: failed to encode result");
                    continue;
                }
            },
            OutputFormat::Csv => match csv_line(&record) {
                Ok(buf) => buf,
                Err(err) => {
                    tracing::warn!(error = %err, "result writer: failed to encode CSV row");
                    continue;
                }
            },
        };

        if let Err(err) = file.write_all(&line).await {
            tracing::warn!(error = %err, "result writer: write failed");
        }
    }

    let _ = file.flush().await;
}

fn csv_line(record: &Record) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record([
        record.ts.as_str(),
        record.url.as_str(),
        record.kind.as_str(),
        &record.status.to_string(),
        &record.duration_ms.to_string(),
        &record.bytes.to_string(),
        record.error.as_str(),
    ])?;
    Ok(writer.into_inner().unwrap_or_default())
}

//! Interactive single-endpoint probe.
//!
//! Fires the target on an interval and prints one line per reply, plus a
//! ping-style summary on Ctrl-C. No config file involved; the driver type
//! is auto-detected from the target string unless forced with `--type`.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use footfall_core::{TaskKind, TaskResult};

use crate::{probe_driver, probe_task};

pub async fn run(
    target: &str,
    driver_type: Option<&str>,
    interval: Duration,
    timeout: Duration,
    resolver: &str,
    record_type: &str,
) -> Result<()> {
    let kind = match driver_type {
        Some(raw) => TaskKind::from_str(raw).map_err(|e| anyhow::anyhow!(e))?,
        None => detect_kind(target),
    };
    if kind != TaskKind::Http && kind != TaskKind::Dns {
        anyhow::bail!("probe supports http and dns targets; got type {kind}");
    }

    let driver = probe_driver(kind)?;
    let task = probe_task(target, kind, timeout, resolver, record_type);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let header = match kind {
        TaskKind::Dns => format!(
            "Probing {target} (dns, {} @ {resolver})",
            record_type.to_uppercase()
        ),
        _ => format!("Probing {target} (http)"),
    };
    println!("\n{header} — Ctrl-C to stop\n");

    let mut stats = ProbeStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Bound each shot so a dead endpoint cannot wedge the loop.
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = tokio::time::timeout(
                        timeout + Duration::from_secs(1),
                        driver.execute(&cancel, task.clone()),
                    ) => match result {
                        Ok(result) => result,
                        Err(_) => continue,
                    },
                };
                stats.record(&result);
                print_reply(kind, &result);
            }
        }
    }

    stats.print_summary(target);
    Ok(())
}

fn detect_kind(target: &str) -> TaskKind {
    if target.starts_with("http://") || target.starts_with("https://") {
        TaskKind::Http
    } else {
        TaskKind::Dns
    }
}

fn print_reply(kind: TaskKind, result: &TaskResult) {
    if let Some(err) = &result.error {
        println!("  ERR  {err}");
        return;
    }

    let duration = format_ms(result.duration);
    if kind == TaskKind::Dns {
        println!("  {:<8}  {duration:>6}", rcode_label(result.status_code));
    } else {
        println!(
            "  {:>3}  {duration:>6}  {}",
            result.status_code,
            format_bytes(result.bytes_read)
        );
    }
}

#[derive(Default)]
struct ProbeStats {
    total: u64,
    success: u64,
    min: Duration,
    max: Duration,
    sum: Duration,
}

impl ProbeStats {
    fn record(&mut self, result: &TaskResult) {
        self.total += 1;
        if result.error.is_some() {
            return;
        }

        self.success += 1;
        self.sum += result.duration;
        if self.success == 1 || result.duration < self.min {
            self.min = result.duration;
        }
        if result.duration > self.max {
            self.max = result.duration;
        }
    }

    fn print_summary(&self, target: &str) {
        println!("\n--- {target} ---");
        println!(
            "{} sent, {} ok, {} error(s)",
            self.total,
            self.success,
            self.total - self.success
        );
        if self.success > 0 {
            let avg = self.sum / self.success as u32;
            println!(
                "min/avg/max latency: {} / {} / {}",
                format_ms(self.min),
                format_ms(avg),
                format_ms(self.max)
            );
        }
    }
}

fn rcode_label(status: u16) -> String {
    match status {
        200 => "NOERROR".to_string(),
        404 => "NXDOMAIN".to_string(),
        403 => "REFUSED".to_string(),
        503 => "SERVFAIL".to_string(),
        other => format!("RCODE_{other}"),
    }
}

fn format_ms(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

fn format_bytes(n: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    match n {
        n if n >= MB => format!("{:.1} MB", n as f64 / MB as f64),
        n if n >= KB => format!("{:.1} KB", n as f64 / KB as f64),
        n => format!("{n} B"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_http_from_scheme() {
        assert_eq!(detect_kind("https://example.com"), TaskKind::Http);
        assert_eq!(detect_kind("http://example.com"), TaskKind::Http);
        assert_eq!(detect_kind("example.com"), TaskKind::Dns);
    }

    #[test]
    fn formats_byte_counts() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn rcode_labels_match_mapping() {
        assert_eq!(rcode_label(200), "NOERROR");
        assert_eq!(rcode_label(404), "NXDOMAIN");
        assert_eq!(rcode_label(403), "REFUSED");
        assert_eq!(rcode_label(503), "SERVFAIL");
        assert_eq!(rcode_label(502), "RCODE_502");
    }
}

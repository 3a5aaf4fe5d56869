//! Prometheus counters and histograms for dispatched requests.
//!
//! Collectors are registered on an isolated [`Registry`] per instance so
//! tests and embedded uses never collide on the global default registry.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::classify::classify_error;
use crate::error::AppError;
use crate::task::TaskResult;

/// Request metrics for the engine.
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    duration_seconds: HistogramVec,
    bytes_read_total: IntCounterVec,
}

impl Metrics {
    /// Creates a metrics set registered on a fresh registry.
    pub fn new() -> Result<Self, AppError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "footfall_requests_total",
                "Total number of requests dispatched, by type and status code.",
            ),
            &["type", "status_code"],
        )
        .map_err(|e| AppError::Metrics(e.to_string()))?;

        let errors_total = IntCounterVec::new(
            Opts::new(
                "footfall_errors_total",
                "Total number of request errors, by type and error class.",
            ),
            &["type", "error_class"],
        )
        .map_err(|e| AppError::Metrics(e.to_string()))?;

        let duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "footfall_request_duration_seconds",
                "Request duration in seconds, by type.",
            ),
            &["type"],
        )
        .map_err(|e| AppError::Metrics(e.to_string()))?;

        let bytes_read_total = IntCounterVec::new(
            Opts::new(
                "footfall_bytes_read_total",
                "Total bytes read from responses, by type.",
            ),
            &["type"],
        )
        .map_err(|e| AppError::Metrics(e.to_string()))?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(errors_total.clone()),
            Box::new(duration_seconds.clone()),
            Box::new(bytes_read_total.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| AppError::Metrics(e.to_string()))?;
        }

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            duration_seconds,
            bytes_read_total,
        })
    }

    /// A metrics set whose collectors are registered nowhere; recording is
    /// a no-op as far as exposition goes. Used when metrics are disabled.
    pub fn noop() -> Self {
        // The vec constructors only fail on malformed label setups.
        let requests_total = IntCounterVec::new(
            Opts::new("noop_requests", "unused"),
            &["type", "status_code"],
        )
        .expect("static label names");
        let errors_total =
            IntCounterVec::new(Opts::new("noop_errors", "unused"), &["type", "error_class"])
                .expect("static label names");
        let duration_seconds =
            HistogramVec::new(HistogramOpts::new("noop_duration", "unused"), &["type"])
                .expect("static label names");
        let bytes_read_total =
            IntCounterVec::new(Opts::new("noop_bytes", "unused"), &["type"])
                .expect("static label names");

        Self {
            registry: Registry::new(),
            requests_total,
            errors_total,
            duration_seconds,
            bytes_read_total,
        }
    }

    /// Observes the outcome of a completed task.
    pub fn record(&self, result: &TaskResult) {
        let kind = result.task.kind.as_str();
        self.duration_seconds
            .with_label_values(&[kind])
            .observe(result.duration.as_secs_f64());

        if result.bytes_read > 0 {
            self.bytes_read_total
                .with_label_values(&[kind])
                .inc_by(result.bytes_read);
        }

        if let Some(err) = &result.error {
            let class = classify_error(Some(err));
            self.errors_total
                .with_label_values(&[kind, class.as_str()])
                .inc();
            return;
        }

        self.requests_total
            .with_label_values(&[kind, &result.status_code.to_string()])
            .inc();
    }

    /// Renders the registry in the Prometheus text format.
    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buf) {
            tracing::warn!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn requests_for(&self, kind: &str, status: &str) -> u64 {
        self.requests_total.with_label_values(&[kind, status]).get()
    }

    #[cfg(test)]
    pub(crate) fn errors_for(&self, kind: &str, class: &str) -> u64 {
        self.errors_total.with_label_values(&[kind, class]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::task::{Task, TaskKind};
    use std::time::Duration;

    fn result(status: u16, error: Option<DriverError>) -> TaskResult {
        TaskResult {
            task: Task {
                url: "https://example.com".into(),
                kind: TaskKind::Http,
                config: Default::default(),
            },
            status_code: status,
            duration: Duration::from_millis(12),
            bytes_read: 1024,
            error,
        }
    }

    #[test]
    fn successful_results_count_by_status() {
        let m = Metrics::new().unwrap();
        m.record(&result(200, None));
        m.record(&result(200, None));
        m.record(&result(404, None));

        assert_eq!(m.requests_for("http", "200"), 2);
        assert_eq!(m.requests_for("http", "404"), 1);
        assert_eq!(m.errors_for("http", "transient"), 0);
    }

    #[test]
    fn errored_results_count_by_class() {
        let m = Metrics::new().unwrap();
        m.record(&result(0, Some(DriverError::Connect("refused".into()))));
        m.record(&result(0, Some(DriverError::Cancelled)));

        assert_eq!(m.errors_for("http", "transient"), 1);
        assert_eq!(m.errors_for("http", "fatal"), 1);
        assert_eq!(m.requests_for("http", "0"), 0);
    }

    #[test]
    fn gather_renders_text_format() {
        let m = Metrics::new().unwrap();
        m.record(&result(200, None));
        let text = m.gather();
        assert!(text.contains("footfall_requests_total"), "{text}");
        assert!(text.contains("footfall_bytes_read_total"), "{text}");
    }

    #[test]
    fn noop_records_without_exposition() {
        let m = Metrics::noop();
        m.record(&result(200, None));
        assert_eq!(m.gather(), "");
    }
}

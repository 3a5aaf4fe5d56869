//! YAML configuration model, defaults, and validation.
//!
//! The config file drives everything: pacing, concurrency limits, rate
//! limits, backoff, targets, metrics, output, and daemon behaviour.
//! Targets can be declared inline under `targets:` and/or loaded from a
//! plain-text `targets_file` (one `<url> <type> [weight]` entry per line),
//! with `target_defaults:` filling in unspecified per-target fields.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::task::TaskKind;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub targets_file: Option<String>,
    #[serde(default)]
    pub target_defaults: TargetDefaultsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// How requests are spaced in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacingConfig {
    #[serde(default = "defaults::pacing_mode")]
    pub mode: PacingMode,
    #[serde(default = "defaults::requests_per_minute")]
    pub requests_per_minute: f64,
    #[serde(default = "defaults::min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            mode: defaults::pacing_mode(),
            requests_per_minute: defaults::requests_per_minute(),
            min_delay_ms: defaults::min_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            schedule: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// Random uniform delay between requests.
    Human,
    /// Token bucket at a fixed requests-per-minute rate.
    RateLimited,
    /// Cron-driven windows, each with its own rate.
    Scheduled,
}

impl PacingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingMode::Human => "human",
            PacingMode::RateLimited => "rate_limited",
            PacingMode::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for PacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A cron-based active window with its own request rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    pub cron: String,
    pub duration_minutes: u64,
    pub requests_per_minute: f64,
}

/// Concurrency and resource thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "defaults::max_workers")]
    pub max_workers: usize,
    #[serde(default = "defaults::max_browser_workers")]
    pub max_browser_workers: usize,
    #[serde(default = "defaults::cpu_threshold_pct")]
    pub cpu_threshold_pct: f64,
    #[serde(default = "defaults::memory_threshold_mb")]
    pub memory_threshold_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_workers: defaults::max_workers(),
            max_browser_workers: defaults::max_browser_workers(),
            cpu_threshold_pct: defaults::cpu_threshold_pct(),
            memory_threshold_mb: defaults::memory_threshold_mb(),
        }
    }
}

/// Global and per-domain request rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitsConfig {
    #[serde(default = "defaults::default_rps")]
    pub default_rps: f64,
    #[serde(default)]
    pub per_domain: Vec<DomainRateLimit>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default_rps: defaults::default_rps(),
            per_domain: Vec::new(),
        }
    }
}

impl RateLimitsConfig {
    /// Flattens the per-domain override list into a lookup map.
    pub fn per_domain_map(&self) -> HashMap<String, f64> {
        self.per_domain
            .iter()
            .map(|d| (d.domain.clone(), d.rps))
            .collect()
    }
}

/// Requests-per-second cap for a single domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainRateLimit {
    pub domain: String,
    pub rps: f64,
}

/// Per-domain backoff behaviour after transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "defaults::backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "defaults::backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "defaults::backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "defaults::backoff_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: defaults::backoff_initial_ms(),
            max_ms: defaults::backoff_max_ms(),
            multiplier: defaults::backoff_multiplier(),
            max_attempts: defaults::backoff_max_attempts(),
        }
    }
}

/// A single request target with its per-driver settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "defaults::weight")]
    pub weight: u32,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
}

/// Fallback values applied to every target loaded from `targets_file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetDefaultsConfig {
    #[serde(default = "defaults::weight")]
    pub weight: u32,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
}

impl Default for TargetDefaultsConfig {
    fn default() -> Self {
        Self {
            weight: defaults::weight(),
            http: HttpConfig::default(),
            browser: BrowserConfig::default(),
            dns: DnsConfig::default(),
            websocket: WebsocketConfig::default(),
        }
    }
}

/// HTTP-specific target settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "defaults::http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default = "defaults::http_timeout_s")]
    pub timeout_s: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            method: defaults::http_method(),
            headers: HashMap::new(),
            body: String::new(),
            timeout_s: defaults::http_timeout_s(),
        }
    }
}

/// Headless-browser target settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserConfig {
    #[serde(default)]
    pub scroll: bool,
    #[serde(default)]
    pub wait_for_selector: String,
    #[serde(default = "defaults::browser_timeout_s")]
    pub timeout_s: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            scroll: false,
            wait_for_selector: String::new(),
            timeout_s: defaults::browser_timeout_s(),
        }
    }
}

/// DNS resolver target settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    #[serde(default = "defaults::dns_resolver")]
    pub resolver: String,
    #[serde(default = "defaults::dns_record_type")]
    pub record_type: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            resolver: defaults::dns_resolver(),
            record_type: defaults::dns_record_type(),
        }
    }
}

/// WebSocket target settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketConfig {
    #[serde(default = "defaults::websocket_duration_s")]
    pub duration_s: u64,
    #[serde(default)]
    pub send_messages: Vec<String>,
    #[serde(default)]
    pub expect_messages: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            duration_s: defaults::websocket_duration_s(),
            send_messages: Vec::new(),
            expect_messages: 0,
        }
    }
}

/// Prometheus metrics exposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_port: defaults::prometheus_port(),
        }
    }
}

/// Per-result output file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub file: String,
    #[serde(default = "defaults::output_format")]
    pub format: OutputFormat,
    #[serde(default)]
    pub append: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: String::new(),
            format: defaults::output_format(),
            append: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jsonl,
    Csv,
}

/// Daemon/process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "defaults::pid_file")]
    pub pid_file: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::log_format")]
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: defaults::pid_file(),
            log_level: defaults::log_level(),
            log_format: defaults::log_format(),
        }
    }
}

mod defaults {
    use super::{OutputFormat, PacingMode};

    pub fn pacing_mode() -> PacingMode {
        PacingMode::Human
    }
    pub fn requests_per_minute() -> f64 {
        20.0
    }
    pub fn min_delay_ms() -> u64 {
        800
    }
    pub fn max_delay_ms() -> u64 {
        8000
    }
    pub fn max_workers() -> usize {
        4
    }
    pub fn max_browser_workers() -> usize {
        1
    }
    pub fn cpu_threshold_pct() -> f64 {
        60.0
    }
    pub fn memory_threshold_mb() -> u64 {
        512
    }
    pub fn default_rps() -> f64 {
        0.5
    }
    pub fn backoff_initial_ms() -> u64 {
        1000
    }
    pub fn backoff_max_ms() -> u64 {
        120_000
    }
    pub fn backoff_multiplier() -> f64 {
        2.0
    }
    pub fn backoff_max_attempts() -> u32 {
        3
    }
    pub fn weight() -> u32 {
        1
    }
    pub fn http_method() -> String {
        "GET".to_string()
    }
    pub fn http_timeout_s() -> u64 {
        15
    }
    pub fn browser_timeout_s() -> u64 {
        30
    }
    pub fn dns_resolver() -> String {
        "8.8.8.8:53".to_string()
    }
    pub fn dns_record_type() -> String {
        "A".to_string()
    }
    pub fn websocket_duration_s() -> u64 {
        30
    }
    pub fn prometheus_port() -> u16 {
        9090
    }
    pub fn output_format() -> OutputFormat {
        OutputFormat::Jsonl
    }
    pub fn pid_file() -> String {
        "/tmp/footfall.pid".to_string()
    }
    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn log_format() -> String {
        "text".to_string()
    }
}

impl Config {
    /// Reads the YAML config at `path`, merges `targets_file` entries, and
    /// validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, AppError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw, path.as_ref().parent())
    }

    /// Parses and validates a YAML document. `base_dir` anchors a relative
    /// `targets_file` path.
    pub fn from_yaml(raw: &str, base_dir: Option<&Path>) -> Result<Config, AppError> {
        let mut cfg: Config = serde_yaml::from_str(raw)?;

        if let Some(file) = cfg.targets_file.clone() {
            let path = match base_dir {
                Some(dir) if Path::new(&file).is_relative() => dir.join(&file),
                _ => Path::new(&file).to_path_buf(),
            };
            let entries = load_targets_file(&path, &cfg.target_defaults)?;
            cfg.targets.extend(entries);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks every field, collecting all problems into a single error.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut errs: Vec<String> = Vec::new();

        if self.pacing.requests_per_minute <= 0.0 {
            errs.push("pacing.requests_per_minute must be > 0".into());
        }
        if self.pacing.max_delay_ms < self.pacing.min_delay_ms {
            errs.push("pacing.max_delay_ms must be >= min_delay_ms".into());
        }
        if self.pacing.mode == PacingMode::Scheduled && self.pacing.schedule.is_empty() {
            errs.push("pacing.schedule must have at least one entry when mode is scheduled".into());
        }
        for (i, entry) in self.pacing.schedule.iter().enumerate() {
            if entry.duration_minutes == 0 {
                errs.push(format!("pacing.schedule[{i}].duration_minutes must be > 0"));
            }
            if entry.requests_per_minute <= 0.0 {
                errs.push(format!(
                    "pacing.schedule[{i}].requests_per_minute must be > 0"
                ));
            }
        }

        if self.limits.max_workers == 0 {
            errs.push("limits.max_workers must be > 0".into());
        }
        if self.limits.max_browser_workers == 0 {
            errs.push("limits.max_browser_workers must be > 0".into());
        }
        if self.limits.cpu_threshold_pct <= 0.0 || self.limits.cpu_threshold_pct > 100.0 {
            errs.push("limits.cpu_threshold_pct must be in (0, 100]".into());
        }

        if self.rate_limits.default_rps <= 0.0 {
            errs.push("rate_limits.default_rps must be > 0".into());
        }
        for (i, d) in self.rate_limits.per_domain.iter().enumerate() {
            if d.domain.is_empty() {
                errs.push(format!("rate_limits.per_domain[{i}].domain must not be empty"));
            }
            if d.rps <= 0.0 {
                errs.push(format!("rate_limits.per_domain[{i}].rps must be > 0"));
            }
        }

        if self.backoff.initial_ms == 0 {
            errs.push("backoff.initial_ms must be > 0".into());
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            errs.push("backoff.max_ms must be >= initial_ms".into());
        }
        if self.backoff.multiplier <= 1.0 {
            errs.push("backoff.multiplier must be > 1".into());
        }
        if self.backoff.max_attempts == 0 {
            errs.push("backoff.max_attempts must be > 0".into());
        }

        if self.targets.is_empty() {
            errs.push(
                "targets must have at least one entry (via 'targets' in config or 'targets_file')"
                    .into(),
            );
        }
        for (i, t) in self.targets.iter().enumerate() {
            if t.url.is_empty() {
                errs.push(format!("targets[{i}].url must not be empty"));
            }
            if t.weight == 0 {
                errs.push(format!("targets[{i}].weight must be > 0"));
            }
        }

        if self.output.enabled && self.output.file.is_empty() {
            errs.push("output.file must be set when output.enabled is true".into());
        }

        const LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.daemon.log_level.as_str()) {
            errs.push(format!(
                "daemon.log_level must be one of debug|info|warn|error, got {:?}",
                self.daemon.log_level
            ));
        }
        if !["text", "json"].contains(&self.daemon.log_format.as_str()) {
            errs.push(format!(
                "daemon.log_format must be text|json, got {:?}",
                self.daemon.log_format
            ));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(errs.join("; ")))
        }
    }
}

/// Parses a plain-text targets file.
///
/// Format, one entry per line:
///
/// ```text
/// <url> <type> [weight]
/// ```
///
/// Lines beginning with `#` and blank lines are ignored. Weight falls back
/// to `target_defaults.weight`; the remaining per-driver fields are copied
/// from `target_defaults`.
fn load_targets_file(
    path: &Path,
    defaults: &TargetDefaultsConfig,
) -> Result<Vec<TargetConfig>, AppError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("targets_file {}: {e}", path.display())))?;

    let mut targets = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line_num = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(AppError::Config(format!(
                "targets_file line {line_num}: expected \"<url> <type> [weight]\", got {line:?}"
            )));
        }

        let url = fields[0].to_string();
        let kind = TaskKind::from_str(fields[1])
            .map_err(|e| AppError::Config(format!("targets_file line {line_num}: {e}")))?;

        let weight = match fields.get(2) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(w) if w > 0 => w,
                _ => {
                    return Err(AppError::Config(format!(
                        "targets_file line {line_num}: invalid weight {raw:?} (must be a positive integer)"
                    )))
                }
            },
            None => defaults.weight.max(1),
        };

        targets.push(TargetConfig {
            url,
            weight,
            kind,
            http: defaults.http.clone(),
            browser: defaults.browser.clone(),
            dns: defaults.dns.clone(),
            websocket: defaults.websocket.clone(),
        });
    }

    Ok(targets)
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use footfall_client::{default_drivers, DnsDriver, HttpDriver};
use footfall_core::config::{Config, PacingMode, TargetConfig};
use footfall_core::{Driver, Engine, Metrics, Task, TaskKind};

mod probe;
mod process;

#[derive(Parser)]
#[command(
    name = "footfall",
    version,
    about = "Polite, realistic web traffic generator",
    long_about = "footfall simulates realistic user web traffic across HTTP, headless
browser, DNS, and WebSocket protocols.

Targets are defined in a YAML config file under 'targets' (inline) and/or
loaded from a plain-text file via 'targets_file'. Both can be used together.

Use 'footfall probe <target>' to test a single endpoint interactively
without a config file. Use 'footfall validate' to check a config before
running."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the traffic generator
    Start {
        /// Path to the YAML config file
        #[arg(short, long, default_value = "config/example.yaml")]
        config: String,

        /// Skip writing the PID file (process always runs in foreground)
        #[arg(long, default_value_t = false)]
        foreground: bool,

        /// Override log level (debug|info|warn|error)
        #[arg(long)]
        log_level: Option<String>,

        /// Print a config summary and exit without sending any traffic
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Stop a running traffic generator daemon
    Stop {
        /// Path to the PID file
        #[arg(long, default_value = "/tmp/footfall.pid")]
        pid_file: String,
    },

    /// Reload the config of a running footfall daemon
    #[command(long_about = "Send SIGHUP to a running footfall daemon to reload its configuration.

Targets, rate limits, backoff settings, and pacing parameters are reloaded
atomically with no dropped requests. Changes to pacing mode, worker count,
CPU/memory limits, or output settings require a full restart.")]
    Reload {
        /// Path to the PID file
        #[arg(long, default_value = "/tmp/footfall.pid")]
        pid_file: String,
    },

    /// Check whether the traffic generator daemon is running
    Status {
        /// Path to the PID file
        #[arg(long, default_value = "/tmp/footfall.pid")]
        pid_file: String,
    },

    /// Validate a config file
    Validate {
        /// Path to the YAML config file
        #[arg(short, long, default_value = "config/example.yaml")]
        config: String,
    },

    /// Test a single endpoint in a loop (like ping for HTTP/DNS)
    #[command(long_about = "Probe an HTTP or DNS endpoint in a loop until stopped.

No config file is required. The driver type is auto-detected from the target:
  https:// or http:// prefix -> http
  bare hostname              -> dns

Examples:
  footfall probe https://example.com
  footfall probe example.com
  footfall probe example.com --type dns --record-type AAAA --resolver 1.1.1.1:53")]
    Probe {
        /// Target URL or hostname
        target: String,

        /// Driver type: http|dns (auto-detected from the target if omitted)
        #[arg(long = "type")]
        driver_type: Option<String>,

        /// Delay between requests
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Per-request timeout
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// DNS resolver address (dns targets only)
        #[arg(long, default_value = "8.8.8.8:53")]
        resolver: String,

        /// DNS record type (dns targets only)
        #[arg(long, default_value = "A")]
        record_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            foreground,
            log_level,
            dry_run,
        } => start(&config, foreground, log_level.as_deref(), dry_run).await,
        Commands::Stop { pid_file } => process::stop(&pid_file),
        Commands::Reload { pid_file } => process::reload(&pid_file),
        Commands::Status { pid_file } => process::status(&pid_file),
        Commands::Validate { config } => {
            Config::load(&config)?;
            println!("config valid");
            Ok(())
        }
        Commands::Probe {
            target,
            driver_type,
            interval,
            timeout,
            resolver,
            record_type,
        } => {
            probe::run(
                &target,
                driver_type.as_deref(),
                interval,
                timeout,
                &resolver,
                &record_type,
            )
            .await
        }
    }
}

async fn start(
    config_path: &str,
    foreground: bool,
    log_level: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let cfg = Config::load(config_path)?;

    if dry_run {
        print_dry_run(config_path, &cfg);
        return Ok(());
    }

    // CLI flag overrides the config log level.
    let level = log_level.unwrap_or(&cfg.daemon.log_level);
    init_logger(level, &cfg.daemon.log_format)?;

    let pid_file = cfg.daemon.pid_file.clone();
    let wrote_pid = if foreground {
        false
    } else {
        match process::write_pid(&pid_file) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "could not write PID file");
                false
            }
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let metrics = if cfg.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        spawn_metrics_server(
            Arc::clone(&metrics),
            cfg.metrics.prometheus_port,
            cancel.clone(),
        );
        metrics
    } else {
        Arc::new(Metrics::noop())
    };

    let drivers = default_drivers()?;
    let engine = Arc::new(
        Engine::new(cfg, metrics, drivers)
            .await
            .context("creating engine")?,
    );

    spawn_reload_handler(Arc::clone(&engine), config_path.to_string(), cancel.clone())?;

    engine.run(cancel).await;

    if wrote_pid {
        let _ = std::fs::remove_file(&pid_file);
    }
    Ok(())
}

/// Cancels the token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
    Ok(())
}

/// Re-reads and applies the config on every SIGHUP until shutdown.
fn spawn_reload_handler(
    engine: Arc<Engine>,
    config_path: String,
    cancel: CancellationToken,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = sighup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    tracing::info!(config = %config_path, "SIGHUP received, reloading config");
                    match Config::load(&config_path) {
                        Ok(new_cfg) => {
                            if let Err(err) = engine.reload(new_cfg) {
                                tracing::error!(error = %err, "hot-reload failed, keeping current config");
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "hot-reload: invalid config, keeping current");
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

/// Serves the Prometheus text endpoint until shutdown.
fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16, cancel: CancellationToken) {
    use axum::routing::get;
    use axum::Router;

    tokio::spawn(async move {
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { metrics.gather() }
            }),
        );

        let addr = format!("0.0.0.0:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%addr, error = %err, "metrics endpoint failed to bind");
                return;
            }
        };

        tracing::info!(%addr, "prometheus metrics endpoint listening");
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %err, "metrics server error");
        }
    });
}

fn init_logger(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("footfall={level},{level}")));

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
    Ok(())
}

fn print_dry_run(path: &str, cfg: &Config) {
    println!("Config: {path}  ✓ valid\n");

    let total_weight: u64 = cfg.targets.iter().map(|t| u64::from(t.weight)).sum();

    let mut sorted: Vec<&TargetConfig> = cfg.targets.iter().collect();
    sorted.sort_by(|a, b| b.weight.cmp(&a.weight));

    println!("Targets ({}):", sorted.len());
    println!("  {:<40} {:<10} {:<10} SHARE", "URL", "TYPE", "WEIGHT");
    for t in &sorted {
        let share = if total_weight > 0 {
            f64::from(t.weight) / total_weight as f64 * 100.0
        } else {
            0.0
        };
        println!("  {:<40} {:<10} {:<10} {share:.1}%", t.url, t.kind, t.weight);
    }
    println!("  Total weight: {total_weight}\n");

    let p = &cfg.pacing;
    match p.mode {
        PacingMode::Human => println!(
            "Pacing:\n  mode: human | delay: {}ms-{}ms (random uniform)",
            p.min_delay_ms, p.max_delay_ms
        ),
        PacingMode::RateLimited => println!(
            "Pacing:\n  mode: rate_limited | rpm: {:.0} (~{:.2} rps) | jitter: <=200ms",
            p.requests_per_minute,
            p.requests_per_minute / 60.0
        ),
        PacingMode::Scheduled => {
            println!("Pacing:\n  mode: scheduled");
            for (i, s) in p.schedule.iter().enumerate() {
                println!(
                    "  [{i}] cron: {:?}  duration: {}m  rpm: {:.0}",
                    s.cron, s.duration_minutes, s.requests_per_minute
                );
            }
        }
    }
    println!();

    let l = &cfg.limits;
    println!(
        "Limits:\n  workers: {} (browser: {}) | cpu: {:.0}% | memory: {} MB",
        l.max_workers, l.max_browser_workers, l.cpu_threshold_pct, l.memory_threshold_mb
    );
}

/// Builds the one-off task a probe run executes repeatedly.
pub(crate) fn probe_task(
    target: &str,
    kind: TaskKind,
    timeout: Duration,
    resolver: &str,
    record_type: &str,
) -> Task {
    let mut config = TargetConfig {
        url: target.to_string(),
        weight: 1,
        kind,
        ..TargetConfig::default()
    };
    config.http.timeout_s = timeout.as_secs().max(1);
    config.dns.resolver = resolver.to_string();
    config.dns.record_type = record_type.to_string();

    Task {
        url: target.to_string(),
        kind,
        config,
    }
}

/// Picks the probe driver for the detected target type.
pub(crate) fn probe_driver(kind: TaskKind) -> Result<Arc<dyn Driver>> {
    match kind {
        TaskKind::Http => Ok(Arc::new(HttpDriver::new()?)),
        TaskKind::Dns => Ok(Arc::new(DnsDriver::new())),
        _ => anyhow::bail!("probe supports http and dns targets; got type {kind:?}"),
    }
}

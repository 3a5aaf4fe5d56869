use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use footfall_core::{Driver, DriverError, Task, TaskResult};

const DEFAULT_TIMEOUT_S: u64 = 30;

/// Driver that visits targets with a real rendering engine.
///
/// Browser targets exist for pages where plain HTTP traffic looks wrong:
/// the page only makes sense once its JavaScript has run (SPAs,
/// lazy-loaded content). One headless Chromium process is started on the
/// first browser task and reused for the rest of the run; every task gets
/// its own tab, executes the target's wait/scroll actions, and tears the
/// tab down again so memory stays flat.
pub struct BrowserDriver {
    browser: OnceCell<Arc<Browser>>,
}

impl BrowserDriver {
    pub fn new() -> Self {
        Self {
            browser: OnceCell::new(),
        }
    }

    async fn browser(&self) -> Result<&Arc<Browser>, DriverError> {
        self.browser.get_or_try_init(launch_browser).await
    }

    async fn visit(&self, task: &Task) -> Result<(), DriverError> {
        let cfg = &task.config.browser;
        let browser = self.browser().await?;

        let page = browser
            .new_page(task.url.as_str())
            .await
            .map_err(|e| DriverError::Connect(format!("navigating to {}: {e}", task.url)))?;

        let outcome = async {
            page.wait_for_navigation()
                .await
                .map_err(|e| DriverError::Protocol(format!("waiting for load: {e}")))?;

            if !cfg.wait_for_selector.is_empty() {
                page.find_element(cfg.wait_for_selector.as_str())
                    .await
                    .map_err(|e| {
                        DriverError::Protocol(format!(
                            "selector {:?} did not appear: {e}",
                            cfg.wait_for_selector
                        ))
                    })?;
            }

            if cfg.scroll {
                page.evaluate("window.scrollTo(0, document.body.scrollHeight / 2)")
                    .await
                    .map_err(|e| DriverError::Protocol(format!("scrolling: {e}")))?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                    .await
                    .map_err(|e| DriverError::Protocol(format!("scrolling: {e}")))?;
            }

            Ok(())
        }
        .await;

        // Tab teardown happens on success and failure alike.
        let _ = page.close().await;
        outcome
    }
}

impl Default for BrowserDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for BrowserDriver {
    async fn execute(&self, cancel: &CancellationToken, task: Task) -> TaskResult {
        let timeout_s = match task.config.browser.timeout_s {
            0 => DEFAULT_TIMEOUT_S,
            t => t,
        };

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DriverError::Cancelled),
            outcome = tokio::time::timeout(
                Duration::from_secs(timeout_s),
                self.visit(&task),
            ) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(DriverError::Timeout(timeout_s)),
            },
        };
        let duration = start.elapsed();

        match outcome {
            Ok(()) => TaskResult {
                task,
                status_code: 200,
                duration,
                bytes_read: 0,
                error: None,
            },
            Err(error) => TaskResult::from_error(task, duration, error),
        }
    }
}

/// Flags applied on top of chromiumoxide's defaults. Traffic generation
/// wants a quiet browser: no GPU, no audio, no first-run chrome.
const LAUNCH_FLAGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--mute-audio",
    "--no-first-run",
    "--disable-extensions",
];

/// Install locations probed when `CHROME_BIN` is unset. The snap path
/// comes first: `/snap/bin/chromium` is a wrapper that strips the
/// headless flags, so only the binary inside the snap is usable.
const CHROME_LOCATIONS: &[&str] = &[
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
];

async fn launch_browser() -> Result<Arc<Browser>, DriverError> {
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .disable_default_args()
        .args(LAUNCH_FLAGS.iter().copied());

    match chrome_binary() {
        Some(bin) => {
            tracing::info!(binary = %bin.display(), "launching Chromium");
            builder = builder.chrome_executable(bin);
        }
        // No known location matched; chromiumoxide runs its own lookup.
        None => tracing::info!("no Chromium install found at known paths, using default lookup"),
    }

    let config = builder
        .build()
        .map_err(|e| DriverError::Protocol(format!("browser config: {e}")))?;

    let (browser, handler) = Browser::launch(config)
        .await
        .map_err(|e| DriverError::Connect(format!("launching browser: {e}")))?;

    tokio::spawn(supervise_cdp(handler));
    Ok(Arc::new(browser))
}

/// Drains the CDP event stream for the lifetime of the browser.
///
/// chromiumoxide delivers every DevTools event through this stream; if
/// nobody polls it the connection stalls and page calls hang. An error on
/// the stream means the browser process is gone, so the supervisor exits
/// and the next task fails over to a fresh `new_page` error.
async fn supervise_cdp(mut handler: chromiumoxide::Handler) {
    loop {
        match handler.next().await {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                tracing::warn!(error = %err, "browser connection lost");
                return;
            }
            None => return,
        }
    }
}

/// Resolves the Chromium binary to launch.
///
/// `CHROME_BIN` wins when it points at a real file; otherwise the
/// well-known locations in [`CHROME_LOCATIONS`] are probed in order.
fn chrome_binary() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("CHROME_BIN") {
        let path = PathBuf::from(explicit);
        if path.is_file() {
            return Some(path);
        }
        tracing::warn!(
            path = %path.display(),
            "CHROME_BIN does not point at a file, probing known locations"
        );
    }

    CHROME_LOCATIONS.iter().map(PathBuf::from).find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use footfall_core::TaskKind;

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits_without_launching() {
        let driver = BrowserDriver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let task = Task {
            url: "https://example.com".into(),
            kind: TaskKind::Browser,
            config: Default::default(),
        };
        let result = driver.execute(&cancel, task).await;
        assert!(matches!(result.error, Some(DriverError::Cancelled)));
    }
}

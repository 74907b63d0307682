//! One headless browser per capture
//!
//! A [`RenderSession`] owns a Chromium process, the task pumping its
//! DevTools connection and a throwaway profile directory. It is created for
//! a single capture and torn down before that capture returns, on every
//! path. [`RenderSession::shutdown`] is the orderly exit; if a session is
//! dropped without it (a cancelled future, a panic) the `Drop` impl stops
//! the handler and chromiumoxide kills the process.
//!
//! [`RenderSessionManager`] only sees sessions through [`SessionLauncher`]
//! and [`CaptureSession`], so the launch, render, close ordering can be
//! driven without a browser.

use crate::{
    create_browser_config, ArtifactStore, CacheKey, Capture, CaptureStrategy, Capturer, Config,
    Metrics, PreviewError, StoredArtifact, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Extra time given to chromiumoxide's own launch timeout so it can clean up
/// the child before ours fires.
const LAUNCH_GRACE: Duration = Duration::from_secs(5);

/// Starts one browser session per capture.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    type Session: CaptureSession;

    async fn launch(&self, config: &Config) -> Result<Self::Session, PreviewError>;
}

/// A live browser that can render a page and must be closed afterwards.
#[async_trait]
pub trait CaptureSession: Send + Sync + Sized {
    /// Open a page, load `url` and capture it with `strategy`.
    async fn render(
        &self,
        url: &str,
        config: &Config,
        strategy: &CaptureStrategy,
    ) -> Result<Capture, PreviewError>;

    /// Tear the browser down. An error here fails the capture.
    async fn close(self, close_timeout: Duration) -> Result<(), PreviewError>;
}

/// Launches a local headless Chromium.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromiumLauncher;

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    type Session = RenderSession;

    async fn launch(&self, config: &Config) -> Result<RenderSession, PreviewError> {
        RenderSession::launch(config).await
    }
}

pub struct RenderSession {
    browser: Browser,
    handler: JoinHandle<()>,
    _profile: TempDir,
    closed: bool,
}

impl RenderSession {
    pub async fn launch(config: &Config) -> Result<Self, PreviewError> {
        let profile = tempfile::Builder::new()
            .prefix("og-preview-profile-")
            .tempdir()
            .map_err(|e| {
                PreviewError::BrowserLaunchFailed(format!("cannot create profile dir: {e}"))
            })?;

        let browser_config = create_browser_config(config, profile.path())?;
        let started = Instant::now();

        let (browser, mut handler) =
            match timeout(config.launch_timeout + LAUNCH_GRACE, Browser::launch(browser_config))
                .await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(_)) if started.elapsed() >= config.launch_timeout => {
                    return Err(PreviewError::LaunchTimeout(config.launch_timeout))
                }
                Ok(Err(e)) => return Err(PreviewError::BrowserLaunchFailed(e.to_string())),
                Err(_) => return Err(PreviewError::LaunchTimeout(config.launch_timeout)),
            };

        // The handler must be polled for the DevTools connection to make progress.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "devtools handler error");
                }
            }
            debug!("devtools handler stream ended");
        });

        debug!(elapsed = ?started.elapsed(), "browser launched");

        Ok(Self {
            browser,
            handler,
            _profile: profile,
            closed: false,
        })
    }

    /// Open a blank page with the given viewport applied.
    pub async fn open_page(&self, viewport: &Viewport) -> Result<Page, PreviewError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| PreviewError::CaptureFailed(format!("cannot open page: {e}")))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(PreviewError::CaptureFailed)?;

        page.execute(metrics)
            .await
            .map_err(|e| PreviewError::CaptureFailed(format!("cannot set viewport: {e}")))?;

        Ok(page)
    }

    /// Load `url` and wait for its load event.
    pub async fn navigate(
        &self,
        page: &Page,
        url: &str,
        navigation_timeout: Duration,
    ) -> Result<(), PreviewError> {
        match timeout(navigation_timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(PreviewError::NavigationFailed(format!("{url}: {e}"))),
            Err(_) => {
                return Err(PreviewError::NavigationFailed(format!(
                    "{url}: timed out after {navigation_timeout:?}"
                )))
            }
        }

        // Chromium reports network failures by showing its own error page.
        let landed = page.url().await.ok().flatten().unwrap_or_default();
        if landed.starts_with("chrome-error://") {
            return Err(PreviewError::NavigationFailed(format!(
                "{url}: page failed to load"
            )));
        }

        Ok(())
    }

    /// Shut the browser down, killing it if it does not exit in time.
    ///
    /// A browser that has to be killed still fails the request.
    pub async fn shutdown(mut self, close_timeout: Duration) -> Result<(), PreviewError> {
        self.closed = true;

        let browser = &mut self.browser;
        let shutdown = async {
            browser.close().await.map_err(|e| e.to_string())?;
            browser.wait().await.map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        };

        let result = match timeout(close_timeout, shutdown).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("browser close failed: {e}")),
            Err(_) => Err(format!("browser did not close within {close_timeout:?}")),
        };

        if let Err(reason) = &result {
            warn!(reason = %reason, "killing browser");
            if let Some(Err(e)) = self.browser.kill().await {
                error!(error = %e, "failed to kill browser process");
            }
        }

        self.handler.abort();
        result.map_err(PreviewError::CaptureFailed)
    }
}

#[async_trait]
impl CaptureSession for RenderSession {
    async fn render(
        &self,
        url: &str,
        config: &Config,
        strategy: &CaptureStrategy,
    ) -> Result<Capture, PreviewError> {
        let page = self.open_page(&config.viewport).await?;
        self.navigate(&page, url, config.navigation_timeout).await?;

        if !config.settle_delay.is_zero() {
            sleep(config.settle_delay).await;
        }

        strategy.capture(&page).await
    }

    async fn close(self, close_timeout: Duration) -> Result<(), PreviewError> {
        self.shutdown(close_timeout).await
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!("render session dropped without close, browser will be killed");
        }
        self.handler.abort();
    }
}

/// Renders target URLs into the artifact store, one browser per call.
pub struct RenderSessionManager<L = ChromiumLauncher> {
    launcher: L,
    config: Config,
    store: ArtifactStore,
    strategy: CaptureStrategy,
    metrics: Arc<Metrics>,
}

impl RenderSessionManager {
    pub fn new(config: Config, store: ArtifactStore, metrics: Arc<Metrics>) -> Self {
        Self::with_launcher(ChromiumLauncher, config, store, metrics)
    }
}

impl<L: SessionLauncher> RenderSessionManager<L> {
    pub fn with_launcher(
        launcher: L,
        config: Config,
        store: ArtifactStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        let strategy = CaptureStrategy::new(config.content_selector.clone(), config.selector_timeout);
        Self {
            launcher,
            config,
            store,
            strategy,
            metrics,
        }
    }

    /// Launch, render and close. The session is closed exactly once whether
    /// or not rendering succeeded, and a failed close fails the render.
    async fn render(&self, target_url: &str) -> Result<Capture, PreviewError> {
        let session = self.launcher.launch(&self.config).await?;

        let captured = session.render(target_url, &self.config, &self.strategy).await;
        let closed = session.close(self.config.close_timeout).await;

        let capture = captured?;
        closed?;
        Ok(capture)
    }
}

#[async_trait]
impl<L: SessionLauncher> Capturer for RenderSessionManager<L> {
    async fn capture(&self, target_url: &str, key: &CacheKey) -> Result<StoredArtifact, PreviewError> {
        let started = Instant::now();
        info!(url = target_url, key = %key, "capturing screenshot");

        let result = match self.render(target_url).await {
            Ok(capture) => {
                if capture.outcome.is_fallback() {
                    self.metrics.record_fallback();
                }
                self.store
                    .commit(key, &capture.png)
                    .await
                    .map(|artifact| (artifact, capture.outcome))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((artifact, outcome)) => {
                info!(
                    key = %key,
                    path = %artifact.path.display(),
                    size = %crate::format_bytes(artifact.size),
                    width = artifact.width,
                    height = artifact.height,
                    outcome = ?outcome,
                    elapsed = %crate::format_duration(started.elapsed()),
                    "screenshot stored"
                );
                Ok(artifact)
            }
            Err(e) => {
                error!(url = target_url, key = %key, error = %e, "error during screenshot capture");
                Err(PreviewError::ScreenshotCaptureFailed)
            }
        }
    }
}

//! Choice of what part of a rendered page becomes the preview image
//!
//! The strategy waits a bounded time for the content element. If it shows
//! up, the image is cropped to it; otherwise the whole viewport is captured.
//! Which of the two happened is reported as a [`CaptureOutcome`] so callers
//! and tests can observe the fallback instead of inferring it from logs.

use crate::{poll_until, PreviewError};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Something that can be screenshotted: a live page in production, a fake
/// in tests.
#[async_trait]
pub trait CaptureTarget: Send + Sync {
    type Element: Send + Sync;

    /// Look the selector up once; `None` when it matches nothing yet.
    async fn find_element(&self, selector: &str) -> Option<Self::Element>;

    async fn element_screenshot(&self, element: &Self::Element) -> Result<Vec<u8>, PreviewError>;

    async fn viewport_screenshot(&self) -> Result<Vec<u8>, PreviewError>;
}

#[async_trait]
impl CaptureTarget for Page {
    type Element = Element;

    async fn find_element(&self, selector: &str) -> Option<Element> {
        Page::find_element(self, selector).await.ok()
    }

    async fn element_screenshot(&self, element: &Element) -> Result<Vec<u8>, PreviewError> {
        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| PreviewError::CaptureFailed(e.to_string()))
    }

    async fn viewport_screenshot(&self) -> Result<Vec<u8>, PreviewError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();

        self.screenshot(params)
            .await
            .map_err(|e| PreviewError::CaptureFailed(e.to_string()))
    }
}

/// Why the element-scoped capture was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The selector matched nothing within the wait
    SelectorTimeout,
    /// The element was found but screenshotting it failed
    ElementCaptureFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Cropped to the content element's bounding box
    Element,
    /// The whole viewport
    FullPage { reason: FallbackReason },
}

impl CaptureOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, CaptureOutcome::FullPage { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub png: Vec<u8>,
    pub outcome: CaptureOutcome,
}

#[derive(Debug, Clone)]
pub struct CaptureStrategy {
    selector: String,
    selector_timeout: Duration,
    poll_interval: Duration,
}

impl CaptureStrategy {
    pub fn new(selector: impl Into<String>, selector_timeout: Duration) -> Self {
        Self {
            selector: selector.into(),
            selector_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Take the preview screenshot of `target`.
    ///
    /// Only a failing viewport screenshot is an error; a missing or
    /// unscreenshottable element degrades to the full-page capture.
    pub async fn capture<T: CaptureTarget>(&self, target: &T) -> Result<Capture, PreviewError> {
        let selector = self.selector.as_str();
        let found = poll_until(self.selector_timeout, self.poll_interval, || {
            target.find_element(selector)
        })
        .await;

        let reason = match found {
            Some(element) => match target.element_screenshot(&element).await {
                Ok(png) => {
                    debug!(selector, bytes = png.len(), "captured content element");
                    return Ok(Capture {
                        png,
                        outcome: CaptureOutcome::Element,
                    });
                }
                Err(e) => {
                    warn!(selector, error = %e, "element screenshot failed, capturing full page");
                    FallbackReason::ElementCaptureFailed(e.to_string())
                }
            },
            None => {
                info!(
                    selector,
                    waited = ?self.selector_timeout,
                    "element not found, capturing full page screenshot"
                );
                FallbackReason::SelectorTimeout
            }
        };

        let png = target.viewport_screenshot().await?;
        Ok(Capture {
            png,
            outcome: CaptureOutcome::FullPage { reason },
        })
    }
}

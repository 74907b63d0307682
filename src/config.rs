//! Configuration management with serde serialization/deserialization
//!
//! Everything the capture pipeline used to hard-code (artifact directory,
//! viewport, content selector, timeouts) lives here and is passed into the
//! [`PreviewService`](crate::PreviewService) at construction.

use crate::PreviewError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the preview service
///
/// # Examples
///
/// ```rust
/// use og_preview::Config;
/// use std::time::Duration;
///
/// let config = Config {
///     content_selector: "#schedule".to_string(),
///     selector_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `{key}.png` artifacts (default: `public/images`)
    ///
    /// The same directory is served at `/images` by the HTTP layer.
    pub images_dir: PathBuf,

    /// Browser viewport used for every capture (default: 1200x630)
    pub viewport: Viewport,

    /// CSS selector of the element to crop to (default: `.timetable`)
    ///
    /// When the element does not show up within `selector_timeout` the
    /// whole viewport is captured instead.
    pub content_selector: String,

    /// Upper bound for starting Chromium (default: 60 seconds)
    pub launch_timeout: Duration,

    /// Upper bound for loading the target page (default: 60 seconds)
    pub navigation_timeout: Duration,

    /// How long to poll for `content_selector` (default: 10 seconds)
    pub selector_timeout: Duration,

    /// Pause after load so client-side rendering can finish (default: 1 second)
    pub settle_delay: Duration,

    /// Upper bound for shutting the browser down (default: 10 seconds)
    ///
    /// If closing takes longer the process is killed and the request fails.
    pub close_timeout: Duration,

    /// Maximum number of browser processes alive at once
    ///
    /// Captures for the same key are always de-duplicated; this limits
    /// captures for distinct keys.
    pub max_concurrent_captures: usize,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for the rendered page
    pub user_agent: Option<String>,

    /// Honor `X-Forwarded-Proto` when building artifact URLs (default: false)
    ///
    /// Enable only behind a reverse proxy that sets the header.
    pub trust_forwarded_proto: bool,

    /// Open-graph preview page settings
    pub preview: PreviewPageConfig,

    /// HTTP listener settings
    pub server: ServerConfig,

    /// Install the Prometheus recorder and expose `/metrics` (default: false)
    pub enable_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("public/images"),
            viewport: Viewport::default(),
            content_selector: ".timetable".to_string(),
            launch_timeout: Duration::from_secs(60),
            navigation_timeout: Duration::from_secs(60),
            selector_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            close_timeout: Duration::from_secs(10),
            max_concurrent_captures: num_cpus::get().clamp(1, 4),
            chrome_path: None,
            user_agent: None,
            trust_forwarded_proto: false,
            preview: PreviewPageConfig::default(),
            server: ServerConfig::default(),
            enable_metrics: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PreviewError> {
        if self.images_dir.as_os_str().is_empty() {
            return Err(PreviewError::ConfigurationError(
                "Images directory must not be empty".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(PreviewError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.viewport.device_scale_factor <= 0.0 {
            return Err(PreviewError::ConfigurationError(
                "Device scale factor must be greater than 0".to_string(),
            ));
        }

        if self.content_selector.trim().is_empty() {
            return Err(PreviewError::ConfigurationError(
                "Content selector must not be empty".to_string(),
            ));
        }

        for (name, timeout) in [
            ("Launch timeout", self.launch_timeout),
            ("Navigation timeout", self.navigation_timeout),
            ("Selector timeout", self.selector_timeout),
            ("Close timeout", self.close_timeout),
        ] {
            if timeout.is_zero() {
                return Err(PreviewError::ConfigurationError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.max_concurrent_captures == 0 {
            return Err(PreviewError::ConfigurationError(
                "Max concurrent captures must be greater than 0".to_string(),
            ));
        }

        if let Some(site_url) = &self.preview.site_url {
            crate::validate_url(site_url).map_err(|e| {
                PreviewError::ConfigurationError(format!("Invalid preview site URL: {e}"))
            })?;
        }

        Ok(())
    }

    /// Worst-case latency of a cache miss, used for log context.
    pub fn capture_budget(&self) -> Duration {
        self.launch_timeout
            + self.navigation_timeout
            + self.settle_delay
            + self.selector_timeout
            + self.close_timeout
    }
}

/// Browser viewport configuration
///
/// The default matches the canonical open-graph image size.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 630,
            device_scale_factor: 1.0,
        }
    }
}

/// Settings for the `/preview/{date}` open-graph page
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PreviewPageConfig {
    /// Front-end the preview page redirects to, as `{site_url}/?date={date}`
    ///
    /// When unset the page carries no redirect.
    pub site_url: Option<String>,

    /// Prefix for `og:title`, followed by the date
    pub title_prefix: String,

    /// Value of `og:description`
    pub description: String,
}

impl Default for PreviewPageConfig {
    fn default() -> Self {
        Self {
            site_url: None,
            title_prefix: "Lecture Schedule for".to_string(),
            description: "Timetable preview".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            bind: "0.0.0.0".to_string(),
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// Sandboxing and GPU acceleration are always disabled; constrained server
/// environments cannot run the setuid sandbox.
///
/// # Examples
///
/// ```rust
/// use og_preview::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default());
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

/// Build the chromiumoxide launch configuration for one render session
///
/// Each session gets its own `user_data_dir` so parallel sessions never
/// trip over Chromium's profile singleton lock.
pub fn create_browser_config(
    config: &Config,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, PreviewError> {
    use chromiumoxide::browser::BrowserConfig;
    use chromiumoxide::handler::viewport::Viewport as ChromeViewport;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .viewport(ChromeViewport {
            width: config.viewport.width,
            height: config.viewport.height,
            device_scale_factor: Some(config.viewport.device_scale_factor),
            emulating_mobile: false,
            is_landscape: config.viewport.width > config.viewport.height,
            has_touch: false,
        })
        .launch_timeout(config.launch_timeout)
        .request_timeout(config.navigation_timeout)
        .user_data_dir(user_data_dir)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(PreviewError::BrowserLaunchFailed)
}

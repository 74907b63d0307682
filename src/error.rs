use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PreviewError {
    #[error("URL is required")]
    MissingParameter,

    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    #[error("URL has no date parameter: {0}")]
    MissingCacheKey(String),

    #[error("Invalid cache key: {0:?}")]
    InvalidCacheKey(String),

    #[error("Browser launch timed out after {0:?}")]
    LaunchTimeout(Duration),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Error capturing screenshot")]
    ScreenshotCaptureFailed,

    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

impl PreviewError {
    /// Errors caused by what the requester sent, as opposed to failures of
    /// the service itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PreviewError::MissingParameter
                | PreviewError::MalformedUrl(_)
                | PreviewError::MissingCacheKey(_)
                | PreviewError::InvalidCacheKey(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

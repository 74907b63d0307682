//! Request orchestration for open-graph preview images
//!
//! [`PreviewService`] is the entry point used by the HTTP layer and the CLI.
//! It resolves the cache key, answers from the artifact store when it can,
//! and otherwise runs exactly one capture per key at a time: concurrent
//! requests for a key that is already being captured wait for that capture
//! instead of starting a browser of their own.

use crate::{
    extract_cache_key, ArtifactStore, CacheKey, Config, Metrics, PreviewError, RenderSessionManager,
    RequestContext, StoredArtifact,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Produces an artifact for a key by rendering the target URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Capturer: Send + Sync {
    async fn capture(&self, target_url: &str, key: &CacheKey) -> Result<StoredArtifact, PreviewError>;
}

/// Response body of a successful preview request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewImage {
    pub image: String,
}

type SharedCapture = Shared<BoxFuture<'static, Result<PathBuf, PreviewError>>>;

/// Removes a key from the in-flight map when the capture task ends, even if
/// it ends by panicking.
struct InFlightGuard {
    in_flight: Arc<DashMap<CacheKey, SharedCapture>>,
    key: CacheKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Cache-aware preview generation
///
/// # Examples
///
/// ```rust,no_run
/// use og_preview::{Config, Metrics, PreviewService, RequestContext};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = PreviewService::new(Config::default(), Arc::new(Metrics::new()))?;
///     service.ensure_ready().await?;
///
///     let ctx = RequestContext::new("http", "localhost:3000");
///     let preview = service
///         .generate_preview(&ctx, Some("https://example.com/?date=2024-05-01"))
///         .await?;
///     println!("{}", preview.image);
///     Ok(())
/// }
/// ```
pub struct PreviewService {
    config: Config,
    store: ArtifactStore,
    capturer: Arc<dyn Capturer>,
    in_flight: Arc<DashMap<CacheKey, SharedCapture>>,
    capture_limiter: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl PreviewService {
    /// Build a service that captures with headless Chromium.
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Result<Self, PreviewError> {
        config.validate()?;
        let store = ArtifactStore::new(config.images_dir.clone());
        let capturer = Arc::new(RenderSessionManager::new(
            config.clone(),
            store.clone(),
            metrics.clone(),
        ));
        Ok(Self::with_capturer(config, capturer, metrics))
    }

    pub fn with_capturer(config: Config, capturer: Arc<dyn Capturer>, metrics: Arc<Metrics>) -> Self {
        let store = ArtifactStore::new(config.images_dir.clone());
        let capture_limiter = Arc::new(Semaphore::new(config.max_concurrent_captures.max(1)));

        Self {
            config,
            store,
            capturer,
            in_flight: Arc::new(DashMap::new()),
            capture_limiter,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn ensure_ready(&self) -> Result<(), PreviewError> {
        self.store.ensure_dir().await
    }

    /// Return the URL of the preview image for `target_url`, capturing it
    /// first if the store does not have it yet.
    pub async fn generate_preview(
        &self,
        ctx: &RequestContext,
        target_url: Option<&str>,
    ) -> Result<PreviewImage, PreviewError> {
        let target_url = target_url
            .filter(|url| !url.is_empty())
            .ok_or(PreviewError::MissingParameter)?;

        let date = extract_cache_key(target_url)?
            .ok_or_else(|| PreviewError::MissingCacheKey(target_url.to_string()))?;
        let key = CacheKey::new(date)?;

        if self.store.exists(&key).await? {
            self.metrics.record_cache_lookup(true);
            info!(key = %key, "serving from existing image");
            return Ok(PreviewImage {
                image: self.store.resolve_url(ctx, &key),
            });
        }

        self.metrics.record_cache_lookup(false);
        self.capture_once(target_url, &key).await?;

        Ok(PreviewImage {
            image: self.store.resolve_url(ctx, &key),
        })
    }

    /// Flush the whole artifact store. Irreversible.
    pub async fn purge(&self) -> Result<usize, PreviewError> {
        let removed = self.store.purge_all().await?;
        self.metrics.record_purge(removed);
        Ok(removed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Join the capture already running for `key`, or start one.
    async fn capture_once(&self, target_url: &str, key: &CacheKey) -> Result<PathBuf, PreviewError> {
        let capture = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.metrics.record_joined();
                debug!(key = %key, "joining capture in flight");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let capture = self.spawn_capture(target_url.to_string(), key.clone());
                entry.insert(capture.clone());
                capture
            }
        };

        capture.await
    }

    /// Run the capture on its own task so a caller going away does not
    /// cancel it for the others waiting on the same key.
    fn spawn_capture(&self, target_url: String, key: CacheKey) -> SharedCapture {
        let service = self.clone();
        let task = tokio::spawn(async move {
            let _guard = InFlightGuard {
                in_flight: service.in_flight.clone(),
                key: key.clone(),
            };
            service.run_capture(&target_url, &key).await
        });

        async move {
            task.await.unwrap_or_else(|e| {
                error!(error = %e, "capture task aborted");
                Err(PreviewError::ScreenshotCaptureFailed)
            })
        }
        .boxed()
        .shared()
    }

    async fn run_capture(&self, target_url: &str, key: &CacheKey) -> Result<PathBuf, PreviewError> {
        let _permit = self
            .capture_limiter
            .acquire()
            .await
            .map_err(|_| PreviewError::ScreenshotCaptureFailed)?;

        // A capture for this key may have been committed while we queued.
        if self.store.exists(key).await? {
            debug!(key = %key, "artifact appeared while waiting, skipping capture");
            return Ok(self.store.path_for(key));
        }

        let started = Instant::now();
        self.metrics.record_capture_started();
        let result = self.capturer.capture(target_url, key).await;
        self.metrics
            .record_capture_finished(started.elapsed(), result.is_ok());

        let artifact = result?;
        info!(key = %key, path = %artifact.path.display(), "generated preview image");
        Ok(artifact.path)
    }
}

impl Clone for PreviewService {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            capturer: self.capturer.clone(),
            in_flight: self.in_flight.clone(),
            capture_limiter: self.capture_limiter.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        image::RgbaImage::new(width, height)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    /// Stands in for the browser: writes a blank 1200x630 image after an
    /// optional delay and counts how often it ran.
    struct CountingCapturer {
        store: ArtifactStore,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingCapturer {
        fn new(dir: &Path) -> Self {
            Self {
                store: ArtifactStore::new(dir),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Capturer for CountingCapturer {
        async fn capture(&self, _target_url: &str, key: &CacheKey) -> Result<StoredArtifact, PreviewError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(PreviewError::ScreenshotCaptureFailed);
            }
            self.store.commit(key, &png_bytes(1200, 630)).await
        }
    }

    fn images(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("images")
    }

    fn config(dir: &Path) -> Config {
        Config {
            images_dir: dir.to_path_buf(),
            max_concurrent_captures: 4,
            ..Default::default()
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("http", "localhost:3000")
    }

    fn service_with(dir: &Path, capturer: Arc<dyn Capturer>) -> PreviewService {
        PreviewService::with_capturer(config(dir), capturer, Arc::new(Metrics::new()))
    }

    const URL: &str = "https://example.com/?date=2024-05-01";

    #[tokio::test]
    async fn test_missing_url_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCapturer::new();
        mock.expect_capture().never();
        let service = service_with(&images(&dir), Arc::new(mock));

        for url in [None, Some("")] {
            let err = service.generate_preview(&ctx(), url).await.unwrap_err();
            assert!(matches!(err, PreviewError::MissingParameter));
            assert!(err.is_client_error());
        }
    }

    #[tokio::test]
    async fn test_bad_urls_are_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCapturer::new();
        mock.expect_capture().never();
        let service = service_with(&images(&dir), Arc::new(mock));

        let err = service.generate_preview(&ctx(), Some("not a url")).await.unwrap_err();
        assert!(matches!(err, PreviewError::MalformedUrl(_)));

        let err = service
            .generate_preview(&ctx(), Some("https://example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::MissingCacheKey(_)));

        for url in [
            "https://example.com/?date=..%2F..%2Fetc",
            "https://example.com/?date=",
            "https://example.com/?date=.hidden",
        ] {
            let err = service.generate_preview(&ctx(), Some(url)).await.unwrap_err();
            assert!(matches!(err, PreviewError::InvalidCacheKey(_)), "{url}");
            assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_second_request_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = Arc::new(CountingCapturer::new(&images(&dir)));
        let service = service_with(&images(&dir), capturer.clone());

        let first = service.generate_preview(&ctx(), Some(URL)).await.unwrap();
        let second = service.generate_preview(&ctx(), Some(URL)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.image, "http://localhost:3000/images/2024-05-01.png");
        assert_eq!(capturer.calls(), 1);
        assert_eq!(service.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_artifact_skips_capture() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(images(&dir));
        store
            .commit(&CacheKey::new("2024-05-01").unwrap(), &png_bytes(8, 8))
            .await
            .unwrap();

        let mut mock = MockCapturer::new();
        mock.expect_capture().never();
        let service = service_with(&images(&dir), Arc::new(mock));

        let preview = service
            .generate_preview(&ctx(), Some("https://other.example.org/page?x=1&date=2024-05-01"))
            .await
            .unwrap();
        assert_eq!(preview.image, "http://localhost:3000/images/2024-05-01.png");
    }

    #[tokio::test]
    async fn test_purge_forces_recapture() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = Arc::new(CountingCapturer::new(&images(&dir)));
        let service = service_with(&images(&dir), capturer.clone());
        let key = CacheKey::new("2024-05-01").unwrap();

        service.generate_preview(&ctx(), Some(URL)).await.unwrap();
        assert!(service.store().exists(&key).await.unwrap());

        assert_eq!(service.purge().await.unwrap(), 1);
        assert!(!service.store().exists(&key).await.unwrap());

        service.generate_preview(&ctx(), Some(URL)).await.unwrap();
        assert_eq!(capturer.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_capture() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = Arc::new(CountingCapturer {
            delay: Duration::from_millis(200),
            ..CountingCapturer::new(&images(&dir))
        });
        let service = service_with(&images(&dir), capturer.clone());

        let requests = (0..8).map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                let url = format!("https://example.com/v{i}?date=2024-05-01");
                service.generate_preview(&ctx(), Some(&url)).await
            })
        });
        let results = futures::future::join_all(requests).await;

        for result in results {
            let preview = result.unwrap().unwrap();
            assert_eq!(preview.image, "http://localhost:3000/images/2024-05-01.png");
        }
        assert_eq!(capturer.calls(), 1);
        assert_eq!(service.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_keys_capture_independently() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = Arc::new(CountingCapturer {
            delay: Duration::from_millis(50),
            ..CountingCapturer::new(&images(&dir))
        });
        let service = service_with(&images(&dir), capturer.clone());

        let requests = ["2024-05-01", "2024-05-02", "2024-05-03"].map(|date| {
            let service = service.clone();
            tokio::spawn(async move {
                let url = format!("https://example.com/?date={date}");
                service.generate_preview(&ctx(), Some(&url)).await
            })
        });
        for result in futures::future::join_all(requests).await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(capturer.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_capture_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCapturer::new();
        mock.expect_capture()
            .times(2)
            .returning(|_, _| Err(PreviewError::ScreenshotCaptureFailed));
        let service = service_with(&images(&dir), Arc::new(mock));

        for _ in 0..2 {
            let err = service.generate_preview(&ctx(), Some(URL)).await.unwrap_err();
            assert!(matches!(err, PreviewError::ScreenshotCaptureFailed));
            assert!(!err.is_client_error());
        }
        assert!(!service
            .store()
            .exists(&CacheKey::new("2024-05-01").unwrap())
            .await
            .unwrap());
        assert_eq!(service.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_capturer_receives_full_url_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCapturer::new();
        mock.expect_capture()
            .withf(|url, key| url == URL && key.as_str() == "2024-05-01")
            .times(1)
            .returning(|_, _| Err(PreviewError::ScreenshotCaptureFailed));
        let service = service_with(&images(&dir), Arc::new(mock));

        assert!(service.generate_preview(&ctx(), Some(URL)).await.is_err());
    }
}

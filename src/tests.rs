#[cfg(test)]
mod integration_tests {
    use crate::{Config, PreviewError, Viewport};
    use std::time::Duration;

    #[test]
    fn test_viewport_default() {
        let viewport = Viewport::default();
        assert_eq!(viewport.width, 1200);
        assert_eq!(viewport.height, 630);
        assert_eq!(viewport.device_scale_factor, 1.0);
    }

    #[test]
    fn test_capture_budget_covers_every_stage() {
        let config = Config::default();
        assert_eq!(config.capture_budget(), Duration::from_secs(141));
    }

    #[test]
    fn test_chrome_args_generation() {
        let config = Config {
            user_agent: Some("og-preview-bot/1.0".to_string()),
            ..Default::default()
        };
        let args = crate::get_chrome_args(&config);

        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-setuid-sandbox".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.contains(&"--window-size=1200,630".to_string()));
        assert!(args.contains(&"--user-agent=og-preview-bot/1.0".to_string()));
    }

    // Building the launch config looks up the Chrome executable.
    #[cfg(feature = "browser_tests")]
    #[test]
    fn test_browser_config_creation() {
        let profile = tempfile::tempdir().unwrap();
        let config = Config::default();
        assert!(crate::create_browser_config(&config, profile.path()).is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "viewport": {"width": 600, "height": 315, "device_scale_factor": 2.0},
                "preview": {"site_url": "https://timetable.example.com"},
                "trust_forwarded_proto": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.viewport.width, 600);
        assert_eq!(config.viewport.device_scale_factor, 2.0);
        assert_eq!(
            config.preview.site_url.as_deref(),
            Some("https://timetable.example.com")
        );
        assert_eq!(config.preview.title_prefix, "Lecture Schedule for");
        assert!(config.trust_forwarded_proto);
        assert_eq!(config.content_selector, ".timetable");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_site_url_rejected() {
        let mut config = Config::default();
        config.preview.site_url = Some("not a url".to_string());
        assert!(matches!(
            config.validate(),
            Err(PreviewError::ConfigurationError(_))
        ));
    }
}

#[cfg(test)]
mod pipeline_tests {
    use crate::{
        extract_cache_key, ArtifactStore, CacheKey, Capturer, Config, Metrics, PreviewError,
        PreviewService, RequestContext, StoredArtifact,
    };
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Arc;

    /// Commits an image with the configured viewport size, like a real
    /// full-page capture would.
    struct ViewportCapturer {
        store: ArtifactStore,
        width: u32,
        height: u32,
    }

    #[async_trait]
    impl Capturer for ViewportCapturer {
        async fn capture(&self, _target_url: &str, key: &CacheKey) -> Result<StoredArtifact, PreviewError> {
            let mut png = Vec::new();
            image::RgbaImage::new(self.width, self.height)
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .map_err(|e| PreviewError::CaptureFailed(e.to_string()))?;
            self.store.commit(key, &png).await
        }
    }

    fn service(dir: &Path) -> PreviewService {
        let dir = dir.join("images");
        let config = Config {
            images_dir: dir.clone(),
            ..Default::default()
        };
        let capturer = ViewportCapturer {
            store: ArtifactStore::new(&dir),
            width: config.viewport.width,
            height: config.viewport.height,
        };
        PreviewService::with_capturer(config, Arc::new(capturer), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_generated_url_points_at_stored_file() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let ctx = RequestContext::new("https", "preview.example.com");
        let url = "https://timetable.example.com/week?group=PI22&date=2024-05-01";

        let preview = service.generate_preview(&ctx, Some(url)).await.unwrap();

        let key = CacheKey::new(extract_cache_key(url).unwrap().unwrap()).unwrap();
        assert!(service.store().exists(&key).await.unwrap());
        assert_eq!(preview.image, service.store().resolve_url(&ctx, &key));
        assert_eq!(
            image::image_dimensions(service.store().path_for(&key)).unwrap(),
            (1200, 630)
        );
    }

    #[tokio::test]
    async fn test_url_follows_request_origin() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let url = "https://timetable.example.com/?date=2024-05-01";

        let a = service
            .generate_preview(&RequestContext::new("http", "localhost:3000"), Some(url))
            .await
            .unwrap();
        let b = service
            .generate_preview(&RequestContext::new("https", "og.example.com"), Some(url))
            .await
            .unwrap();

        assert_eq!(a.image, "http://localhost:3000/images/2024-05-01.png");
        assert_eq!(b.image, "https://og.example.com/images/2024-05-01.png");
    }

    #[tokio::test]
    async fn test_preview_image_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let preview = service
            .generate_preview(
                &RequestContext::new("http", "localhost:3000"),
                Some("https://timetable.example.com/?date=2024-05-01"),
            )
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_value(&preview).unwrap(),
            serde_json::json!({ "image": "http://localhost:3000/images/2024-05-01.png" })
        );
    }

    #[cfg(feature = "browser_tests")]
    #[tokio::test]
    async fn test_real_capture_falls_back_to_viewport() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            images_dir: dir.path().join("images"),
            launch_timeout: std::time::Duration::from_secs(20),
            navigation_timeout: std::time::Duration::from_secs(10),
            selector_timeout: std::time::Duration::from_millis(500),
            settle_delay: std::time::Duration::from_millis(100),
            chrome_path: std::env::var("CHROME_PATH").ok(),
            ..Default::default()
        };
        let service = PreviewService::new(config, Arc::new(Metrics::new())).unwrap();

        let preview = service
            .generate_preview(
                &RequestContext::new("http", "localhost:3000"),
                Some("data:text/html,<p>no timetable</p>?date=fallback"),
            )
            .await
            .unwrap();

        let key = CacheKey::new("fallback").unwrap();
        assert!(preview.image.ends_with("/images/fallback.png"));
        assert_eq!(
            image::image_dimensions(service.store().path_for(&key)).unwrap(),
            (1200, 630)
        );
    }
}

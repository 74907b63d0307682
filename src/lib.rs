//! # og-preview
//!
//! Open-graph preview images for dynamically rendered pages. Social-media
//! crawlers do not run JavaScript, so this service renders the page in
//! headless Chromium, keeps the result as a 1200x630 PNG and hands out its
//! URL.
//!
//! Images are keyed by the `date` query parameter of the page URL: every URL
//! with the same `date` maps to the same `{images_dir}/{date}.png`. The first
//! request for a key pays for a browser launch; later ones are answered from
//! disk until the store is purged.
//!
//! ## Capture pipeline
//!
//! 1. [`extract_cache_key`] reads `date` from the URL and [`CacheKey::new`]
//!    refuses values that are not a plain file stem.
//! 2. [`ArtifactStore::exists`] decides hit or miss.
//! 3. On a miss, [`PreviewService`] starts (or joins) the single capture for
//!    that key.
//! 4. [`RenderSession`] launches Chromium, loads the page and waits for it to
//!    settle.
//! 5. [`CaptureStrategy`] crops to `.timetable`, or falls back to the full
//!    viewport when it never appears.
//! 6. [`ArtifactStore::commit`] stages the PNG next to the store and renames
//!    it into place.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use og_preview::{Config, Metrics, PreviewService, RequestContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = PreviewService::new(Config::default(), Arc::new(Metrics::new()))?;
//!     service.ensure_ready().await?;
//!
//!     let ctx = RequestContext::new("https", "preview.example.com");
//!     let preview = service
//!         .generate_preview(&ctx, Some("https://timetable.example.com/?date=2024-05-01"))
//!         .await?;
//!     println!("{}", preview.image);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # HTTP service on $PORT (default 3000)
//! og-preview serve
//!
//! # One-off capture
//! og-preview capture --url "https://timetable.example.com/?date=2024-05-01"
//!
//! # Flush the image store
//! og-preview purge --yes
//! ```

/// Configuration and settings for the preview service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Cache key extraction from target URLs
pub mod cache_key;

/// Filesystem store for rendered images
pub mod artifact_store;

/// Element-scoped capture with full-page fallback
pub mod capture_strategy;

/// Per-capture headless browser lifecycle
pub mod render_session;

/// Request orchestration and in-flight de-duplication
pub mod preview_service;

/// HTTP routes
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Metrics handles and Prometheus export
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use self::metrics::{Metrics, PrometheusExporter};
pub use artifact_store::*;
pub use cache_key::*;
pub use capture_strategy::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use preview_service::*;
pub use render_session::*;
pub use server::*;
pub use utils::*;

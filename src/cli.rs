use crate::{
    extract_cache_key, serve, CacheKey, Config, Metrics, PreviewService, PrometheusExporter, RequestContext,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "og-preview")]
#[command(about = "Open-graph preview image service backed by headless Chromium")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, env = "OG_PREVIEW_IMAGES_DIR", help = "Directory holding preview images")]
    pub images_dir: Option<PathBuf>,

    #[arg(long, env = "CHROME_PATH", help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(short, long, env = "PORT", help = "Server port [default: 3000]")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,

        #[arg(long, help = "Expose Prometheus metrics at /metrics")]
        metrics: bool,
    },

    /// Generate (or look up) the preview image for one URL
    Capture {
        #[arg(short, long, help = "Page URL carrying a date parameter")]
        url: String,
    },

    /// Delete every stored preview image
    Purge {
        #[arg(long, help = "Confirm the irreversible flush")]
        yes: bool,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply command-line and environment overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(images_dir) = &self.images_dir {
            config.images_dir = images_dir.clone();
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }

        if let Commands::Serve {
            port,
            bind,
            metrics,
        } = &self.command
        {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind.clone();
            }
            if *metrics {
                config.enable_metrics = true;
            }
        }
    }
}

/// Read a JSON config file; missing fields take their defaults.
pub async fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    Ok(config)
}

pub struct CliRunner {
    pub config: Config,
    pub service: PreviewService,
    metrics_handle: Option<PrometheusHandle>,
}

impl CliRunner {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        // The recorder has to exist before the metric handles are created.
        let metrics_handle = if config.enable_metrics {
            Some(PrometheusExporter::install()?)
        } else {
            None
        };

        let metrics = Arc::new(Metrics::new());
        let service = PreviewService::new(config.clone(), metrics)?;

        Ok(Self {
            config,
            service,
            metrics_handle,
        })
    }

    pub async fn run(&self, command: Commands, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
        match command {
            Commands::Serve { .. } => {
                let mut rx = shutdown.subscribe();
                self.run_server(async move {
                    let _ = rx.recv().await;
                })
                .await
            }
            Commands::Capture { url } => {
                let mut rx = shutdown.subscribe();
                tokio::select! {
                    result = self.run_capture(&url) => result,
                    _ = rx.recv() => {
                        warn!("Capture interrupted");
                        Ok(())
                    }
                }
            }
            Commands::Purge { yes } => self.run_purge(yes).await,
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    pub async fn run_server<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(
            images_dir = %self.config.images_dir.display(),
            selector = %self.config.content_selector,
            max_concurrent_captures = self.config.max_concurrent_captures,
            metrics = self.metrics_handle.is_some(),
            "Starting preview server"
        );

        serve(self.service.clone(), self.metrics_handle.clone(), shutdown).await?;
        Ok(())
    }

    pub async fn run_capture(&self, url: &str) -> anyhow::Result<()> {
        info!("Generating preview for: {url}");

        self.service.ensure_ready().await?;
        let ctx = RequestContext::new("http", format!("localhost:{}", self.config.server.port));
        let preview = self.service.generate_preview(&ctx, Some(url)).await?;

        println!("Preview ready:");
        println!("  URL: {url}");
        println!("  Image: {}", preview.image);
        if let Some(key) = extract_cache_key(url)?.map(CacheKey::new).transpose()? {
            println!("  Path: {}", self.service.store().path_for(&key).display());
        }

        Ok(())
    }

    pub async fn run_purge(&self, yes: bool) -> anyhow::Result<()> {
        if !yes {
            bail!(
                "refusing to delete every image in {} without --yes",
                self.config.images_dir.display()
            );
        }

        let removed = self.service.purge().await?;
        println!("Deleted {removed} image(s) from {}", self.config.images_dir.display());
        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = read_config_file(config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Images directory: {}", config.images_dir.display());
        println!(
            "  Viewport: {}x{}",
            config.viewport.width, config.viewport.height
        );
        println!("  Content selector: {}", config.content_selector);
        println!("  Max concurrent captures: {}", config.max_concurrent_captures);
        println!(
            "  Worst-case capture: {}",
            crate::format_duration(config.capture_budget())
        );
        println!(
            "  Listen: {}:{}",
            config.server.bind, config.server.port
        );

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_filter = if verbose {
        "og_preview=debug,tower_http=debug,info"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install log subscriber: {e}"))?;

    Ok(())
}

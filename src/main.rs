use clap::Parser;
use og_preview::{read_config_file, setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting og-preview v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config)?;

    // Setup graceful shutdown
    let (shutdown_tx, _) = broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let result = cli_runner.run(args.command, shutdown_tx).await;

    if let Err(e) = result {
        error!("Application error: {e:#}");
        std::process::exit(1);
    }

    info!("og-preview stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Images directory: {}", config.images_dir.display());
    info!("Content selector: {}", config.content_selector);
    info!("Max concurrent captures: {}", config.max_concurrent_captures);

    Ok(config)
}

fn setup_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interrupt = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to create SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => {
                info!("Received SIGINT");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}

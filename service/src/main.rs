//! `fulfillment` binary entry point.

use anyhow::Result;
use clap::Parser;
use fulfillment_runtime::metrics::MetricsServer;
use fulfillment_service::{Cli, Commands, commands};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment may already be set
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start()?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    let result = match cli.command {
        Commands::Inventory => commands::inventory(&config, shutdown_rx).await,
        Commands::Analytics => commands::analytics(&config, shutdown_rx).await,
        Commands::ReplayAnalytics => commands::replay_analytics(&config, shutdown_rx).await,
        Commands::ResetOffsets(args) => commands::reset_offsets(&config, &args).await,
        Commands::Lag(args) => commands::lag(&config, &args).await,
    };
    if let Err(e) = &result {
        error!(error = format!("{e:#}"), "fulfillment stopped with an error");
    }
    result
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}

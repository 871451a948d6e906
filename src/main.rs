use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rustshard::{DriverFactory, RouterConfig, ShardRouter, api};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rustshard")]
#[command(about = "Shard-aware query router for partitioned relational databases")]
struct Cli {
    /// Router configuration file (JSON)
    #[arg(long, default_value = "config/router.json")]
    config: PathBuf,

    /// Address the HTTP API listens on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = RouterConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load router configuration from {}", cli.config.display()))?;

    let drivers = DriverFactory::new();
    let router = Arc::new(
        ShardRouter::connect(config, &drivers)
            .await
            .context("failed to start shard router")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = router.health_monitor();
    info!(interval_ms = monitor.interval().as_millis() as u64, "starting health monitor");
    let monitor_task = monitor.spawn(shutdown_rx);

    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind to {}", cli.listen))?;
    info!(address = %cli.listen, "rustshard listening");

    let served = axum::serve(listener, api::create_router(Arc::clone(&router)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    let _ = shutdown_tx.send(true);
    if let Err(err) = monitor_task.await {
        error!(error = %err, "health monitor task failed");
    }
    router.shutdown();

    served
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

use std::sync::Arc;

use boxoffice::clock::SystemClock;
use boxoffice::db::postgres::PgStore;
use boxoffice::holds::HoldManager;
use boxoffice::sweeper::ExpirySweeper;
use boxoffice::{Config, telemetry};
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = boxoffice::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;
    tracing::debug!("{:?}", args);

    let pool = boxoffice::connect(&config.database).await?;
    boxoffice::migrator().run(&pool).await?;

    if !config.sweeper.enabled {
        tracing::warn!("Expiry sweeper disabled; nothing to run");
        pool.close().await;
        return Ok(());
    }

    // The service process only sweeps; order and ticket surfaces are embedded by callers.
    let store = Arc::new(PgStore::new(pool.clone()));
    let holds = HoldManager::new(store, Arc::new(SystemClock), config.holds.clone(), config.retry);
    let shutdown_token = CancellationToken::new();
    let sweeper = ExpirySweeper::new(holds, config.sweeper.interval).spawn(shutdown_token.clone());

    shutdown_signal().await;
    shutdown_token.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Expiry sweeper task failed");
    }

    tracing::info!("Closing database connections...");
    pool.close().await;
    Ok(())
}

#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use genserve::runtime::BuiltinLoader;
use server::config::{CliArgs, ServerConfig};
use server::deployment::{Deployment, bind, deploy_all, routers, serve};
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let deployments = deploy_all(&config, Arc::new(BuiltinLoader)).await?;
    let listeners = bind(config.host, routers(&deployments)).await?;
    tracing::info!(
        "Service is deployed successfully ({} of {} deployments ready)",
        deployments.len(),
        config.deployments.len()
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(deployments, providers, shutdown.clone()));
    serve(listeners, shutdown).await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting genserve with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting {} deployments with {} workers each",
            config.deployments.len(),
            config.num_workers
        );
    }
}

async fn shutdown_signal(
    deployments: Vec<Deployment>,
    providers: TelemetryProviders,
    shutdown: CancellationToken,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Refuse new requests, drain streams and stop every worker pool
    futures::future::join_all(deployments.iter().map(|deployment| async move {
        deployment.service.shutdown().await;
        tracing::debug!("Deployment {:?} stopped", deployment.service.name());
    }))
    .await;

    // 2. Flush telemetry
    #[cfg(feature = "tracing")]
    {
        if let Err(err) = providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {err:#?}");
        }
        if let Err(err) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {err:#?}");
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {err:#?}");
        }
        if let Err(err) = providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {err:#?}");
        }
    }
    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    drop(providers);

    // 3. Close the listeners
    shutdown.cancel();
}

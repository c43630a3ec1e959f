//! Deployment orchestration.
//!
//! Starts every configured deployment (tokenizer, stop condition, worker
//! pool), gates each one on its workers answering a ping, and binds the
//! survivors to their ports. Deployments that share a port share one listener
//! with distinct routes. A deployment whose model fails to load is logged and
//! never bound, so its route does not exist.

use super::{
    config::{DeploymentConfig, ServerConfig},
    service::handler::{ModelService, StreamOptions},
};
use anyhow::Context;
use axum::Router;
use genserve::{
    runtime::{LoadOptions, RuntimeLoader},
    stop::StopCondition,
    tokenizer::load_tokenizer,
    worker::{WorkerPool, WorkerSettings},
};
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// A deployment whose workers have all loaded their model.
#[derive(Clone)]
pub struct Deployment {
    pub config: DeploymentConfig,
    pub service: ModelService,
}

impl Deployment {
    /// Starts one deployment and waits (up to the startup timeout) for every
    /// worker to load its model.
    ///
    /// # Errors
    ///
    /// Fails if the tokenizer cannot be loaded, a stop word cannot be
    /// tokenized, or any worker fails to become ready. The workers are shut
    /// down before the error is returned.
    pub async fn start(
        config: &DeploymentConfig,
        server: &ServerConfig,
        loader: Arc<dyn RuntimeLoader>,
    ) -> anyhow::Result<Self> {
        let tokenizer_path = config.tokenizer().to_owned();
        let tokenizer = tokio::task::spawn_blocking(move || load_tokenizer(&tokenizer_path))
            .await
            .context("tokenizer loading task failed")??;
        let stop = StopCondition::from_words(tokenizer.as_ref(), &config.prompt.stop_words)?;

        let settings = WorkerSettings {
            name: config.name.clone(),
            load: LoadOptions {
                model_id: config.model_id_or_path.clone(),
                trust_remote_code: config.trust_remote_code(),
                precision: server.precision,
            },
            loader,
            tokenizer: Arc::clone(&tokenizer),
            stop: Arc::new(stop),
            skip_prompt: server.skip_prompt,
            queue_capacity: server.queue_capacity,
        };
        let pool = WorkerPool::spawn(&settings, server.num_workers, server.shutdown_timeout)?;

        if let Err(e) = pool.ping(server.startup_timeout).await {
            pool.shutdown().await;
            return Err(e.into());
        }

        let service = ModelService::new(
            Arc::new(pool),
            tokenizer,
            StreamOptions {
                buffer_size: server.stream_buffer_size,
                timeout: server.stream_timeout,
            },
        );
        Ok(Self {
            config: config.clone(),
            service,
        })
    }
}

/// Starts all configured deployments concurrently.
///
/// # Errors
///
/// Fails only if no deployment could be started; individual failures are
/// logged and their deployments skipped.
pub async fn deploy_all(
    server: &ServerConfig,
    loader: Arc<dyn RuntimeLoader>,
) -> anyhow::Result<Vec<Deployment>> {
    let starts = server.deployments.iter().map(|config| {
        let loader = Arc::clone(&loader);
        async move {
            tracing::info!(
                "Deploying {:?} ({}) on port {} at {}",
                config.name,
                config.model_id_or_path,
                config.port,
                config.route_prefix
            );
            let result = Deployment::start(config, server, loader).await;
            if let Err(e) = &result {
                tracing::error!("Deployment {:?} failed to start: {e:#}", config.name);
            }
            result
        }
    });

    let deployments: Vec<Deployment> = futures::future::join_all(starts)
        .await
        .into_iter()
        .filter_map(Result::ok)
        .collect();

    if deployments.is_empty() {
        anyhow::bail!("no deployment could be started");
    }
    Ok(deployments)
}

/// Builds one router per port, each serving the routes of every deployment on
/// that port.
pub fn routers(deployments: &[Deployment]) -> BTreeMap<u16, Router> {
    let mut by_port: BTreeMap<u16, Router> = BTreeMap::new();
    for deployment in deployments {
        let routes = deployment.service.router(&deployment.config.route_prefix);
        let router = by_port.remove(&deployment.config.port).unwrap_or_default();
        by_port.insert(deployment.config.port, router.merge(routes));
    }

    by_port
        .into_iter()
        .map(|(port, router)| {
            let router = router.layer(
                ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
            );
            (port, router)
        })
        .collect()
}

/// Binds every port before anything is served, so a taken port fails startup
/// as a whole.
pub async fn bind(
    host: IpAddr,
    routers: BTreeMap<u16, Router>,
) -> anyhow::Result<Vec<(TcpListener, Router)>> {
    let mut listeners = Vec::with_capacity(routers.len());
    for (port, router) in routers {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;
        listeners.push((listener, router));
    }
    Ok(listeners)
}

/// Serves every listener until `shutdown` is cancelled and in-flight
/// connections have completed.
pub async fn serve(
    listeners: Vec<(TcpListener, Router)>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let servers = listeners.into_iter().map(|(listener, router)| {
        let shutdown = shutdown.clone();
        async move {
            let addr = listener.local_addr()?;
            tracing::info!("Listening on http://{addr}");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .with_context(|| format!("server on {addr} failed"))
        }
    });
    futures::future::try_join_all(servers).await?;
    Ok(())
}

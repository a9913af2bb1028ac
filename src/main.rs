use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod api;
mod config;
mod models;
mod services;
mod validation;

use config::Config;
use models::Backend;
use services::execution::cluster::ClusterExecutor;
use services::execution::onprem::OnPremExecutor;
use services::execution::BackendExecutor;
use services::{
    AdmissionController, ConnectionPoolManager, ExecutionDelegator, PgTopologyProvider,
    QueryRouter, TopologyCache,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting server on {}", config.server_address());

    let pool_manager = Arc::new(ConnectionPoolManager::new());

    // Topology comes from the canonical backend and is cached with a TTL
    let canonical_pool = pool_manager
        .get_or_create_pool(Backend::CANONICAL, &config.backends.rainier_url)
        .await
        .map_err(|e| {
            error!("Failed to reach the canonical backend: {}", e);
            e
        })?;
    let topology = Arc::new(TopologyCache::new(
        Arc::new(PgTopologyProvider::new(canonical_pool)),
        Duration::from_secs(config.router.topology_ttl_secs),
    ));

    // One executor per physical backend
    let batch_rows = config.router.row_batch;
    let mut executors: HashMap<Backend, Arc<dyn BackendExecutor>> = HashMap::new();
    for (backend, url) in [
        (Backend::Rainier, &config.backends.rainier_url),
        (Backend::Mariana, &config.backends.mariana_url),
        (Backend::Rossby, &config.backends.rossby_url),
    ] {
        executors.insert(
            backend,
            Arc::new(OnPremExecutor::new(
                backend,
                url.clone(),
                pool_manager.clone(),
                batch_rows,
            )),
        );
    }
    executors.insert(
        Backend::Cluster,
        Arc::new(ClusterExecutor::new(
            config.cluster.base_url.clone(),
            config.cluster.api_token.clone(),
            config.cluster.page_size,
            batch_rows,
        )),
    );

    let delegator = Arc::new(ExecutionDelegator::new(executors));
    let admission = Arc::new(AdmissionController::new(
        delegator.clone(),
        config.router.max_rows,
        config.router.count_query_permits,
    ));
    let query_router = Arc::new(QueryRouter::new(topology, delegator, admission));

    let app: Router = api::routes::create_router_with_state(query_router);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use request_governor::{
    api::{create_router, AppState},
    config::{GovernorConfig, StoreBackend},
    memory::MemoryStore,
    metrics::Metrics,
    redis::RedisStore,
    service::GovernanceService,
    store::EphemeralStore,
    tasks::{spawn_health_monitor, spawn_invalidation_worker},
    utils::TimeSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "request_governor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting request governor");

    // Configuration problems are fatal: nothing is served with bad settings
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = GovernorConfig::load(config_path.as_deref())
        .context("failed to load configuration")?;

    let metrics = Arc::new(Metrics::new()?);

    // The store is fully connected before the listener exists, so no request
    // can observe a half-initialized handle
    let store = create_store(&config, metrics.clone()).await?;

    let service = Arc::new(GovernanceService::new(
        store,
        &config,
        Arc::new(TimeSource::new()),
        metrics.clone(),
    )?);

    let (invalidations, invalidation_worker) = spawn_invalidation_worker(
        service.cache().clone(),
        &config.invalidation,
        metrics.clone(),
    );
    let health_monitor =
        spawn_health_monitor(service.clone(), config.redis.health_check_interval());

    let state = AppState {
        service,
        invalidations,
    };

    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_addr))?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let app = create_router(state);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        warn!("HTTP server error: {}", e);
    }

    // The router (and with it the last queue handle) is gone, so the worker
    // drains its backlog and exits
    health_monitor.abort();
    if let Err(e) = invalidation_worker.await {
        warn!("Invalidation worker ended abnormally: {}", e);
    }

    info!("Service stopped");
    Ok(())
}

async fn create_store(config: &GovernorConfig, metrics: Arc<Metrics>) -> Result<Arc<dyn EphemeralStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(config.redis.clone())
                .await
                .with_context(|| format!("failed to connect to {}", config.redis.display_addr()))?
                .with_metrics(metrics.clone());
            metrics.set_store_up(true);
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-process memory store; state is not shared between instances");
            metrics.set_store_up(true);
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

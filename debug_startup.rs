// Step-by-step check of the store the governor is configured against
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use request_governor::{
    cache::Ttl,
    config::GovernorConfig,
    metrics::Metrics,
    redis::RedisStore,
    service::GovernanceService,
    store::EphemeralStore,
    utils::TimeSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting store diagnostics...");

    let start_time = Instant::now();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = GovernorConfig::load(config_path.as_deref())?;
    info!("Using Redis at {}", config.redis.display_addr());

    let store = connect(&config).await?;
    check_governance(store, &config).await?;

    info!("✅ All checks completed successfully in {:?}", start_time.elapsed());
    Ok(())
}

async fn connect(config: &GovernorConfig) -> Result<Arc<RedisStore>> {
    let connection_start = Instant::now();
    info!("🔍 Connecting with 10 second timeout...");

    let result =
        tokio::time::timeout(Duration::from_secs(10), RedisStore::connect(config.redis.clone())).await;

    let store = match result {
        Ok(Ok(store)) => {
            info!("✅ Store connected in {:?}", connection_start.elapsed());
            store
        }
        Ok(Err(e)) => {
            error!("❌ Store connection failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("❌ Store connection timed out after 10 seconds");
            error!("This suggests a network connectivity issue or Redis server is not responding");
            return Err(anyhow::anyhow!("Redis connection timeout"));
        }
    };

    let ping_start = Instant::now();
    match store.ping().await {
        Ok(()) => info!("✅ PING answered in {:?}", ping_start.elapsed()),
        Err(e) => {
            error!("❌ PING failed: {}", e);
            return Err(e.into());
        }
    }

    Ok(Arc::new(store))
}

async fn check_governance(store: Arc<RedisStore>, config: &GovernorConfig) -> Result<()> {
    let service = GovernanceService::new(
        store,
        config,
        Arc::new(TimeSource::new()),
        Arc::new(Metrics::new()?),
    )?;

    let cache_start = Instant::now();
    let key = "debug_startup:probe";
    let cache = service.cache();
    if !cache.set(key, &"probe", Some(Ttl::from_secs(10)?)).await {
        return Err(anyhow::anyhow!("cache write failed"));
    }
    let read: Option<String> = cache.get(key).await;
    cache.delete(key).await;
    if read.as_deref() != Some("probe") {
        return Err(anyhow::anyhow!("cache read returned {:?}", read));
    }
    info!("✅ Cache round trip in {:?}", cache_start.elapsed());

    let limiter_start = Instant::now();
    let decision = service.limiter().check("debug_startup").await?;
    info!(
        "✅ Limiter decision in {:?}: admitted={} remaining={}/{}",
        limiter_start.elapsed(),
        decision.admitted,
        decision.remaining,
        decision.limit
    );

    Ok(())
}

//! Background tasks: cache invalidation after writes and periodic store
//! health checks.

use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cache::CacheService,
    config::InvalidationSettings,
    metrics::Metrics,
    service::{GovernanceService, HealthStatus},
};

/// Handle for submitting pattern invalidations to the background worker
#[derive(Clone)]
pub struct InvalidationQueue {
    sender: mpsc::Sender<String>,
}

impl InvalidationQueue {
    /// Queue `pattern` for invalidation without waiting. Returns `false` if
    /// the queue is full or the worker has stopped.
    pub fn submit(&self, pattern: impl Into<String>) -> bool {
        match self.sender.try_send(pattern.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(pattern)) => {
                warn!("Invalidation queue full, dropping job for {}", pattern);
                false
            }
            Err(TrySendError::Closed(pattern)) => {
                warn!("Invalidation worker stopped, dropping job for {}", pattern);
                false
            }
        }
    }
}

/// Spawn the invalidation worker.
///
/// Each job is attempted up to `max_attempts` times with a linearly growing
/// delay. Pattern invalidation is idempotent, so repeating a partially
/// applied job is safe. The worker exits once every queue handle has been
/// dropped and the backlog is drained.
pub fn spawn_invalidation_worker(
    cache: CacheService,
    settings: &InvalidationSettings,
    metrics: Arc<Metrics>,
) -> (InvalidationQueue, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<String>(settings.queue_capacity.max(1));
    let max_attempts = settings.max_attempts.max(1);
    let retry_delay = settings.retry_delay();

    let handle = tokio::spawn(async move {
        info!(
            "Starting invalidation worker (max {} attempts, {:?} base delay)",
            max_attempts, retry_delay
        );

        while let Some(pattern) = receiver.recv().await {
            run_invalidation_job(&cache, &pattern, max_attempts, retry_delay, &metrics).await;
        }

        info!("Invalidation worker stopped");
    });

    (InvalidationQueue { sender }, handle)
}

async fn run_invalidation_job(
    cache: &CacheService,
    pattern: &str,
    max_attempts: u32,
    retry_delay: Duration,
    metrics: &Metrics,
) {
    for attempt in 1..=max_attempts {
        match cache.try_invalidate_pattern(pattern).await {
            Ok(deleted) => {
                debug!(
                    "Invalidated {} keys matching {} (attempt {})",
                    deleted, pattern, attempt
                );
                metrics.record_invalidation_job("completed");
                return;
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    "Invalidation of {} failed (attempt {}/{}): {}",
                    pattern, attempt, max_attempts, e
                );
                metrics.record_invalidation_job("retried");
                tokio::time::sleep(retry_delay * attempt).await;
            }
            Err(e) => {
                warn!(
                    "Giving up on invalidation of {} after {} attempts: {}",
                    pattern, max_attempts, e
                );
                metrics.record_invalidation_job("failed");
            }
        }
    }
}

/// Spawn a task that probes the store every `interval` and logs state
/// changes. The store-up gauge is updated on each probe.
pub fn spawn_health_monitor(service: Arc<GovernanceService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting store health monitor every {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        let mut last_status: Option<HealthStatus> = None;

        loop {
            ticker.tick().await;

            let report = service.health().await;
            if last_status != Some(report.status) {
                match report.status {
                    HealthStatus::Healthy => info!("Store is healthy"),
                    HealthStatus::Degraded => {
                        warn!("Store is degraded: {}", report.store.message)
                    }
                }
                last_status = Some(report.status);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CacheSettings, GovernorConfig},
        memory::MemoryStore,
        utils::TimeSource,
    };

    fn cache_over(store: Arc<MemoryStore>, metrics: Arc<Metrics>) -> CacheService {
        CacheService::new(store, &CacheSettings::default(), metrics).unwrap()
    }

    async fn wait_until_empty(store: &MemoryStore, keep: usize) {
        for _ in 0..100 {
            if store.len().await == keep {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("invalidation did not complete");
    }

    #[tokio::test]
    async fn test_worker_invalidates_submitted_patterns() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let cache = cache_over(store.clone(), metrics.clone());

        cache.set("posts:1", "a", None).await;
        cache.set("posts:2", "b", None).await;
        cache.set("users:1", "c", None).await;

        let (queue, handle) =
            spawn_invalidation_worker(cache, &InvalidationSettings::default(), metrics);
        assert!(queue.submit("posts:*"));

        wait_until_empty(&store, 1).await;

        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_retries_through_outage() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let cache = cache_over(store.clone(), metrics.clone());
        cache.set("posts:1", "a", None).await;

        store.set_available(false);
        let settings = InvalidationSettings {
            max_attempts: 10,
            retry_delay_ms: 20,
            ..Default::default()
        };
        let (queue, handle) = spawn_invalidation_worker(cache, &settings, metrics);
        assert!(queue.submit("posts:*"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_available(true);

        wait_until_empty(&store, 0).await;
        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_worker_stops_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let (queue, handle) = spawn_invalidation_worker(
            cache_over(store, metrics.clone()),
            &InvalidationSettings::default(),
            metrics,
        );

        handle.abort();
        let _ = handle.await;
        assert!(!queue.submit("posts:*"));
    }

    #[tokio::test]
    async fn test_health_monitor_updates_gauge() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut config = GovernorConfig::default();
        config.backend = crate::config::StoreBackend::Memory;
        let service = Arc::new(
            GovernanceService::new(store.clone(), &config, Arc::new(TimeSource::new()), metrics.clone())
                .unwrap(),
        );

        store.set_available(false);
        let handle = spawn_health_monitor(service, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let families = metrics.registry().gather();
        let gauge = families
            .iter()
            .find(|f| f.get_name() == "governor_store_up")
            .map(|f| f.get_metric()[0].get_gauge().get_value());
        assert_eq!(gauge, Some(0.0));
    }
}

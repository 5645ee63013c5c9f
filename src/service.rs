use http::HeaderMap;
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

use crate::{
    cache::CacheService,
    config::GovernorConfig,
    error::Result,
    identity::client_identity,
    limiter::{Decision, SlidingWindowLimiter},
    metrics::Metrics,
    store::EphemeralStore,
    utils::Clock,
};

/// What the governance layer decided for an inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Path is on the bypass list; the limiter was not consulted
    Bypassed,
    Decided(Decision),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        match self {
            Admission::Bypassed => true,
            Admission::Decided(decision) => decision.admitted,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Admission::Bypassed => None,
            Admission::Decided(decision) => Some(decision),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: ComponentHealth,
    pub timestamp: String,
}

/// One entry point per inbound request: admission first, then the cache for
/// whatever the handler needs. Both share the same store handle.
pub struct GovernanceService {
    limiter: SlidingWindowLimiter,
    cache: CacheService,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl GovernanceService {
    /// Create a new governance service over an already connected store
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        config: &GovernorConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = SlidingWindowLimiter::new(
            store.clone(),
            config.rate_limit.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let cache = CacheService::new(store.clone(), &config.cache, metrics.clone())?;

        Ok(Self {
            limiter,
            cache,
            store,
            clock,
            metrics,
        })
    }

    /// Decide on a request given its path, headers and peer address
    pub async fn admit(&self, path: &str, headers: &HeaderMap, peer: Option<SocketAddr>) -> Admission {
        if self.limiter.settings().is_bypassed(path) {
            debug!("Bypassing rate limit for {}", path);
            self.metrics.record_decision("bypassed");
            return Admission::Bypassed;
        }

        let identity = client_identity(headers, peer);
        Admission::Decided(self.limiter.allow(&identity).await)
    }

    /// Decide on a request from an already derived identity
    pub async fn admit_identity(&self, identity: &str) -> Decision {
        self.limiter.allow(identity).await
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Probe the store. An unreachable store makes the service degraded,
    /// not unhealthy: admission and caching keep working in fail-open mode.
    pub async fn health(&self) -> HealthReport {
        let store = match self.store.ping().await {
            Ok(()) => ComponentHealth {
                status: "healthy",
                message: "Connected".to_string(),
            },
            Err(e) => {
                warn!("Store health check failed: {}", e);
                ComponentHealth {
                    status: "unhealthy",
                    message: format!("Connection failed: {}", e),
                }
            }
        };

        let status = if store.status == "healthy" {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        self.metrics.set_store_up(status == HealthStatus::Healthy);

        HealthReport {
            status,
            store,
            timestamp: self.clock.utc_now().to_rfc3339(),
        }
    }
}

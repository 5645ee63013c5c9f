use async_trait::async_trait;
use redis::{aio::ConnectionManager, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisResult};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::{Duration, Instant}};
use tracing::{debug, info, warn};

use crate::{
    error::{GovernorError, Result},
    metrics::Metrics,
    store::{BatchOp, BatchReply, EphemeralStore, KeyTtl},
};

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connection_timeout_secs: u64,
    pub command_timeout_ms: u64,
    pub health_check_interval_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            connection_timeout_secs: 5,
            command_timeout_ms: 1000,
            health_check_interval_secs: 30,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Connection address for logs, without credentials
    pub fn display_addr(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
            },
        }
    }
}

/// Redis-backed store shared by the limiter and the cache
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisConfig,
    metrics: Option<Arc<Metrics>>,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with PING.
    ///
    /// The store is only returned once fully usable, so callers never see a
    /// half-initialized handle.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for {}", config.display_addr());

        let client = redis::Client::open(config.connection_info()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GovernorError::Redis(e)
        })?;

        info!("Redis client created, establishing connection manager...");

        let connection_result =
            tokio::time::timeout(config.connection_timeout(), client.get_connection_manager()).await;

        let connection = match connection_result {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(GovernorError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}s)",
                    config.connection_timeout_secs
                );
                return Err(GovernorError::Timeout {
                    operation: "CONNECT",
                });
            }
        };

        let store = Self {
            connection,
            config,
            metrics: None,
        };

        info!("Testing Redis connection with PING...");
        store.ping().await.map_err(|e| {
            warn!("Redis PING failed: {}", e);
            e
        })?;

        info!("Redis store initialized successfully");
        Ok(store)
    }

    /// Record per-command latency into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one command under the command timeout
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.command_timeout(), fut).await;

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GovernorError::Redis(e)),
            Err(_) => Err(GovernorError::Timeout { operation }),
        };

        if let Some(metrics) = &self.metrics {
            let label = if result.is_ok() { "success" } else { "error" };
            metrics.record_store_operation(operation, label);
            metrics.record_store_operation_duration(operation, started.elapsed().as_secs_f64());
        }

        result
    }
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.bounded("GET", cmd.query_async::<_, Option<Vec<u8>>>(&mut conn))
            .await
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_seconds);
        self.bounded("SET", cmd.query_async::<_, ()>(&mut conn)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.bounded("DEL", cmd.query_async::<_, u64>(&mut conn)).await
    }

    async fn scan_matching(
        &self,
        pattern: &str,
        cursor: u64,
        batch_size: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(batch_size);
        self.bounded("SCAN", cmd.query_async::<_, (u64, Vec<String>)>(&mut conn))
            .await
    }

    async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);
        let reply = self.bounded("TTL", cmd.query_async::<_, i64>(&mut conn)).await?;
        Ok(KeyTtl::from_reply(reply))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.bounded("EXISTS", cmd.query_async::<_, bool>(&mut conn)).await
    }

    async fn execute_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchReply>> {
        if ops.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.connection.clone();
        // MULTI/EXEC: the server runs the whole sequence without
        // interleaving commands from other clients.
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                BatchOp::PruneScores { key, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(0).arg(*max);
                }
                BatchOp::Cardinality { key } => {
                    pipe.cmd("ZCARD").arg(key);
                }
                BatchOp::AddScored { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                BatchOp::Expire { key, seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds);
                }
            }
        }

        let values: Vec<redis::Value> = self
            .bounded("MULTI", pipe.query_async(&mut conn))
            .await?;

        if values.len() != ops.len() {
            return Err(GovernorError::UnexpectedReply(format!(
                "atomic batch returned {} replies for {} operations",
                values.len(),
                ops.len()
            )));
        }

        ops.iter()
            .zip(values)
            .map(|(op, value)| match (op, value) {
                (BatchOp::Expire { .. }, redis::Value::Int(v)) => Ok(BatchReply::Bool(v == 1)),
                (_, redis::Value::Int(v)) => Ok(BatchReply::Int(v)),
                (op, other) => Err(GovernorError::UnexpectedReply(format!(
                    "{} returned {:?}",
                    op.name(),
                    other
                ))),
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let result = self
            .bounded("PING", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await;
        if let Err(e) = &result {
            debug!("Redis PING failed: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.display_addr(), "redis://localhost:6379/0");
        assert_eq!(config.command_timeout(), Duration::from_secs(1));
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_connection_info_carries_credentials() {
        let config = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            db: 2,
            password: Some("s3cret".to_string()),
            ..Default::default()
        };

        let info = config.connection_info();
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
        assert!(matches!(info.addr, ConnectionAddr::Tcp(ref host, 6380) if host == "cache.internal"));
        // Credentials never leak into the display form
        assert!(!config.display_addr().contains("s3cret"));
    }

    #[tokio::test]
    async fn test_connect_fails_fast_when_unreachable() {
        let config = RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout_secs: 1,
            ..Default::default()
        };

        let result = RedisStore::connect(config).await;
        assert!(result.is_err());
        assert!(result.err().map(|e| e.is_store_failure()).unwrap_or(false));
    }
}

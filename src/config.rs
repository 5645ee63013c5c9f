use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    cache::Ttl,
    error::{GovernorError, Result},
    redis::RedisConfig,
};

/// Prefix of environment variables that override configuration,
/// e.g. `GOVERNOR__RATE_LIMIT__REQUESTS_PER_WINDOW=100`
pub const ENV_PREFIX: &str = "GOVERNOR";

/// Longest accepted rate limit window, one year
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Complete configuration of the governance layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub server: ServerSettings,
    pub backend: StoreBackend,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub invalidation: InvalidationSettings,
}

/// Which store implementation backs the limiter and the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

/// Sliding-window admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests admitted per identity within one window
    pub requests_per_window: u32,
    pub window_secs: u64,
    /// Window records live at `<key_prefix>:<identity>`
    pub key_prefix: String,
    /// Paths that skip admission entirely. An entry ending in `*` matches
    /// by prefix, anything else must match exactly.
    pub bypass_paths: Vec<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_secs: 60,
            key_prefix: "rate_limit".to_string(),
            bypass_paths: vec![
                "/health".to_string(),
                "/health/*".to_string(),
                "/metrics".to_string(),
            ],
        }
    }
}

impl RateLimitSettings {
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == entry,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL applied when a write does not name one
    pub default_ttl_secs: u64,
    /// Keys visited per SCAN step during pattern invalidation
    pub scan_batch_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            scan_batch_size: 100,
        }
    }
}

/// Background invalidation worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationSettings {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl InvalidationSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl GovernorConfig {
    /// Layer defaults, an optional YAML file and `GOVERNOR__*` environment
    /// variables, then validate the result.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&str>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&GovernorConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("rate_limit.bypass_paths")
                .try_parsing(true),
        );

        let config: GovernorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if rl.requests_per_window == 0 {
            return Err(invalid("rate_limit.requests_per_window", "must be at least 1"));
        }
        if rl.window_secs == 0 {
            return Err(invalid("rate_limit.window_secs", "must be at least 1"));
        }
        if rl.window_secs > MAX_WINDOW_SECS {
            return Err(invalid("rate_limit.window_secs", "must be at most one year"));
        }
        if rl.key_prefix.is_empty() {
            return Err(invalid("rate_limit.key_prefix", "must not be empty"));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(invalid("cache.default_ttl_secs", "must be at least 1"));
        }
        if self.cache.default_ttl_secs > Ttl::MAX_SECS {
            return Err(invalid("cache.default_ttl_secs", "must be at most ten years"));
        }
        if self.cache.scan_batch_size == 0 {
            return Err(invalid("cache.scan_batch_size", "must be at least 1"));
        }
        if self.invalidation.queue_capacity == 0 {
            return Err(invalid("invalidation.queue_capacity", "must be at least 1"));
        }
        if self.invalidation.max_attempts == 0 {
            return Err(invalid("invalidation.max_attempts", "must be at least 1"));
        }
        if self.backend == StoreBackend::Redis {
            if self.redis.host.is_empty() {
                return Err(invalid("redis.host", "must not be empty"));
            }
            if self.redis.connection_timeout_secs == 0 || self.redis.command_timeout_ms == 0 {
                return Err(invalid("redis timeouts", "must be non-zero"));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> GovernorError {
    GovernorError::Config(format!("{} {}", key, reason))
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<GovernorConfig> {
    let config: GovernorConfig = serde_yaml::from_str(yaml)
        .map_err(|e| GovernorError::Config(format!("Failed to parse YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<GovernorConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

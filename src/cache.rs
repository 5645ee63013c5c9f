//! Response cache over the shared store.
//!
//! Every operation degrades to "the cache is empty" when the store fails:
//! reads miss, writes report `false`, invalidation reports what it managed
//! to delete. Failures are logged and counted, never returned.

use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::CacheSettings,
    error::{GovernorError, Result},
    metrics::Metrics,
    store::{EphemeralStore, KeyTtl},
};

/// Time-to-live of a cache entry, between one second and `Ttl::MAX_SECS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ttl(u64);

impl Ttl {
    /// Ten years
    pub const MAX_SECS: u64 = 10 * 365 * 24 * 60 * 60;

    pub fn from_secs(secs: u64) -> Result<Self> {
        if secs == 0 {
            return Err(GovernorError::Validation(
                "cache TTL must be at least one second".to_string(),
            ));
        }
        if secs > Self::MAX_SECS {
            return Err(GovernorError::Validation(format!(
                "cache TTL must be at most {} seconds, got {}",
                Self::MAX_SECS,
                secs
            )));
        }
        Ok(Self(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

impl TryFrom<i64> for Ttl {
    type Error = GovernorError;

    fn try_from(secs: i64) -> Result<Self> {
        if secs <= 0 {
            return Err(GovernorError::Validation(format!(
                "cache TTL must be positive, got {}",
                secs
            )));
        }
        Self::from_secs(secs as u64)
    }
}

impl TryFrom<Duration> for Ttl {
    type Error = GovernorError;

    fn try_from(duration: Duration) -> Result<Self> {
        Self::from_secs(duration.as_secs())
    }
}

/// Build a namespaced cache key, e.g. `cache_key("users", 42)` -> `users:42`
pub fn cache_key(entity: &str, id: impl std::fmt::Display) -> String {
    format!("{}:{}", entity, id)
}

/// Pattern matching every key of an entity, e.g. `users:*`
pub fn entity_pattern(entity: &str) -> String {
    format!("{}:*", entity)
}

/// JSON cache with TTLs and fail-open error handling
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn EphemeralStore>,
    default_ttl: Ttl,
    scan_batch_size: usize,
    metrics: Arc<Metrics>,
}

impl CacheService {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        settings: &CacheSettings,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            default_ttl: Ttl::from_secs(settings.default_ttl_secs)?,
            scan_batch_size: settings.scan_batch_size.max(1),
            metrics,
        })
    }

    /// Cached value at `key`, or `None` on miss, decode failure or store error
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.metrics.record_cache_operation("get", "miss");
                return None;
            }
            Err(e) => {
                warn!("Cache get error for key {}: {}", key, e);
                self.metrics.record_cache_operation("get", "error");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.metrics.record_cache_operation("get", "hit");
                Some(value)
            }
            Err(e) => {
                warn!("Cache decode error for key {}: {}", key, e);
                self.metrics.record_cache_operation("get", "error");
                None
            }
        }
    }

    /// Store `value` at `key` for `ttl` (or the default TTL). Overwrites
    /// unconditionally. Returns `false` if encoding or the store fails.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Ttl>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);

        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Cache encode error for key {}: {}", key, e);
                self.metrics.record_cache_operation("set", "error");
                return false;
            }
        };

        match self.store.set_with_expiry(key, &encoded, ttl.as_secs()).await {
            Ok(()) => {
                self.metrics.record_cache_operation("set", "ok");
                true
            }
            Err(e) => {
                warn!("Cache set error for key {}: {}", key, e);
                self.metrics.record_cache_operation("set", "error");
                false
            }
        }
    }

    /// Remove `key`. Deleting an absent key still succeeds.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&[key.to_string()]).await {
            Ok(_) => {
                self.metrics.record_cache_operation("delete", "ok");
                true
            }
            Err(e) => {
                warn!("Cache delete error for key {}: {}", key, e);
                self.metrics.record_cache_operation("delete", "error");
                false
            }
        }
    }

    /// Delete every key matching the glob `pattern`, returning how many were
    /// removed. A store failure mid-scan stops the sweep and returns the
    /// count so far; nothing is rolled back.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let mut deleted = 0;
        match self.sweep(pattern, &mut deleted).await {
            Ok(()) => {
                debug!("Invalidated {} keys matching {}", deleted, pattern);
                self.metrics.record_cache_operation("invalidate", "ok");
            }
            Err(e) => {
                warn!(
                    "Cache invalidate pattern error for {} after {} deletions: {}",
                    pattern, deleted, e
                );
                self.metrics.record_cache_operation("invalidate", "error");
            }
        }
        deleted
    }

    /// Like `invalidate_pattern`, but reports whether the sweep completed.
    /// Used by the invalidation worker to decide on retries.
    pub async fn try_invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let mut deleted = 0;
        self.sweep(pattern, &mut deleted).await?;
        Ok(deleted)
    }

    async fn sweep(&self, pattern: &str, deleted: &mut u64) -> Result<()> {
        let mut cursor = 0;
        loop {
            let (next, keys) = self
                .store
                .scan_matching(pattern, cursor, self.scan_batch_size)
                .await?;
            if !keys.is_empty() {
                *deleted += self.store.delete(&keys).await?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    /// Whether `key` is present; `false` on store error
    pub async fn exists(&self, key: &str) -> bool {
        self.store.exists(key).await.unwrap_or_else(|e| {
            warn!("Cache exists error for key {}: {}", key, e);
            false
        })
    }

    /// Remaining TTL in seconds, `-1` for a key without expiry, `None` when
    /// the key is absent or the store fails
    pub async fn ttl_remaining(&self, key: &str) -> Option<i64> {
        match self.store.ttl_remaining(key).await {
            Ok(KeyTtl::Expires(secs)) => Some(secs as i64),
            Ok(KeyTtl::Persistent) => Some(-1),
            Ok(KeyTtl::Missing) => None,
            Err(e) => {
                warn!("Cache ttl error for key {}: {}", key, e);
                None
            }
        }
    }

    /// Read-through: return the cached value, or run `loader`, cache its
    /// result and return it. A failed fill is ignored; loader errors are
    /// returned unchanged.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Ttl>,
        loader: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let value = loader().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryStore, utils::ManualClock};
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: u32,
        title: String,
        tags: Vec<String>,
    }

    fn sample_post() -> Post {
        Post {
            id: 1,
            title: "hello".to_string(),
            tags: vec!["rust".to_string()],
        }
    }

    fn cache_over(store: Arc<MemoryStore>) -> CacheService {
        CacheService::new(store, &CacheSettings::default(), Arc::new(Metrics::new().unwrap())).unwrap()
    }

    fn clocked() -> (CacheService, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (cache_over(store.clone()), store, clock)
    }

    #[test]
    fn test_ttl_validation() {
        assert!(Ttl::from_secs(0).is_err());
        assert!(Ttl::try_from(-5i64).is_err());
        assert!(Ttl::try_from(0i64).is_err());
        assert_eq!(Ttl::try_from(30i64).unwrap().as_secs(), 30);
        assert!(Ttl::try_from(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_ttl_upper_bound() {
        assert!(Ttl::from_secs(Ttl::MAX_SECS).is_ok());
        assert!(Ttl::from_secs(Ttl::MAX_SECS + 1).is_err());
        assert!(Ttl::from_secs(u64::MAX).is_err());
        assert!(matches!(
            Ttl::try_from(i64::MAX),
            Err(GovernorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_longest_ttl_is_stored_and_live() {
        let (cache, _, clock) = clocked();
        assert!(cache.set("k", &1u8, Some(Ttl::from_secs(Ttl::MAX_SECS).unwrap())).await);
        clock.advance_secs(365 * 24 * 60 * 60);
        assert_eq!(cache.get::<u8>("k").await, Some(1));
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(cache_key("users", 42), "users:42");
        assert_eq!(entity_pattern("posts"), "posts:*");
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (cache, _, _) = clocked();
        let post = sample_post();

        assert!(cache.set("posts:1", &post, Ttl::from_secs(60).ok()).await);
        assert_eq!(cache.get::<Post>("posts:1").await, Some(post));

        let list = vec![1, 2, 3];
        assert!(cache.set("posts:list", &list, None).await);
        assert_eq!(cache.get::<Vec<i32>>("posts:list").await, Some(list));

        assert!(cache.set("counter", &7u64, None).await);
        assert_eq!(cache.get::<u64>("counter").await, Some(7));
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let (cache, _, _) = clocked();
        cache.set("users:1", "alice", None).await;
        assert_eq!(cache.ttl_remaining("users:1").await, Some(3600));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let (cache, _, clock) = clocked();
        cache.set("users:1", "alice", Ttl::from_secs(5).ok()).await;
        clock.advance_secs(5);
        assert_eq!(cache.get::<String>("users:1").await, None);
        assert!(!cache.exists("users:1").await);
        assert_eq!(cache.ttl_remaining("users:1").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let (cache, _, _) = clocked();
        cache.set("k", "first", None).await;
        cache.set("k", "second", None).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (cache, _, _) = clocked();
        cache.set("users:1", "alice", None).await;

        assert!(cache.delete("users:1").await);
        assert!(cache.delete("users:1").await);
        assert!(!cache.exists("users:1").await);
        assert_eq!(cache.get::<String>("users:1").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_removes_only_matches() {
        let (cache, _, _) = clocked();
        cache.set("posts:1", "a", None).await;
        cache.set("posts:2", "b", None).await;
        cache.set("users:1", "c", None).await;

        assert_eq!(cache.invalidate_pattern("posts:*").await, 2);
        assert!(!cache.exists("posts:1").await);
        assert!(!cache.exists("posts:2").await);
        assert!(cache.exists("users:1").await);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_spans_many_scan_batches() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let settings = CacheSettings {
            scan_batch_size: 7,
            ..Default::default()
        };
        let cache = CacheService::new(store.clone(), &settings, Arc::new(Metrics::new().unwrap())).unwrap();

        for i in 0..50 {
            cache.set(&cache_key("posts", i), &i, None).await;
        }
        cache.set("users:1", &1, None).await;

        assert_eq!(cache.invalidate_pattern(&entity_pattern("posts")).await, 50);
        assert_eq!(store.len().await, 1);
    }

    /// Memory store whose deletes start failing after a fixed number of calls
    struct FailingDeletes {
        inner: MemoryStore,
        deletes_left: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EphemeralStore for FailingDeletes {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()> {
            self.inner.set_with_expiry(key, value, ttl_seconds).await
        }

        async fn delete(&self, keys: &[String]) -> Result<u64> {
            use std::sync::atomic::Ordering;
            let allowed = self
                .deletes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(GovernorError::StoreUnavailable("connection reset".to_string()));
            }
            self.inner.delete(keys).await
        }

        async fn scan_matching(
            &self,
            pattern: &str,
            cursor: u64,
            batch_size: usize,
        ) -> Result<(u64, Vec<String>)> {
            self.inner.scan_matching(pattern, cursor, batch_size).await
        }

        async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl> {
            self.inner.ttl_remaining(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn execute_atomic(
            &self,
            ops: Vec<crate::store::BatchOp>,
        ) -> Result<Vec<crate::store::BatchReply>> {
            self.inner.execute_atomic(ops).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_invalidation_failing_mid_sweep_returns_partial_count() {
        let store = Arc::new(FailingDeletes {
            inner: MemoryStore::new(),
            deletes_left: std::sync::atomic::AtomicUsize::new(2),
        });
        let settings = CacheSettings {
            scan_batch_size: 10,
            ..Default::default()
        };
        let cache = CacheService::new(store.clone(), &settings, Arc::new(Metrics::new().unwrap())).unwrap();

        for i in 0..30 {
            cache.set(&format!("posts:{:02}", i), &i, None).await;
        }

        // Two batches of ten go through, the third delete fails
        assert_eq!(cache.invalidate_pattern("posts:*").await, 20);
        assert_eq!(store.inner.len().await, 10);
        assert_eq!(cache.get::<i32>("posts:29").await, Some(29));
        assert_eq!(cache.get::<i32>("posts:00").await, None);

        assert!(cache.try_invalidate_pattern("posts:*").await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_pattern_with_default_batch_size() {
        let (cache, store, _) = clocked();
        for i in 0..150 {
            cache.set(&cache_key("posts", i), &i, None).await;
        }

        assert_eq!(cache.invalidate_pattern("posts:*").await, 150);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_decode_failure_is_a_miss() {
        let (cache, store, _) = clocked();
        store.set_with_expiry("broken", b"{not json", 60).await.unwrap();
        assert_eq!(cache.get::<BTreeMap<String, String>>("broken").await, None);

        cache.set("text", "plain", None).await;
        assert_eq!(cache.get::<Post>("text").await, None);
    }

    #[tokio::test]
    async fn test_encode_failure_returns_false() {
        let (cache, _, _) = clocked();
        // JSON object keys must be strings
        let mut bad: BTreeMap<Vec<u8>, u8> = BTreeMap::new();
        bad.insert(vec![1], 1);
        assert!(!cache.set("bad", &bad, None).await);
        assert!(!cache.exists("bad").await);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_empty_cache() {
        let (cache, store, _) = clocked();
        cache.set("posts:1", "a", None).await;
        store.set_available(false);

        assert_eq!(cache.get::<String>("posts:1").await, None);
        assert!(!cache.set("posts:2", "b", None).await);
        assert!(!cache.delete("posts:1").await);
        assert_eq!(cache.invalidate_pattern("posts:*").await, 0);
        assert!(!cache.exists("posts:1").await);
        assert_eq!(cache.ttl_remaining("posts:1").await, None);
        assert!(cache.try_invalidate_pattern("posts:*").await.is_err());

        store.set_available(true);
        assert_eq!(cache.get::<String>("posts:1").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_read_through_loads_once() {
        let (cache, _, _) = clocked();
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = AtomicUsize::new(0);
        let counter = &calls;

        for _ in 0..3 {
            let post: std::result::Result<Post, String> = cache
                .get_or_load("posts:1", None, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_post())
                })
                .await;
            assert_eq!(post.unwrap(), sample_post());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_through_propagates_loader_error() {
        let (cache, _, _) = clocked();
        let result: std::result::Result<Post, &str> =
            cache.get_or_load("posts:9", None, || async { Err("not found") }).await;
        assert_eq!(result, Err("not found"));
        assert!(!cache.exists("posts:9").await);
    }

    #[tokio::test]
    async fn test_read_through_survives_outage() {
        let (cache, store, _) = clocked();
        store.set_available(false);
        let result: std::result::Result<u32, ()> = cache.get_or_load("n", None, || async { Ok(5) }).await;
        assert_eq!(result, Ok(5));
    }

    #[tokio::test]
    async fn test_metrics_track_hits_and_misses() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(MemoryStore::new());
        let cache = CacheService::new(store, &CacheSettings::default(), metrics.clone()).unwrap();

        cache.get::<u8>("absent").await;
        cache.set("present", &1u8, None).await;
        cache.get::<u8>("present").await;

        assert_eq!(metrics.cache_operation_count("get", "miss"), 1);
        assert_eq!(metrics.cache_operation_count("get", "hit"), 1);
    }
}

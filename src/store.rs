//! Capability contract for the ephemeral key/value store shared by the
//! limiter and the cache.

use async_trait::async_trait;

use crate::error::{GovernorError, Result};

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key expires in this many seconds
    Expires(u64),
    /// Key exists without an expiry
    Persistent,
    /// Key does not exist
    Missing,
}

impl KeyTtl {
    /// Decode the integer reply of the `TTL` command
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            secs => KeyTtl::Expires(secs.max(0) as u64),
        }
    }
}

/// One step of an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Remove sorted-set members whose score lies in `[0, max]`
    PruneScores { key: String, max: i64 },
    /// Number of members in a sorted set
    Cardinality { key: String },
    /// Add (or re-score) a sorted-set member
    AddScored { key: String, score: i64, member: String },
    /// Set the key's expiry in seconds
    Expire { key: String, seconds: u64 },
}

impl BatchOp {
    pub fn name(&self) -> &'static str {
        match self {
            BatchOp::PruneScores { .. } => "ZREMRANGEBYSCORE",
            BatchOp::Cardinality { .. } => "ZCARD",
            BatchOp::AddScored { .. } => "ZADD",
            BatchOp::Expire { .. } => "EXPIRE",
        }
    }
}

/// Result of one batch step, in the same position as its `BatchOp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReply {
    Int(i64),
    Bool(bool),
}

impl BatchReply {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            BatchReply::Int(v) => Ok(*v),
            BatchReply::Bool(_) => Err(GovernorError::UnexpectedReply(
                "expected integer batch reply, got boolean".to_string(),
            )),
        }
    }
}

/// Async operations the governance layer needs from its backing store.
///
/// Every call may suspend on network I/O and may fail with a store error.
/// Implementations must be safe to share between many concurrent tasks.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Raw bytes stored at `key`, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`, expiring after `ttl_seconds`
    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// One step of a resumable scan. Cursor 0 starts a scan; a returned
    /// cursor of 0 means the scan is complete.
    async fn scan_matching(
        &self,
        pattern: &str,
        cursor: u64,
        batch_size: usize,
    ) -> Result<(u64, Vec<String>)>;

    /// Remaining lifetime of `key`
    async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Execute `ops` as one indivisible unit, returning every reply in order
    async fn execute_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchReply>>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;
}

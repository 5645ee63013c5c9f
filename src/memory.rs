//! In-process implementation of the store contract.
//!
//! Mirrors the Redis semantics the governance layer relies on: expiring
//! keys, sorted sets, glob scans and indivisible batches. Used for local
//! development and for tests, including simulated outages.

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;

use crate::{
    error::{GovernorError, Result},
    store::{BatchOp, BatchReply, EphemeralStore, KeyTtl},
    utils::{Clock, KeyPattern, TimeSource},
};

/// Scans left unfinished are forgotten oldest first beyond this many
const MAX_OPEN_SCANS: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    /// member -> score
    SortedSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Expiry deadline in epoch milliseconds
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|deadline| now_ms >= deadline)
    }
}

/// Store held entirely in process memory
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    // Open scans: cursor -> last key visited. Resuming after a key rather
    // than at a position keeps deletions between steps from skipping keys.
    scans: Mutex<BTreeMap<u64, String>>,
    next_scan: AtomicU64,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TimeSource::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            scans: Mutex::new(BTreeMap::new()),
            next_scan: AtomicU64::new(1),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While unavailable every call fails with
    /// `GovernorError::StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sorted-set members stored at `key`, ordered by score
    pub async fn sorted_set_scores(&self, key: &str) -> Vec<i64> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(key).filter(|e| !e.is_expired(now)) else {
            return vec![];
        };
        match &entry.value {
            Value::SortedSet(members) => {
                let mut scores: Vec<i64> = members.values().copied().collect();
                scores.sort_unstable();
                scores
            }
            Value::Bytes(_) => vec![],
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GovernorError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    /// Drop `key` if it has expired, so callers only see live entries
    fn purge_expired(entries: &mut BTreeMap<String, Entry>, key: &str, now_ms: i64) {
        if entries.get(key).is_some_and(|e| e.is_expired(now_ms)) {
            entries.remove(key);
        }
    }

    /// Deadline `seconds` after `now_ms`, saturating instead of overflowing
    fn deadline(now_ms: i64, seconds: u64) -> i64 {
        i64::try_from(seconds)
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .and_then(|millis| now_ms.checked_add(millis))
            .unwrap_or(i64::MAX)
    }

    fn wrong_type(key: &str) -> GovernorError {
        GovernorError::UnexpectedReply(format!(
            "WRONGTYPE operation against key {} holding the wrong kind of value",
            key
        ))
    }

    fn apply(
        entries: &mut BTreeMap<String, Entry>,
        op: &BatchOp,
        now_ms: i64,
    ) -> Result<BatchReply> {
        match op {
            BatchOp::PruneScores { key, max } => {
                Self::purge_expired(entries, key, now_ms);
                let Some(entry) = entries.get_mut(key) else {
                    return Ok(BatchReply::Int(0));
                };
                let Value::SortedSet(members) = &mut entry.value else {
                    return Err(Self::wrong_type(key));
                };
                let before = members.len();
                members.retain(|_, score| !(0..=*max).contains(score));
                let removed = (before - members.len()) as i64;
                if members.is_empty() {
                    entries.remove(key);
                }
                Ok(BatchReply::Int(removed))
            }
            BatchOp::Cardinality { key } => {
                Self::purge_expired(entries, key, now_ms);
                match entries.get(key) {
                    None => Ok(BatchReply::Int(0)),
                    Some(Entry {
                        value: Value::SortedSet(members),
                        ..
                    }) => Ok(BatchReply::Int(members.len() as i64)),
                    Some(_) => Err(Self::wrong_type(key)),
                }
            }
            BatchOp::AddScored { key, score, member } => {
                Self::purge_expired(entries, key, now_ms);
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::SortedSet(HashMap::new()),
                    expires_at: None,
                });
                let Value::SortedSet(members) = &mut entry.value else {
                    return Err(Self::wrong_type(key));
                };
                let added = members.insert(member.clone(), *score).is_none();
                Ok(BatchReply::Int(i64::from(added)))
            }
            BatchOp::Expire { key, seconds } => {
                Self::purge_expired(entries, key, now_ms);
                match entries.get_mut(key) {
                    Some(entry) => {
                        entry.expires_at = Some(Self::deadline(now_ms, *seconds));
                        Ok(BatchReply::Bool(true))
                    }
                    None => Ok(BatchReply::Bool(false)),
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key, now);
        match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(Self::deadline(now, ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn scan_matching(
        &self,
        pattern: &str,
        cursor: u64,
        batch_size: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.check_available()?;
        let matcher = KeyPattern::new(pattern)?;
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        let mut scans = self.scans.lock().await;

        let resume_after = match cursor {
            0 => None,
            cursor => Some(scans.remove(&cursor).ok_or_else(|| {
                GovernorError::Validation(format!("invalid scan cursor {}", cursor))
            })?),
        };
        let lower = match &resume_after {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };

        // Like SCAN, COUNT bounds the keys visited, not the keys returned
        let batch = batch_size.max(1);
        let visited: Vec<(&String, &Entry)> = entries
            .range::<String, _>((lower, Bound::Unbounded))
            .take(batch)
            .collect();

        let keys = visited
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && matcher.matches(key))
            .map(|(key, _)| (*key).clone())
            .collect();

        let next_cursor = match visited.last() {
            Some((last, _))
                if entries
                    .range::<String, _>((Bound::Excluded(*last), Bound::Unbounded))
                    .next()
                    .is_some() =>
            {
                if scans.len() >= MAX_OPEN_SCANS {
                    scans.pop_first();
                }
                let id = self.next_scan.fetch_add(1, Ordering::SeqCst);
                scans.insert(id, (*last).clone());
                id
            }
            _ => 0,
        };
        Ok((next_cursor, keys))
    }

    async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key, now);
        Ok(match entries.get(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            // Round up like the server does for partially elapsed seconds
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => KeyTtl::Expires(((deadline - now) as u64).div_ceil(1000)),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn execute_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchReply>> {
        self.check_available()?;
        let now = self.clock.now_millis();
        // One guard for the whole batch keeps it indivisible
        let mut entries = self.entries.lock().await;
        ops.iter()
            .map(|op| Self::apply(&mut entries, op, now))
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

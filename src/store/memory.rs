//! In-process counter store
//!
//! A process-local [`CounterStore`] backed by a concurrent map. Used by the
//! test suite and suitable for single-replica deployments where counters do
//! not need to be shared. The store can optionally report itself as
//! clustered, in which case keys hash to real shard slots; this exercises the
//! dispatcher's slot grouping without a live cluster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{slot, CounterOp, CounterStore, OpReply, Pipeline, StoreResult};

/// A stored counter with its expiry deadline
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// Operation counters for observing store traffic in tests
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStoreStats {
    /// Pipelines executed
    pub pipelines: u64,
    /// Increment operations applied
    pub increments: u64,
    /// Read operations served
    pub gets: u64,
}

/// Process-local counter store
pub struct MemoryStore {
    entries: DashMap<String, CounterEntry>,
    clustered: bool,
    pipelines: AtomicU64,
    increments: AtomicU64,
    gets: AtomicU64,
}

impl MemoryStore {
    /// Create a store where every key maps to slot 0
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            clustered: false,
            pipelines: AtomicU64::new(0),
            increments: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Create a store that assigns keys to real shard slots
    pub fn clustered() -> Self {
        Self {
            clustered: true,
            ..Self::new()
        }
    }

    /// Current value of a counter, ignoring expired entries
    pub fn value_of(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    /// Remaining TTL of a counter
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Traffic counters accumulated so far
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            pipelines: self.pipelines.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
        }
    }

    fn apply(&self, op: &CounterOp, now: Instant) -> OpReply {
        match op {
            CounterOp::IncrBy { key, delta } => {
                self.increments.fetch_add(1, Ordering::Relaxed);
                let mut entry = self.entries.entry(key.clone()).or_insert(CounterEntry {
                    value: 0,
                    expires_at: None,
                });
                if entry.is_expired(now) {
                    entry.value = 0;
                    entry.expires_at = None;
                }
                entry.value += *delta as i64;
                OpReply::Value(entry.value)
            }
            CounterOp::Expire { key, seconds } => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if !entry.is_expired(now) {
                        entry.expires_at = Some(now + Duration::from_secs(*seconds));
                    }
                }
                OpReply::Done
            }
            CounterOp::Get { key } => {
                self.gets.fetch_add(1, Ordering::Relaxed);
                match self.entries.get(key) {
                    Some(entry) if !entry.is_expired(now) => OpReply::Value(entry.value),
                    _ => OpReply::Missing,
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
impl CounterStore for MemoryStore {
    fn is_clustered(&self) -> bool {
        self.clustered
    }

    fn slot_of(&self, key: &str) -> u16 {
        if self.clustered {
            slot::key_slot(key)
        } else {
            0
        }
    }

    async fn execute_pipeline(&self, pipeline: &Pipeline) -> StoreResult<Vec<OpReply>> {
        self.pipelines.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(pipeline.ops.iter().map(|op| self.apply(op, now)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_and_get() {
        let store = MemoryStore::new();
        let mut pipeline = Pipeline::new();
        pipeline.push(CounterOp::IncrBy {
            key: "k".to_string(),
            delta: 3,
        });
        pipeline.push(CounterOp::IncrBy {
            key: "k".to_string(),
            delta: 2,
        });
        pipeline.push(CounterOp::Get {
            key: "k".to_string(),
        });

        let replies = store.execute_pipeline(&pipeline).await.unwrap();
        assert_eq!(
            replies,
            vec![OpReply::Value(3), OpReply::Value(5), OpReply::Value(5)]
        );
        assert_eq!(store.value_of("k"), Some(5));
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        let mut pipeline = Pipeline::new();
        pipeline.push(CounterOp::Get {
            key: "absent".to_string(),
        });

        let replies = store.execute_pipeline(&pipeline).await.unwrap();
        assert_eq!(replies, vec![OpReply::Missing]);
    }

    #[tokio::test]
    async fn test_expire_sets_ttl() {
        let store = MemoryStore::new();
        let mut pipeline = Pipeline::new();
        pipeline.push(CounterOp::IncrBy {
            key: "k".to_string(),
            delta: 1,
        });
        pipeline.push(CounterOp::Expire {
            key: "k".to_string(),
            seconds: 60,
        });

        store.execute_pipeline(&pipeline).await.unwrap();
        let ttl = store.ttl_of("k").unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(58));
    }

    #[tokio::test]
    async fn test_expired_counter_restarts_from_zero() {
        let store = MemoryStore::new();
        store.entries.insert(
            "k".to_string(),
            CounterEntry {
                value: 40,
                expires_at: Some(Instant::now() - Duration::from_secs(1)),
            },
        );

        let mut pipeline = Pipeline::new();
        pipeline.push(CounterOp::IncrBy {
            key: "k".to_string(),
            delta: 2,
        });
        let replies = store.execute_pipeline(&pipeline).await.unwrap();
        assert_eq!(replies, vec![OpReply::Value(2)]);
    }

    #[test]
    fn test_slot_assignment() {
        let standalone = MemoryStore::new();
        assert!(!standalone.is_clustered());
        assert_eq!(standalone.slot_of("foo"), 0);
        assert_eq!(standalone.slot_of("bar"), 0);

        let clustered = MemoryStore::clustered();
        assert!(clustered.is_clustered());
        assert_eq!(clustered.slot_of("foo"), 12182);
    }

    #[tokio::test]
    async fn test_stats_track_traffic() {
        let store = MemoryStore::new();
        let mut pipeline = Pipeline::new();
        pipeline.push(CounterOp::IncrBy {
            key: "k".to_string(),
            delta: 1,
        });
        pipeline.push(CounterOp::Get {
            key: "k".to_string(),
        });
        store.execute_pipeline(&pipeline).await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.pipelines, 1);
        assert_eq!(stats.increments, 1);
        assert_eq!(stats.gets, 1);
    }
}

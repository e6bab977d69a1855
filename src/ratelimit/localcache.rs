//! Local over-limit cache
//!
//! A fixed-capacity in-process memo of counter keys already known to be over
//! limit, keyed to the wall-clock deadline at which their window rolls over.
//! A hit lets the engine answer OVER_LIMIT without touching the store; a
//! miss (including capacity eviction) merely forces a store round-trip.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Approximate memory cost of one entry: key bytes plus bookkeeping
const ENTRY_COST_BYTES: usize = 128;

/// Fixed-capacity memo of over-limit counter keys
pub struct OverLimitCache {
    entries: Mutex<LruCache<String, u64>>,
}

impl OverLimitCache {
    /// Build a cache from a byte budget; returns `None` when the budget is 0
    pub fn with_size_bytes(size_bytes: usize) -> Option<Self> {
        if size_bytes == 0 {
            return None;
        }
        let capacity = (size_bytes / ENTRY_COST_BYTES).max(16);
        Some(Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        })
    }

    /// Whether a non-expired over-limit entry exists for `key`
    pub fn is_over_limit(&self, key: &str, now_unix: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(&deadline) if deadline > now_unix => true,
            Some(_) => {
                entries.pop(key);
                false
            }
            None => false,
        }
    }

    /// Record that `key` is over limit until `deadline_unix`
    pub fn mark_over_limit(&self, key: &str, deadline_unix: u64) {
        self.entries.lock().put(key.to_string(), deadline_unix);
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

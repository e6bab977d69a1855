//! # Counter Store Layer
//!
//! This module provides the storage abstraction the rate limiting engine
//! counts against:
//!
//! - **Pipeline model**: ordered batches of counter operations addressed to a
//!   single shard slot
//! - **Slot hashing**: stable CRC16-based key slots with hash-tag support
//! - **Redis driver**: pooled standalone connections and cluster topologies
//! - **In-memory store**: a process-local store for tests and single-node use
//!
//! Counters are plain integers with a TTL; the engine never reads anything
//! else out of the store.

use async_trait::async_trait;
use thiserror::Error;

/// Store error types
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Failed to establish or recover a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection pool exhausted or misconfigured
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// A pipeline round-trip failed
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// The store returned a reply the driver could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single counter operation within a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOp {
    /// Atomically add `delta` to the counter at `key`, creating it at zero
    /// when absent; replies with the post-increment value
    IncrBy {
        /// Counter key
        key: String,
        /// Amount to add
        delta: u64,
    },

    /// Set the time-to-live of `key` in seconds; no-op when the key is absent
    Expire {
        /// Counter key
        key: String,
        /// TTL in seconds
        seconds: u64,
    },

    /// Read the counter at `key` without mutating it
    Get {
        /// Counter key
        key: String,
    },
}

impl CounterOp {
    /// The key this operation addresses
    pub fn key(&self) -> &str {
        match self {
            Self::IncrBy { key, .. } | Self::Expire { key, .. } | Self::Get { key } => key,
        }
    }
}

/// An ordered batch of operations intended for a single shard slot
///
/// Every key referenced in a pipeline must hash to the same slot; the
/// dispatcher upholds this invariant when grouping operations.
#[derive(Debug, Default)]
pub struct Pipeline {
    /// Operations in execution order
    pub ops: Vec<CounterOp>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation
    pub fn push(&mut self, op: CounterOp) {
        self.ops.push(op);
    }

    /// Number of operations in the pipeline
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the pipeline contains no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Reply to a single pipelined operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpReply {
    /// An integer counter value
    Value(i64),

    /// The key does not exist
    Missing,

    /// The operation completed without a counter value (e.g. `Expire`)
    Done,
}

impl OpReply {
    /// The counter value carried by this reply, if any
    pub fn value(&self) -> Option<i64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Missing | Self::Done => None,
        }
    }
}

/// Storage backend for distributed counters
///
/// Implementations route each pipeline to the shard currently owning its
/// slot. Topology redirects (permanent reassignments and temporary
/// migrations) are recovered inside the driver by refreshing the topology
/// view and retrying the whole pipeline; they never surface to callers on
/// success.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Whether keys are spread across shard slots
    fn is_clustered(&self) -> bool;

    /// The shard slot the given key hashes to; always 0 for non-clustered
    /// stores
    fn slot_of(&self, key: &str) -> u16;

    /// Execute all operations of a single-slot pipeline in order, returning
    /// one reply per operation
    async fn execute_pipeline(&self, pipeline: &Pipeline) -> StoreResult<Vec<OpReply>>;
}

pub mod memory;
pub mod redis;
pub mod slot;

pub use memory::MemoryStore;
pub use slot::{key_slot, SLOT_COUNT};

//! # Rate Limiting Core
//!
//! The fixed-window counting engine and its supporting machinery:
//!
//! - **Fixed-window engine** (`engine`): turns descriptors into counter
//!   operations and emits per-descriptor verdicts
//! - **Cache keys** (`cachekey`): deterministic counter keys per window
//! - **Count-Min Sketch** (`sketch`): probabilistic access frequency
//! - **Hot-key detector** (`hotkey`): admission to the hot set, LRU, decay
//! - **Micro-batcher** (`batcher`): coalesces concurrent increments on hot
//!   keys into single store operations
//! - **Dispatcher** (`dispatcher`): groups operations by shard slot and
//!   executes per-slot pipelines in parallel
//! - **Local over-limit cache** (`localcache`): short-circuits keys already
//!   known to be over limit

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_NEAR_LIMIT_RATIO;
use crate::store::StoreError;

/// Rate limiting error types
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// A counter store round-trip failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The request shape is invalid
    #[error("{descriptors} descriptors with {rules} rules")]
    MismatchedRules {
        /// Descriptors in the request
        descriptors: usize,
        /// Rules supplied alongside them
        rules: usize,
    },

    /// Internal coordination failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for rate limiting operations
pub type RateLimitResult<T> = std::result::Result<T, RateLimitError>;

/// Time unit of a rate limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLimitUnit {
    /// Per second
    Second,
    /// Per minute
    Minute,
    /// Per hour
    Hour,
    /// Per day
    Day,
    /// Per week
    Week,
    /// Per month (30 days)
    Month,
    /// Per year (365 days)
    Year,
}

impl RateLimitUnit {
    /// Window length in seconds
    pub fn seconds(&self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86400,
            Self::Week => 604800,
            Self::Month => 2592000,
            Self::Year => 31536000,
        }
    }
}

/// A configured quota, immutable per configuration generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Hits allowed per window
    pub limit: u32,

    /// Window unit
    pub unit: RateLimitUnit,

    /// Report OK externally regardless of the computed verdict
    pub shadow_mode: bool,

    /// No quota applies; matching descriptors produce no counter
    pub unlimited: bool,

    /// Ratio of the limit at which a descriptor counts as near limit
    pub near_limit_ratio: f32,
}

impl RateLimitRule {
    /// A rule with the given quota and default policy knobs
    pub fn new(limit: u32, unit: RateLimitUnit) -> Self {
        Self {
            limit,
            unit,
            shadow_mode: false,
            unlimited: false,
            near_limit_ratio: DEFAULT_NEAR_LIMIT_RATIO,
        }
    }

    /// Same rule in shadow mode
    pub fn shadow(mut self) -> Self {
        self.shadow_mode = true;
        self
    }
}

/// A quota subject: a list of key/value entries within a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Ordered key/value entries identifying the subject
    pub entries: Vec<(String, String)>,

    /// Hits this request accounts for; defaults to 1
    pub hits_addend: Option<u32>,
}

impl Descriptor {
    /// A descriptor from key/value entries with the default hit count
    pub fn new<K: Into<String>, V: Into<String>>(entries: Vec<(K, V)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            hits_addend: None,
        }
    }

    /// Same descriptor accounting for `hits` hits
    pub fn with_hits(mut self, hits: u32) -> Self {
        self.hits_addend = Some(hits);
        self
    }

    /// Effective hit count
    pub fn hits(&self) -> u64 {
        u64::from(self.hits_addend.unwrap_or(1))
    }
}

/// Outcome code of a single descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictCode {
    /// Within quota
    Ok,
    /// Quota exhausted
    OverLimit,
}

/// Per-descriptor answer of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Outcome code; shadow-mode rules always report [`VerdictCode::Ok`]
    pub code: VerdictCode,

    /// The configured limit, when a rule matched
    pub current_limit: Option<u32>,

    /// Hits left in the current window
    pub limit_remaining: u32,

    /// Time until the window rolls over and the counter resets
    pub duration_until_reset: Duration,

    /// Whether a shadow-mode rule suppressed an over-limit verdict, so
    /// downstream logging can record the would-be denial
    pub shadow_mode: bool,
}

impl Verdict {
    /// Whether the descriptor is within quota
    pub fn is_ok(&self) -> bool {
        self.code == VerdictCode::Ok
    }

    fn unmatched() -> Self {
        Self {
            code: VerdictCode::Ok,
            current_limit: None,
            limit_remaining: 0,
            duration_until_reset: Duration::ZERO,
            shadow_mode: false,
        }
    }
}

pub mod batcher;
pub mod cachekey;
pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod hotkey;
pub mod localcache;
pub mod sketch;

pub use batcher::{BatcherConfig, HotKeyBatcher};
pub use cachekey::{CacheKey, CacheKeyGenerator};
pub use clock::{Clock, SystemClock};
pub use dispatcher::{PipelineDispatcher, SlotBatch};
pub use engine::{EngineConfig, FixedWindowEngine};
pub use hotkey::{HotKeyConfig, HotKeyDetector};
pub use localcache::OverLimitCache;
pub use sketch::{CountMinSketch, SketchConfig};

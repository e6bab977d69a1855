//! # Service Configuration
//!
//! Typed configuration for the rate limiting core. The embedding service is
//! responsible for loading these settings (file, environment, control plane);
//! this module only defines the shape and the defaults.

use std::time::Duration;

use serde::Deserialize;

/// Default ratio of the limit at which a descriptor counts as "near limit"
pub const DEFAULT_NEAR_LIMIT_RATIO: f32 = 0.8;

/// Behaviour of a connection pool when all connections are checked out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolOnEmpty {
    /// Open a fresh, unpooled connection
    Create,
    /// Fail the acquisition immediately
    Error,
    /// Block until a connection frees up, capped by the wait duration
    Wait,
}

/// Counter store connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store endpoint URLs; more than one implies a clustered topology
    /// unless `clustered` says otherwise
    pub urls: Vec<String>,

    /// Whether the endpoints form a sharded cluster
    pub clustered: bool,

    /// Connections kept per endpoint
    ///
    /// Parallel slot dispatch queues behind the pool: workloads touching
    /// several slots per request at high concurrency want this well above
    /// the usual single-digit default.
    pub pool_size: usize,

    /// What to do when the pool is empty
    pub pool_on_empty: PoolOnEmpty,

    /// Upper bound on blocking when `pool_on_empty` is `Wait`
    pub pool_on_empty_wait_ms: u64,

    /// Cap on establishing a single connection
    pub connect_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            urls: vec!["redis://localhost:6379".to_string()],
            clustered: false,
            pool_size: 50,
            pool_on_empty: PoolOnEmpty::Wait,
            pool_on_empty_wait_ms: 1000,
            connect_timeout_ms: 5000,
        }
    }
}

impl StoreSettings {
    /// Wait cap as a duration
    pub fn pool_on_empty_wait(&self) -> Duration {
        Duration::from_millis(self.pool_on_empty_wait_ms)
    }

    /// Connect cap as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Hot key detection and batching settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HotKeySettings {
    /// Master switch for the detector and batcher
    pub enabled: bool,

    /// Memory budget for the frequency sketch in bytes
    pub sketch_memory_bytes: usize,

    /// Number of sketch rows (independent hash functions)
    pub sketch_depth: usize,

    /// Estimated access frequency at which a key is classified hot
    pub threshold: u32,

    /// Cap on the tracked hot set; least-recently-used keys are evicted
    /// beyond it
    pub max_keys: usize,

    /// Micro-batch flush tick in microseconds
    pub flush_window_micros: u64,

    /// Interval between sketch decay passes in seconds
    pub decay_interval_secs: u64,

    /// Multiplier applied to every sketch cell on decay
    pub decay_factor: f64,
}

impl Default for HotKeySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sketch_memory_bytes: 10 * 1024 * 1024,
            sketch_depth: 4,
            threshold: 128,
            max_keys: 1024,
            flush_window_micros: 300,
            decay_interval_secs: 10,
            decay_factor: 0.5,
        }
    }
}

impl HotKeySettings {
    /// Flush tick as a duration
    pub fn flush_window(&self) -> Duration {
        Duration::from_micros(self.flush_window_micros)
    }

    /// Decay interval as a duration
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

/// Top-level settings for the rate limiting core
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Prefix prepended to every counter key; lets multiple tenants share
    /// one store
    pub cache_key_prefix: String,

    /// Upper bound of the uniform jitter added to counter TTLs; 0 disables
    ///
    /// Jitter prevents synchronized mass expiry of keys created in the same
    /// window.
    pub expiration_jitter_max_seconds: u64,

    /// Default near-limit ratio applied to rules that do not carry their own
    pub near_limit_ratio: f32,

    /// Enable the pre-read policy: when any descriptor is near its limit,
    /// only near-limit descriptors are incremented
    pub stop_cache_key_increment_when_overlimit: bool,

    /// Byte budget of the local over-limit cache; 0 disables it
    pub local_cache_size_bytes: usize,

    /// Hot key detection and batching
    pub hot_key: HotKeySettings,

    /// Primary counter store
    pub store: StoreSettings,

    /// Optional dedicated store for second-unit rules
    pub persecond_store: Option<StoreSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_key_prefix: String::new(),
            expiration_jitter_max_seconds: 0,
            near_limit_ratio: DEFAULT_NEAR_LIMIT_RATIO,
            stop_cache_key_increment_when_overlimit: false,
            local_cache_size_bytes: 0,
            hot_key: HotKeySettings::default(),
            store: StoreSettings::default(),
            persecond_store: None,
        }
    }
}

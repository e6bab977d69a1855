//! Fixed-window counting engine
//!
//! Orchestrates one rate limit request end to end: key generation, the
//! local over-limit short-circuit, the optional pre-read policy, hot/cold
//! increment routing, parallel slot dispatch, and verdict synthesis. The
//! engine is re-entrant; many requests may be in flight against one
//! instance.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::Settings;
use crate::store::{CounterOp, CounterStore, StoreResult};

use super::batcher::{BatcherConfig, HotKeyBatcher};
use super::cachekey::{CacheKey, CacheKeyGenerator};
use super::clock::{Clock, SystemClock};
use super::dispatcher::{PipelineDispatcher, SlotBatch};
use super::hotkey::{HotKeyConfig, HotKeyDetector};
use super::localcache::OverLimitCache;
use super::sketch::SketchConfig;
use super::{
    Descriptor, RateLimitError, RateLimitResult, RateLimitRule, RateLimitUnit, Verdict,
    VerdictCode,
};

/// Engine construction parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix prepended to every counter key
    pub cache_key_prefix: String,

    /// Upper bound of uniform TTL jitter in seconds; 0 disables
    pub expiration_jitter_max_seconds: u64,

    /// Enable the pre-read and selective-increment policy
    pub stop_cache_key_increment_when_overlimit: bool,

    /// Byte budget of the local over-limit cache; 0 disables
    pub local_cache_size_bytes: usize,

    /// Enable hot-key detection and micro-batching
    pub hot_key_enabled: bool,

    /// Detector tuning, when enabled
    pub hot_key: HotKeyConfig,

    /// Micro-batch flush tick, when enabled
    pub flush_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_key_prefix: String::new(),
            expiration_jitter_max_seconds: 0,
            stop_cache_key_increment_when_overlimit: false,
            local_cache_size_bytes: 0,
            hot_key_enabled: false,
            hot_key: HotKeyConfig::default(),
            flush_window: BatcherConfig::default().flush_window,
        }
    }
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            cache_key_prefix: settings.cache_key_prefix.clone(),
            expiration_jitter_max_seconds: settings.expiration_jitter_max_seconds,
            stop_cache_key_increment_when_overlimit: settings
                .stop_cache_key_increment_when_overlimit,
            local_cache_size_bytes: settings.local_cache_size_bytes,
            hot_key_enabled: settings.hot_key.enabled,
            hot_key: HotKeyConfig {
                threshold: settings.hot_key.threshold,
                max_keys: settings.hot_key.max_keys,
                decay_interval: settings.hot_key.decay_interval(),
                decay_factor: settings.hot_key.decay_factor,
                sketch: SketchConfig {
                    depth: settings.hot_key.sketch_depth,
                    memory_bytes: settings.hot_key.sketch_memory_bytes,
                },
            },
            flush_window: settings.hot_key.flush_window(),
        }
    }
}

/// One store with its dispatcher and, when hot keys are enabled, its batcher
struct StoreLane {
    dispatcher: PipelineDispatcher,
    batcher: Option<Arc<HotKeyBatcher>>,
}

impl StoreLane {
    fn new(store: Arc<dyn CounterStore>, hot_key_enabled: bool, flush_window: Duration) -> Self {
        let batcher = hot_key_enabled.then(|| {
            let batcher = Arc::new(HotKeyBatcher::new(
                Arc::clone(&store),
                BatcherConfig { flush_window },
            ));
            batcher.start();
            batcher
        });
        Self {
            dispatcher: PipelineDispatcher::new(store),
            batcher,
        }
    }
}

/// The fixed-window rate limiting engine
///
/// Owns the detector, batcher(s), dispatcher(s) and local over-limit cache
/// for the lifetime of the service. With a dedicated per-second store
/// configured, second-unit rules count against it through their own batcher;
/// a key's store is a pure function of its rule's unit, so no key changes
/// stores mid-window.
pub struct FixedWindowEngine {
    key_generator: CacheKeyGenerator,
    jitter_max_seconds: u64,
    stop_increment_when_overlimit: bool,
    primary: StoreLane,
    per_second: Option<StoreLane>,
    detector: Option<HotKeyDetector>,
    local_cache: Option<OverLimitCache>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowEngine {
    /// Build an engine over the given store(s)
    ///
    /// Must be called within a runtime when hot-key batching is enabled,
    /// because the batcher's flush worker is spawned here.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CounterStore>,
        per_second_store: Option<Arc<dyn CounterStore>>,
    ) -> Self {
        Self::with_clock(config, store, per_second_store, Arc::new(SystemClock))
    }

    /// Same as [`FixedWindowEngine::new`] with an explicit time source
    pub fn with_clock(
        config: EngineConfig,
        store: Arc<dyn CounterStore>,
        per_second_store: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key_generator: CacheKeyGenerator::new(config.cache_key_prefix),
            jitter_max_seconds: config.expiration_jitter_max_seconds,
            stop_increment_when_overlimit: config.stop_cache_key_increment_when_overlimit,
            primary: StoreLane::new(store, config.hot_key_enabled, config.flush_window),
            per_second: per_second_store
                .map(|store| StoreLane::new(store, config.hot_key_enabled, config.flush_window)),
            detector: config
                .hot_key_enabled
                .then(|| HotKeyDetector::new(config.hot_key)),
            local_cache: OverLimitCache::with_size_bytes(config.local_cache_size_bytes),
            clock,
        }
    }

    /// Answer one rate limit request
    ///
    /// `rules[i]` is the resolved rule for `descriptors[i]`, `None` when no
    /// rule matched. The returned vector holds one verdict per descriptor in
    /// order; any store failure fails the whole request and no partial
    /// verdicts are returned.
    pub async fn check(
        &self,
        domain: &str,
        descriptors: &[Descriptor],
        rules: &[Option<RateLimitRule>],
    ) -> RateLimitResult<Vec<Verdict>> {
        if descriptors.len() != rules.len() {
            return Err(RateLimitError::MismatchedRules {
                descriptors: descriptors.len(),
                rules: rules.len(),
            });
        }
        let now = self.clock.now_unix();
        let count = descriptors.len();

        // Counter keys; unmatched and unlimited descriptors produce none
        let mut keys: Vec<Option<CacheKey>> = Vec::with_capacity(count);
        let mut expirations: Vec<u64> = vec![0; count];
        for i in 0..count {
            let key = self
                .key_generator
                .generate(domain, &descriptors[i], rules[i].as_ref(), now);
            if let Some(key) = &key {
                expirations[i] = key.unit_seconds + self.ttl_jitter();
            }
            keys.push(key);
        }

        // Keys already known over limit skip the store entirely
        let mut local_over = vec![false; count];
        let mut any_local_over = false;
        if let Some(cache) = &self.local_cache {
            for (i, key) in keys.iter().enumerate() {
                if let Some(key) = key {
                    if cache.is_over_limit(&key.key, now) {
                        local_over[i] = true;
                        any_local_over = true;
                    }
                }
            }
        }

        // Pre-read: classify near-limit descriptors without mutating
        let mut pre_read: Vec<Option<u64>> = vec![None; count];
        let mut near_limit = vec![false; count];
        let mut any_near_limit = false;
        if self.stop_increment_when_overlimit && !any_local_over {
            let values = self.read_current(&keys, rules, count).await?;
            for i in 0..count {
                let (Some(_), Some(rule)) = (&keys[i], rules[i].as_ref()) else {
                    continue;
                };
                let before = values[i].map_or(0, |value| value.max(0) as u64);
                pre_read[i] = Some(before);
                let after = before + descriptors[i].hits();
                if after as f64 >= f64::from(rule.limit) * f64::from(rule.near_limit_ratio) {
                    near_limit[i] = true;
                    any_near_limit = true;
                }
            }
        }

        // Increment phase: hot keys go to the batcher, cold keys to
        // slot-grouped pipelines; under the pre-read policy, suppressed keys
        // issue no operation at all
        let mut batches = [SlotBatch::new(), SlotBatch::new()];
        let mut receivers = Vec::with_capacity(count);
        for i in 0..count {
            let (Some(key), Some(rule)) = (&keys[i], rules[i].as_ref()) else {
                receivers.push(None);
                continue;
            };
            if local_over[i] {
                receivers.push(None);
                continue;
            }
            let hits = descriptors[i].hits();
            let effective = if !self.stop_increment_when_overlimit {
                hits
            } else if any_local_over {
                0
            } else if !any_near_limit || near_limit[i] {
                hits
            } else {
                0
            };
            if self.stop_increment_when_overlimit && effective == 0 {
                // Verdict falls back to the pre-read value
                receivers.push(None);
                continue;
            }

            let lane_index = self.lane_index(rule.unit);
            let lane = if lane_index == 1 {
                self.per_second.as_ref().unwrap_or(&self.primary)
            } else {
                &self.primary
            };
            if let (Some(detector), Some(batcher)) = (&self.detector, &lane.batcher) {
                if detector.record_access(&key.key) {
                    receivers.push(Some(batcher.submit(&key.key, effective, expirations[i])));
                    continue;
                }
            }
            let slot = lane.dispatcher.slot_of(&key.key);
            batches[lane_index].push(
                slot,
                CounterOp::IncrBy {
                    key: key.key.clone(),
                    delta: effective,
                },
                Some(i),
            );
            batches[lane_index].push(
                slot,
                CounterOp::Expire {
                    key: key.key.clone(),
                    seconds: expirations[i],
                },
                None,
            );
            receivers.push(None);
        }

        let [primary_batch, second_batch] = batches;
        let (primary_values, second_values) = tokio::join!(
            self.primary.dispatcher.dispatch(primary_batch, count),
            dispatch_optional(self.per_second.as_ref(), second_batch, count)
        );
        let mut results: Vec<Option<u64>> = merge(primary_values?, second_values?)
            .into_iter()
            .map(|value| value.map(|v| v.max(0) as u64))
            .collect();

        // Hot-key promises resolve after the next batch flush
        for (i, receiver) in receivers.into_iter().enumerate() {
            if let Some(receiver) = receiver {
                let value = receiver
                    .await
                    .map_err(|_| RateLimitError::Internal("batch result dropped".to_string()))??;
                results[i] = Some(value);
            }
        }

        // Verdict synthesis
        let mut verdicts = Vec::with_capacity(count);
        for i in 0..count {
            let Some(rule) = rules[i].as_ref() else {
                verdicts.push(Verdict::unmatched());
                continue;
            };
            let Some(key) = &keys[i] else {
                verdicts.push(Verdict::unmatched());
                continue;
            };
            let duration_until_reset = Duration::from_secs(key.window_end().saturating_sub(now));

            if local_over[i] {
                verdicts.push(Verdict {
                    code: if rule.shadow_mode {
                        VerdictCode::Ok
                    } else {
                        VerdictCode::OverLimit
                    },
                    current_limit: Some(rule.limit),
                    limit_remaining: 0,
                    duration_until_reset,
                    shadow_mode: rule.shadow_mode,
                });
                continue;
            }

            let hits = descriptors[i].hits();
            let after = results[i].or(pre_read[i]).unwrap_or(0);
            let before = after.saturating_sub(hits);
            let over = after > u64::from(rule.limit);
            let remaining = u64::from(rule.limit).saturating_sub(after) as u32;

            // A fresh transition to over limit is memoized until the window
            // rolls over
            if over && before <= u64::from(rule.limit) {
                if let Some(cache) = &self.local_cache {
                    cache.mark_over_limit(&key.key, key.window_end());
                }
            }

            verdicts.push(Verdict {
                code: if over && !rule.shadow_mode {
                    VerdictCode::OverLimit
                } else {
                    VerdictCode::Ok
                },
                current_limit: Some(rule.limit),
                limit_remaining: remaining,
                duration_until_reset,
                shadow_mode: rule.shadow_mode && over,
            });
        }
        Ok(verdicts)
    }

    /// Stop batch workers and drain their pending maps
    pub async fn close(&self) {
        if let Some(batcher) = &self.primary.batcher {
            batcher.stop().await;
        }
        if let Some(lane) = &self.per_second {
            if let Some(batcher) = &lane.batcher {
                batcher.stop().await;
            }
        }
    }

    /// Read current counter values through slot-grouped GET pipelines
    async fn read_current(
        &self,
        keys: &[Option<CacheKey>],
        rules: &[Option<RateLimitRule>],
        count: usize,
    ) -> RateLimitResult<Vec<Option<i64>>> {
        let mut batches = [SlotBatch::new(), SlotBatch::new()];
        for i in 0..count {
            let (Some(key), Some(rule)) = (&keys[i], rules[i].as_ref()) else {
                continue;
            };
            let lane_index = self.lane_index(rule.unit);
            let lane = if lane_index == 1 {
                self.per_second.as_ref().unwrap_or(&self.primary)
            } else {
                &self.primary
            };
            batches[lane_index].push(
                lane.dispatcher.slot_of(&key.key),
                CounterOp::Get {
                    key: key.key.clone(),
                },
                Some(i),
            );
        }
        let [primary_batch, second_batch] = batches;
        let (primary_values, second_values) = tokio::join!(
            self.primary.dispatcher.dispatch(primary_batch, count),
            dispatch_optional(self.per_second.as_ref(), second_batch, count)
        );
        Ok(merge(primary_values?, second_values?))
    }

    /// Which lane a rule's counters live on: 1 is the per-second store
    fn lane_index(&self, unit: RateLimitUnit) -> usize {
        usize::from(unit == RateLimitUnit::Second && self.per_second.is_some())
    }

    fn ttl_jitter(&self) -> u64 {
        if self.jitter_max_seconds == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_max_seconds)
        }
    }
}

async fn dispatch_optional(
    lane: Option<&StoreLane>,
    batch: SlotBatch,
    count: usize,
) -> StoreResult<Vec<Option<i64>>> {
    match lane {
        Some(lane) => lane.dispatcher.dispatch(batch, count).await,
        None => Ok(vec![None; count]),
    }
}

fn merge(primary: Vec<Option<i64>>, secondary: Vec<Option<i64>>) -> Vec<Option<i64>> {
    primary
        .into_iter()
        .zip(secondary)
        .map(|(a, b)| a.or(b))
        .collect()
}

//! Hot-key detection
//!
//! Classifies counter keys whose access frequency has crossed a threshold.
//! The sketch supplies the frequency estimate; a bounded LRU set tracks
//! which keys are currently hot. Sketch cells are periodically attenuated so
//! yesterday's hot keys cool down; decay is triggered lazily by the first
//! access past the deadline rather than by a dedicated timer.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use super::sketch::{CountMinSketch, SketchConfig};

/// Detector tuning
#[derive(Debug, Clone, Copy)]
pub struct HotKeyConfig {
    /// Estimated frequency at which a key is classified hot
    pub threshold: u32,

    /// Cap on the hot set; LRU-oldest keys are evicted beyond it
    pub max_keys: usize,

    /// Time between decay passes
    pub decay_interval: Duration,

    /// Multiplier applied to every sketch cell on decay
    pub decay_factor: f64,

    /// Sketch sizing
    pub sketch: SketchConfig,
}

impl Default for HotKeyConfig {
    fn default() -> Self {
        Self {
            threshold: 128,
            max_keys: 1024,
            decay_interval: Duration::from_secs(10),
            decay_factor: 0.5,
            sketch: SketchConfig::default(),
        }
    }
}

struct DetectorState {
    hot: LruCache<String, ()>,
    next_decay: Instant,
}

/// Tracks access frequency and classifies keys as hot or cold
pub struct HotKeyDetector {
    config: HotKeyConfig,
    sketch: CountMinSketch,
    state: Mutex<DetectorState>,
}

impl HotKeyDetector {
    /// Create a detector with the given tuning
    pub fn new(config: HotKeyConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_keys.max(1)).unwrap();
        Self {
            sketch: CountMinSketch::new(config.sketch),
            state: Mutex::new(DetectorState {
                hot: LruCache::new(capacity),
                next_decay: Instant::now() + config.decay_interval,
            }),
            config,
        }
    }

    /// Record one access to `key` and report whether it is currently hot
    ///
    /// Once a key turns hot it stays hot until a decay pass cools it or a
    /// later promotion evicts it from the LRU-bounded hot set.
    pub fn record_access(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now >= state.next_decay {
            self.decay_locked(&mut state, now);
        }

        let estimate = self.sketch.increment(key, 1);
        // get() bumps recency for keys already in the hot set
        if state.hot.get(key).is_some() {
            return true;
        }
        if estimate >= self.config.threshold {
            if let Some((evicted, _)) = state.hot.push(key.to_string(), ()) {
                if evicted != key {
                    tracing::debug!(key = %evicted, "hot key evicted by newer promotion");
                }
            }
            tracing::debug!(key = %key, estimate, "key promoted to hot");
            return true;
        }
        false
    }

    /// Whether `key` is currently in the hot set, without recording an access
    pub fn is_hot(&self, key: &str) -> bool {
        self.state.lock().hot.contains(key)
    }

    /// Current hot-set size
    pub fn hot_key_count(&self) -> usize {
        self.state.lock().hot.len()
    }

    /// Current frequency estimate for `key`
    pub fn estimate(&self, key: &str) -> u32 {
        self.sketch.estimate(key)
    }

    fn decay_locked(&self, state: &mut DetectorState, now: Instant) {
        self.sketch.decay(self.config.decay_factor);

        let cooled: Vec<String> = state
            .hot
            .iter()
            .map(|(key, _)| key.clone())
            .filter(|key| self.sketch.estimate(key) < self.config.threshold)
            .collect();
        for key in cooled {
            state.hot.pop(&key);
            tracing::debug!(key = %key, "hot key cooled by decay");
        }
        state.next_decay = now + self.config.decay_interval;
    }

    #[cfg(test)]
    fn force_decay(&self) {
        let mut state = self.state.lock();
        self.decay_locked(&mut state, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: u32, max_keys: usize) -> HotKeyDetector {
        HotKeyDetector::new(HotKeyConfig {
            threshold,
            max_keys,
            decay_interval: Duration::from_secs(3600),
            decay_factor: 0.5,
            sketch: SketchConfig {
                depth: 4,
                memory_bytes: 64 * 1024,
            },
        })
    }

    #[test]
    fn test_cold_until_threshold() {
        let detector = detector(3, 8);
        assert!(!detector.record_access("k"));
        assert!(!detector.record_access("k"));
        assert!(detector.record_access("k"));
        assert!(detector.is_hot("k"));
    }

    #[test]
    fn test_hot_keys_stay_hot() {
        let detector = detector(2, 8);
        detector.record_access("k");
        detector.record_access("k");
        for _ in 0..10 {
            assert!(detector.record_access("k"));
        }
    }

    #[test]
    fn test_hot_set_bounded_by_lru() {
        let detector = detector(1, 2);
        assert!(detector.record_access("a"));
        assert!(detector.record_access("b"));
        assert!(detector.record_access("c"));
        assert_eq!(detector.hot_key_count(), 2);
        // "a" was the LRU-oldest and got evicted by c's promotion
        assert!(!detector.is_hot("a"));
        assert!(detector.is_hot("b"));
        assert!(detector.is_hot("c"));
    }

    #[test]
    fn test_recency_bump_protects_from_eviction() {
        let detector = detector(1, 2);
        detector.record_access("a");
        detector.record_access("b");
        // Touch "a" again so "b" is now the LRU-oldest
        detector.record_access("a");
        detector.record_access("c");
        assert!(detector.is_hot("a"));
        assert!(!detector.is_hot("b"));
        assert!(detector.is_hot("c"));
    }

    #[test]
    fn test_decay_cools_idle_keys() {
        let detector = detector(4, 8);
        for _ in 0..4 {
            detector.record_access("k");
        }
        assert!(detector.is_hot("k"));

        // One decay halves the estimate to 2, below the threshold
        detector.force_decay();
        assert!(!detector.is_hot("k"));
        assert_eq!(detector.hot_key_count(), 0);
    }

    #[test]
    fn test_busy_keys_survive_decay() {
        let detector = detector(4, 8);
        for _ in 0..20 {
            detector.record_access("k");
        }
        detector.force_decay();
        // 20 / 2 = 10 is still over the threshold
        assert!(detector.is_hot("k"));
    }
}

//! Count-Min Sketch
//!
//! Approximate frequency counters for arbitrary string keys under a fixed
//! memory budget. Estimates never under-count; the over-count probability
//! shrinks as the width grows. Backs hot-key detection.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use parking_lot::RwLock;

/// Narrowest row the sketch will allocate
const MIN_WIDTH: usize = 256;

/// Fewest and most rows allowed
const DEPTH_RANGE: (usize, usize) = (2, 8);

/// Sketch sizing
#[derive(Debug, Clone, Copy)]
pub struct SketchConfig {
    /// Number of rows (independent hash functions); clamped to [2, 8]
    pub depth: usize,

    /// Memory budget in bytes; the row width is derived from it
    pub memory_bytes: usize,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            memory_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A `depth × width` matrix of saturating counters with per-row hash seeds
///
/// A single reader-writer lock protects the matrix: increments take the
/// write lock for the `depth` touched cells, estimates take the read lock,
/// and decay takes the write lock on its infrequent passes.
pub struct CountMinSketch {
    depth: usize,
    width: usize,
    seeds: Vec<u64>,
    cells: RwLock<Vec<u32>>,
}

impl CountMinSketch {
    /// Allocate a sketch for the given sizing
    pub fn new(config: SketchConfig) -> Self {
        let depth = config.depth.clamp(DEPTH_RANGE.0, DEPTH_RANGE.1);
        let width = (config.memory_bytes / (depth * std::mem::size_of::<u32>())).max(MIN_WIDTH);
        let seeds = (0..depth).map(|_| rand::random::<u64>()).collect();
        Self {
            depth,
            width,
            seeds,
            cells: RwLock::new(vec![0; depth * width]),
        }
    }

    /// Number of rows
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Counters per row
    pub fn width(&self) -> usize {
        self.width
    }

    fn cell_index(&self, row: usize, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(self.seeds[row]);
        hasher.write(key.as_bytes());
        row * self.width + (hasher.finish() % self.width as u64) as usize
    }

    /// Add `delta` to the key's cell in every row, saturating at the counter
    /// maximum; returns the new estimate
    pub fn increment(&self, key: &str, delta: u32) -> u32 {
        let mut cells = self.cells.write();
        let mut estimate = u32::MAX;
        for row in 0..self.depth {
            let index = self.cell_index(row, key);
            cells[index] = cells[index].saturating_add(delta);
            estimate = estimate.min(cells[index]);
        }
        estimate
    }

    /// Estimated frequency of the key: the minimum cell across rows
    pub fn estimate(&self, key: &str) -> u32 {
        let cells = self.cells.read();
        (0..self.depth)
            .map(|row| cells[self.cell_index(row, key)])
            .min()
            .unwrap_or(0)
    }

    /// Multiply every cell by `factor`, flooring
    pub fn decay(&self, factor: f64) {
        let mut cells = self.cells.write();
        for cell in cells.iter_mut() {
            *cell = (f64::from(*cell) * factor) as u32;
        }
    }

    /// Zero every cell
    pub fn reset(&self) {
        let mut cells = self.cells.write();
        for cell in cells.iter_mut() {
            *cell = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn small_sketch() -> CountMinSketch {
        CountMinSketch::new(SketchConfig {
            depth: 4,
            memory_bytes: 64 * 1024,
        })
    }

    #[test]
    fn test_width_derivation() {
        let sketch = CountMinSketch::new(SketchConfig::default());
        assert_eq!(sketch.depth(), 4);
        assert_eq!(sketch.width(), 655_360);

        // A tiny budget still gets the minimum width
        let tiny = CountMinSketch::new(SketchConfig {
            depth: 4,
            memory_bytes: 16,
        });
        assert_eq!(tiny.width(), 256);
    }

    #[test]
    fn test_depth_clamped() {
        let shallow = CountMinSketch::new(SketchConfig {
            depth: 0,
            memory_bytes: 4096,
        });
        assert_eq!(shallow.depth(), 2);

        let deep = CountMinSketch::new(SketchConfig {
            depth: 64,
            memory_bytes: 4096,
        });
        assert_eq!(deep.depth(), 8);
    }

    #[test]
    fn test_increment_returns_estimate() {
        let sketch = small_sketch();
        assert_eq!(sketch.increment("k", 1), 1);
        assert_eq!(sketch.increment("k", 2), 3);
        assert_eq!(sketch.estimate("k"), 3);
    }

    #[test]
    fn test_estimate_of_unseen_key() {
        let sketch = small_sketch();
        sketch.increment("seen", 100);
        // With an empty sketch, every row cell of an unseen key is zero
        assert_eq!(CountMinSketch::new(SketchConfig::default()).estimate("x"), 0);
        assert!(sketch.estimate("seen") >= 100);
    }

    #[test]
    fn test_saturation() {
        let sketch = small_sketch();
        sketch.increment("k", u32::MAX);
        assert_eq!(sketch.increment("k", u32::MAX), u32::MAX);
    }

    #[test]
    fn test_decay_floors() {
        let sketch = small_sketch();
        sketch.increment("k", 5);
        sketch.decay(0.5);
        assert_eq!(sketch.estimate("k"), 2);
        sketch.decay(0.5);
        assert_eq!(sketch.estimate("k"), 1);
        sketch.decay(0.5);
        assert_eq!(sketch.estimate("k"), 0);
    }

    #[test]
    fn test_reset() {
        let sketch = small_sketch();
        sketch.increment("a", 10);
        sketch.increment("b", 20);
        sketch.reset();
        assert_eq!(sketch.estimate("a"), 0);
        assert_eq!(sketch.estimate("b"), 0);
    }

    proptest! {
        #[test]
        fn prop_never_undercounts(
            ops in proptest::collection::vec(("[a-f]{1,3}", 1u32..20), 1..200)
        ) {
            let sketch = small_sketch();
            let mut true_counts: HashMap<String, u64> = HashMap::new();
            for (key, delta) in &ops {
                sketch.increment(key, *delta);
                *true_counts.entry(key.clone()).or_default() += u64::from(*delta);
            }
            for (key, count) in &true_counts {
                prop_assert!(u64::from(sketch.estimate(key)) >= *count);
            }
        }
    }
}

//! Count-min sketch of tuple access frequency.
//!
//! Used only to bias eviction: tuples whose estimated access count reaches the
//! hot threshold get a second chance instead of being evicted. Estimates never
//! undercount, so a cold tuple may be spared but a hot one is never evicted
//! for being misjudged cold. Nothing here affects correctness.

use crate::config::SketchConfig;
use crate::table::{TableId, TupleId};

/// Seeds for the row hashes (one per row).
const HASH_SEEDS: [u64; 8] = [
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
    0x85eb_ca77_c2b2_ae63,
    0x27d4_eb2f_1656_67c5,
    0x94d0_49bb_1331_11eb,
    0xbf58_476d_1ce4_e5b9,
    0xff51_afd7_ed55_8ccd,
];

/// Key identifying a tuple across tables.
pub fn tuple_key(table: TableId, tuple: TupleId) -> u64 {
    ((table.0 as u64) << 32) | tuple as u64
}

/// Access-frequency sketch with a sampled adaptive threshold.
#[derive(Debug, Clone)]
pub struct FrequencySketch {
    /// `counters[row * width + col]`.
    counters: Vec<u8>,
    width: usize,
    height: usize,
    mask: u64,
    base_threshold: u8,
    threshold: u8,
    sample: Vec<u8>,
    sample_size: usize,
    total: u64,
}

impl FrequencySketch {
    pub fn new(config: &SketchConfig) -> Self {
        let width = config.width.max(1).next_power_of_two();
        let height = config.height.clamp(1, HASH_SEEDS.len());
        Self {
            counters: vec![0u8; width * height],
            width,
            height,
            mask: (width - 1) as u64,
            base_threshold: config.threshold,
            threshold: config.threshold,
            sample: Vec::with_capacity(config.sample_size),
            sample_size: config.sample_size,
            total: 0,
        }
    }

    /// Column of `key` in `row`.
    fn index(&self, key: u64, row: usize) -> usize {
        // splitmix64 finalizer over the seeded key.
        let mut h = key ^ HASH_SEEDS[row];
        h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        h ^= h >> 31;
        row * self.width + (h & self.mask) as usize
    }

    /// Count one access to `key`.
    pub fn record(&mut self, key: u64) {
        let mut estimate = u8::MAX;
        for row in 0..self.height {
            let idx = self.index(key, row);
            self.counters[idx] = self.counters[idx].saturating_add(1);
            estimate = estimate.min(self.counters[idx]);
        }
        self.total = self.total.wrapping_add(1);

        if self.sample_size == 0 {
            return;
        }
        self.sample.push(estimate);
        if self.sample.len() >= self.sample_size {
            self.sample.sort_unstable();
            let median = self.sample[self.sample.len() / 2];
            self.threshold = median.max(self.base_threshold);
            self.sample.clear();
        }
    }

    /// Estimated access count; never below the true count until saturation.
    pub fn estimate(&self, key: u64) -> u8 {
        (0..self.height)
            .map(|row| self.counters[self.index(key, row)])
            .min()
            .unwrap_or(0)
    }

    pub fn is_hot(&self, key: u64) -> bool {
        self.estimate(key) >= self.threshold
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn total_accesses(&self) -> u64 {
        self.total
    }

    /// Halve every counter, keeping relative order of recent activity.
    pub fn decay(&mut self) {
        for c in self.counters.iter_mut() {
            *c >>= 1;
        }
    }

    /// Start a fresh measurement window.
    pub fn reset(&mut self) {
        self.counters.iter_mut().for_each(|c| *c = 0);
        self.sample.clear();
        self.threshold = self.base_threshold;
        self.total = 0;
    }

    /// Counter memory in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FrequencySketch {
        FrequencySketch::new(&SketchConfig {
            enabled: true,
            width: 1024,
            height: 3,
            threshold: 5,
            sample_size: 0,
        })
    }

    #[test]
    fn test_default_footprint() {
        let sketch = FrequencySketch::new(&SketchConfig::default());
        assert_eq!(sketch.memory_bytes(), 3 * 262_144);
        assert_eq!(sketch.threshold(), 10);
    }

    #[test]
    fn test_estimate_never_undercounts() {
        let mut sketch = small();
        for i in 0..500u32 {
            for _ in 0..(i % 7) {
                sketch.record(tuple_key(TableId(1), i));
            }
        }
        for i in 0..500u32 {
            assert!(sketch.estimate(tuple_key(TableId(1), i)) as u32 >= i % 7);
        }
    }

    #[test]
    fn test_hot_threshold() {
        let mut sketch = small();
        let key = tuple_key(TableId(0), 42);
        for _ in 0..4 {
            sketch.record(key);
        }
        assert!(!sketch.is_hot(key));
        sketch.record(key);
        assert!(sketch.is_hot(key));
    }

    #[test]
    fn test_decay_and_reset() {
        let mut sketch = small();
        let key = tuple_key(TableId(0), 1);
        for _ in 0..300 {
            sketch.record(key);
        }
        assert_eq!(sketch.estimate(key), 255);

        sketch.decay();
        assert_eq!(sketch.estimate(key), 127);

        sketch.reset();
        assert_eq!(sketch.estimate(key), 0);
        assert_eq!(sketch.total_accesses(), 0);
    }

    #[test]
    fn test_sampled_threshold_adapts() {
        let mut sketch = FrequencySketch::new(&SketchConfig {
            enabled: true,
            width: 1024,
            height: 3,
            threshold: 2,
            sample_size: 10,
        });
        let key = tuple_key(TableId(0), 9);
        for _ in 0..10 {
            sketch.record(key);
        }
        // Samples were 1..=10; median is 6.
        assert_eq!(sketch.threshold(), 6);

        sketch.reset();
        assert_eq!(sketch.threshold(), 2);
    }
}

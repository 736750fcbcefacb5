//! Seeded random number generation.
//!
//! All randomness of a training run (weight initialisation, shuffling, Gibbs
//! sampling, dropout masks) flows through an explicitly seeded [`SeededRng`] so
//! that runs are reproducible.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Seeded generator wrapping `rand`'s `StdRng`.
#[derive(Debug, Clone)]
pub struct SeededRng {
    inner: StdRng,
}

impl SeededRng {
    /// Create a new generator from an explicit seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// Derive an independent generator (used to hand stochastic layers their own stream).
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.gen()
    }

    /// Uniform sample in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.inner.gen::<f32>()
    }

    /// Uniform sample in [low, high); `low` when the range is empty.
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        if low < high {
            self.inner.gen_range(low..high)
        } else {
            low
        }
    }

    /// Normal sample with the given mean and standard deviation.
    pub fn normal(&mut self, mean: f32, std_dev: f32) -> f32 {
        let z: f32 = StandardNormal.sample(&mut self.inner);
        mean + std_dev * z
    }

    /// 1.0 with probability `p`, otherwise 0.0.
    pub fn bernoulli(&mut self, p: f32) -> f32 {
        if self.next_f32() < p {
            1.0
        } else {
            0.0
        }
    }

    /// Shuffle an index slice in place.
    pub fn shuffle_usize(&mut self, data: &mut [usize]) {
        data.shuffle(&mut self.inner);
    }
}

use std::{
    ops::Deref,
    sync::{Mutex, MutexGuard},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RngSeed {
    Default,
    Debug { seed: u64 },
}

pub struct RngStrategy {
    seed: RngSeed,
    rng: Mutex<StdRng>,
}

impl Default for RngStrategy {
    fn default() -> Self {
        RngSeed::Default.into()
    }
}

impl From<RngSeed> for RngStrategy {
    fn from(seed: RngSeed) -> Self {
        let rng = match seed {
            RngSeed::Default => StdRng::from_entropy(),
            RngSeed::Debug { seed } => StdRng::seed_from_u64(seed),
        };
        Self {
            seed,
            rng: Mutex::new(rng),
        }
    }
}

impl Clone for RngStrategy {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            rng: Mutex::new(self.lock().clone()),
        }
    }
}

impl Deref for RngStrategy {
    type Target = dyn RNG;

    fn deref(&self) -> &Self::Target {
        self
    }
}

impl RNG for RngStrategy {
    fn rand(&self) -> NodeValue {
        self.lock().gen()
    }
}

impl RngStrategy {
    pub fn testable(seed: u64) -> Self {
        RngSeed::Debug { seed }.into()
    }

    pub fn seed(&self) -> RngSeed {
        self.seed
    }

    pub fn rand_normal(&self) -> NodeValue {
        self.lock().sample(StandardNormal)
    }

    /// Returns `true` if the rng strategy is seeded with [`Debug`].
    ///
    /// [`Debug`]: RngSeed::Debug
    #[must_use]
    pub fn is_debug(&self) -> bool {
        matches!(self.seed, RngSeed::Debug { .. })
    }

    fn lock(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RngStrategy")
            .field("seed", &self.seed)
            .finish()
    }
}

pub trait RNG {
    fn rand(&self) -> NodeValue;
    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        (self.rand() * (exclusive_max - min) as NodeValue) as usize + min
    }
}

pub trait ShuffleRng {
    fn shuffle_vec<T>(&self, vec: &mut Vec<T>);
}

impl<T: Deref<Target = dyn RNG>> ShuffleRng for T {
    fn shuffle_vec<E>(&self, vec: &mut Vec<E>) {
        let len = vec.len();

        for i in 0..len {
            let j = self.rand_range(i, len);
            vec.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_seed_can_be_serialized() {
        let rng = RngStrategy::testable(1234);
        let json = serde_json::to_string(&rng.seed()).unwrap();
        let seed: RngSeed = serde_json::from_str(dbg!(&json)).unwrap();

        let restored = RngStrategy::from(seed);
        assert!(restored.is_debug());
        assert!(!RngStrategy::default().is_debug());
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let rng_1 = RngStrategy::testable(1234);
        let rng_2 = RngStrategy::testable(1234);

        let samples_1: Vec<_> = (0..8).map(|_| rng_1.rand_range(0, 1000)).collect();
        let samples_2: Vec<_> = (0..8).map(|_| rng_2.rand_range(0, 1000)).collect();

        assert_eq!(samples_1, samples_2);
    }

    #[test]
    fn seeded_rng_can_shuffle() {
        let rng = RngStrategy::testable(6);
        let mut values: Vec<usize> = (0..32).collect();
        rng.shuffle_vec(&mut values);

        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!((0..32).collect::<Vec<_>>(), sorted);
        assert_ne!(sorted, values);
    }

    #[test]
    fn seedable_rng_samples_uniformly() {
        let rng = RngStrategy::testable(6);
        let mut buckets = vec![0; 13];
        let span = 1.0 / buckets.len() as f64;

        let iters = 10_000;
        for _ in 0..iters {
            let rand = rng.rand();
            let bucket_idx = (rand / span) as usize;
            buckets[bucket_idx] += 1;
        }

        let min_expected = iters / (buckets.len() + 1);
        for (i, bucket) in buckets.iter().enumerate() {
            assert!(
                *bucket > min_expected,
                "bucket[{i}] distribution is not even {:?}",
                buckets
            )
        }
    }
}

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;

/// Uniform sampling without replacement, re-rolled on every call.
///
/// The "popular" filter and the trending list have no real popularity
/// signal; both are random selections. Routing them through one injectable
/// sampler lets tests pin the randomness with [`Sampler::seeded`].
pub struct Sampler {
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sampler for tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Pick `k` distinct items (fewer if `items` is shorter), in random order.
    pub fn sample<T: Clone>(&self, items: &[T], k: usize) -> Vec<T> {
        let amount = k.min(items.len());
        if amount == 0 {
            return Vec::new();
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        index::sample(&mut *rng, items.len(), amount)
            .into_iter()
            .map(|i| items[i].clone())
            .collect()
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        items.shuffle(&mut *rng);
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::from_entropy()
    }
}

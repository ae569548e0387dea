//! Injectable randomness.
//!
//! Resource selection and work simulation draw every random value through
//! [`RandomSource`] so tests can script the rolls.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::prelude::*;

/// Source of the random values used by a run.
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `[low, high]`, both inclusive.
    fn range_inclusive(&self, low: u32, high: u32) -> u32;

    /// Uniform permutation of `order` in place.
    fn shuffle(&self, order: &mut [usize]);
}

/// Default source backed by a seedable [`StdRng`].
pub struct ThreadRandom {
    rng: Mutex<StdRng>,
}

impl ThreadRandom {
    /// Create a source seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a source with a fixed seed (reproducible runs).
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for ThreadRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for ThreadRandom {
    fn range_inclusive(&self, low: u32, high: u32) -> u32 {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(low..=high)
    }

    fn shuffle(&self, order: &mut [usize]) {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        order.shuffle(&mut *rng);
    }
}

/// Scripted source: hands out queued values, then a fallback.
///
/// Values outside the requested range are clamped. Shuffles keep the
/// input order so resource selection is predictable.
pub struct ScriptedRandom {
    values: Mutex<VecDeque<u32>>,
    fallback: u32,
}

impl ScriptedRandom {
    /// Create a source that returns `values` in order, then `fallback` forever.
    pub fn new(values: impl IntoIterator<Item = u32>, fallback: u32) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
            fallback,
        }
    }

    /// Source that always returns `value` (clamped per call).
    pub fn constant(value: u32) -> Self {
        Self::new([], value)
    }
}

impl RandomSource for ScriptedRandom {
    fn range_inclusive(&self, low: u32, high: u32) -> u32 {
        let next = self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.fallback);
        next.clamp(low.min(high), high.max(low))
    }

    fn shuffle(&self, _order: &mut [usize]) {}
}

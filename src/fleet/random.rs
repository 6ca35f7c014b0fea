use std::collections::VecDeque;

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Source of randomness for the fleet simulation.
///
/// Every probabilistic decision of the state machine and the scheduler goes through this
/// trait so that tests can replay an exact sequence of draws. Implementations only need to
/// provide uniform draws in `[0, 1)`; the derived helpers map those draws onto the
/// decisions the simulation takes.
pub trait RandomSource {
    /// Next uniform draw in `[0, 1)`.
    fn next_unit(&mut self) -> f64;

    /// Returns true with the given probability.
    fn chance(&mut self, probability: f64) -> bool {
        self.next_unit() < probability
    }

    /// Uniform integer in `low..=high`.
    fn range_inclusive(&mut self, low: u32, high: u32) -> u32 {
        if high <= low {
            return low;
        }
        let span = (high - low + 1) as f64;
        low + ((self.next_unit() * span) as u32).min(high - low)
    }

    /// Uniform index in `0..len`. `len` must be greater than zero.
    fn pick(&mut self, len: usize) -> usize {
        ((self.next_unit() * len as f64) as usize).min(len.saturating_sub(1))
    }
}

/// Production random source backed by a seedable [`StdRng`].
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for SeededRandom {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    fn range_inclusive(&mut self, low: u32, high: u32) -> u32 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..=high)
    }

    fn pick(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.rng.gen_range(0..len)
    }
}

/// Replays a fixed sequence of unit draws, then keeps returning `fallback`.
///
/// The default fallback (0.99) fails every `chance` below 0.99, so an exhausted script
/// leaves devices alone.
#[derive(Clone, Debug)]
pub struct ScriptedRandom {
    draws: VecDeque<f64>,
    fallback: f64,
}

impl ScriptedRandom {
    pub fn new(draws: impl IntoIterator<Item = f64>) -> Self {
        Self {
            draws: draws.into_iter().collect(),
            fallback: 0.99,
        }
    }

    pub fn with_fallback(mut self, fallback: f64) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push(&mut self, draw: f64) {
        self.draws.push_back(draw);
    }

    pub fn remaining(&self) -> usize {
        self.draws.len()
    }
}

impl RandomSource for ScriptedRandom {
    fn next_unit(&mut self) -> f64 {
        self.draws.pop_front().unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_draws_map_onto_decisions() {
        let mut random = ScriptedRandom::new([0.0, 0.5, 0.999, 0.25]);

        assert!(random.chance(0.1));
        assert_eq!(random.range_inclusive(0, 2), 1);
        assert_eq!(random.range_inclusive(5, 20), 20);
        assert_eq!(random.pick(4), 1);
        assert_eq!(random.remaining(), 0);

        // exhausted script falls back to "nothing happens"
        assert!(!random.chance(0.5));
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let mut first = SeededRandom::new(42);
        let mut second = SeededRandom::new(42);
        for _ in 0..32 {
            assert_eq!(first.range_inclusive(0, 100), second.range_inclusive(0, 100));
            assert_eq!(first.pick(5), second.pick(5));
        }
    }

    #[test]
    fn test_degenerate_ranges() {
        let mut random = SeededRandom::new(7);
        assert_eq!(random.range_inclusive(3, 3), 3);
        assert_eq!(random.range_inclusive(4, 2), 4);
        assert_eq!(random.pick(0), 0);
    }
}

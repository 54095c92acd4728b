//! Injectable randomness for scenario selection, pacing and order numbers

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Source of uniform samples owned by a single virtual user
pub trait RandomSource: Send {
    /// Uniform sample in `[0, 1)`
    fn next_f64(&mut self) -> f64;

    /// Uniform index in `0..len`. `len` must be non-zero.
    fn next_index(&mut self, len: usize) -> usize {
        let index = (self.next_f64() * len as f64) as usize;
        index.min(len.saturating_sub(1))
    }

    /// Uniform duration in `[min, max]`
    fn next_duration(&mut self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        min + (max - min).mul_f64(self.next_f64())
    }

    /// `len` lowercase base-36 characters
    fn alphanumeric(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| BASE36[self.next_index(BASE36.len())] as char)
            .collect()
    }
}

/// Hands each virtual user its own random source
pub trait RandomSourceFactory: Send + Sync {
    fn for_user(&self, user_id: u64) -> Box<dyn RandomSource>;
}

/// `StdRng`-backed source
pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for StdRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// Entropy-seeded sources, or reproducible per-user streams when seeded
#[derive(Debug, Clone, Copy, Default)]
pub struct StdRandomFactory {
    seed: Option<u64>,
}

impl StdRandomFactory {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }
}

impl RandomSourceFactory for StdRandomFactory {
    fn for_user(&self, user_id: u64) -> Box<dyn RandomSource> {
        match self.seed {
            // Golden-ratio stride keeps neighbouring user streams apart
            Some(seed) => Box::new(StdRandom::seeded(
                seed ^ user_id.wrapping_mul(0x9E37_79B9_7F4A_7C15),
            )),
            None => Box::new(StdRandom::from_entropy()),
        }
    }
}

/// Replays a fixed cycle of samples
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    values: Vec<f64>,
    position: usize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "sequence must not be empty");
        Self {
            values,
            position: 0,
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&mut self) -> f64 {
        let value = self.values[self.position % self.values.len()];
        self.position += 1;
        value
    }
}

/// Every user replays the same sequence
#[derive(Debug, Clone)]
pub struct SequenceRandomFactory {
    values: Vec<f64>,
}

impl SequenceRandomFactory {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl RandomSourceFactory for SequenceRandomFactory {
    fn for_user(&self, _user_id: u64) -> Box<dyn RandomSource> {
        Box::new(SequenceRandom::new(self.values.clone()))
    }
}

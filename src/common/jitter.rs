use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random factor applied to backoff delays.
pub trait JitterSource: Send + Sync {
    /// Returns a value in `[low, high)`, or `low` when the range is empty.
    fn sample(&self, low: f64, high: f64) -> f64;
}

pub struct RandomJitter {
    rng: Mutex<StdRng>,
}

impl RandomJitter {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic sequence, for reproducible tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterSource for RandomJitter {
    fn sample(&self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.lock().random_range(low..high)
    }
}

/// Always returns the same factor, clamped into the requested range.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.0.clamp(low, high)
    }
}

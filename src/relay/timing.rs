//! Randomized durations for relay timers.
//!
//! Fluff delays use a Poisson distribution counted in quarter seconds.
//! Whole-second quanta collapse the variance (95% of a 5 s mean falls on
//! 1..9 s in whole steps); millisecond quanta leave almost none
//! (4859..5141 ms). Twenty quarter-second steps put 95% of draws between
//! 3 s and 7.25 s, which is the intended spread.

use rand::Rng;
use rand_distr::{Distribution, Poisson};
use std::time::Duration;

const QUARTER_SECOND: Duration = Duration::from_millis(250);

/// Poisson-distributed durations in quarter-second quanta
#[derive(Debug, Clone)]
pub struct PoissonQuarters {
    dist: Option<Poisson<f64>>,
}

impl PoissonQuarters {
    /// `average` becomes the distribution mean, rounded to quarters
    pub fn new(average: Duration) -> Self {
        let quarters = average.as_secs_f64() * 4.0;
        Self {
            dist: Poisson::new(quarters).ok(),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match &self.dist {
            Some(dist) => QUARTER_SECOND * dist.sample(rng) as u32,
            None => Duration::ZERO,
        }
    }
}

/// Uniform duration in `[0, range]`
pub fn random_duration<R: Rng + ?Sized>(rng: &mut R, range: Duration) -> Duration {
    if range.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(0..=range.as_nanos() as u64))
}

/// Epoch length: `min + uniform[0, range]`
pub fn epoch_duration<R: Rng + ?Sized>(rng: &mut R, min: Duration, range: Duration) -> Duration {
    min + random_duration(rng, range)
}

//! Token bucket byte-rate throttling for the global up/down links

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket with fractional tokens refilled on access.
///
/// Tokens may go negative: traffic is never dropped, only delayed. A
/// negative balance converts into the sleep needed to drain the debt.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    fn consume(&mut self, tokens: f64) {
        self.refill();
        self.tokens -= tokens;
    }

    /// Delay required before the balance is non-negative again
    fn deficit_sleep(&self) -> Duration {
        if self.tokens >= 0.0 || self.rate_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.rate_per_sec)
    }
}

/// One direction of the global throttle. Thread-safe; a limit of zero or
/// below disables it.
pub struct Throttle {
    bucket: Mutex<Option<TokenBucket>>,
}

impl Throttle {
    pub fn new(limit_bytes_per_sec: i64) -> Self {
        Self {
            bucket: Mutex::new(Self::make_bucket(limit_bytes_per_sec)),
        }
    }

    fn make_bucket(limit: i64) -> Option<TokenBucket> {
        if limit <= 0 {
            return None;
        }
        // allow a one-second burst at the configured rate
        Some(TokenBucket::new(limit as f64, limit as f64))
    }

    pub fn set_limit(&self, limit_bytes_per_sec: i64) {
        *self.bucket.lock().unwrap() = Self::make_bucket(limit_bytes_per_sec);
    }

    pub fn enabled(&self) -> bool {
        self.bucket.lock().unwrap().is_some()
    }

    /// Account for `bytes` about to be sent (or just received) and return
    /// how long the caller should sleep to keep the average at the limit.
    pub fn compute_sleep(&self, bytes: usize) -> Duration {
        let mut guard = self.bucket.lock().unwrap();
        match guard.as_mut() {
            Some(bucket) => {
                bucket.consume(bytes as f64);
                bucket.deficit_sleep()
            }
            None => Duration::ZERO,
        }
    }
}

/// Process-wide pair of throttles shared by every connection pump
pub struct RateLimits {
    pub up: Throttle,
    pub down: Throttle,
}

impl RateLimits {
    pub fn new(rate_up: i64, rate_down: i64) -> Self {
        Self {
            up: Throttle::new(rate_up),
            down: Throttle::new(rate_down),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }
}

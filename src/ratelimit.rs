//! Token-bucket rate limiter (spec.md §4.3, component C3). One instance
//! per configured rate-limit rule; the rule matcher in `rules` selects
//! which instance a query is checked against.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// `rate` tokens/second, capped at `burst`. `tokens`/`last_refill` are
/// mutated under a mutex rather than lock-free atomics: refill requires a
/// read-modify-write of two fields together, and contention here is far
/// lighter than on the packet cache's hot path.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
    passed: AtomicU64,
    blocked: AtomicU64,
}

struct BucketState {
    tokens: f64,
    last_refill: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        RateLimiter {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: 0.0,
            }),
            passed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Refills the bucket for the elapsed time since the last check, then
    /// admits or blocks the query. `now` is a fractional-seconds clock so
    /// sub-second rates refill smoothly.
    pub fn check(&self, now: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        let elapsed = (now - state.last_refill).max(0.0);
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.passed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    /// The configured rate, in tokens/second -- the limiter's `qlim`.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_burst_then_blocks() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.check(0.0));
        assert!(limiter.check(0.0));
        assert!(limiter.check(0.0));
        assert!(!limiter.check(0.0));
        assert_eq!(limiter.passed(), 3);
        assert_eq!(limiter.blocked(), 1);
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(2.0, 1.0);
        assert!(limiter.check(0.0));
        assert!(!limiter.check(0.1));
        assert!(limiter.check(1.0));
    }
}

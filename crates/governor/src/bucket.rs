//! A single token bucket (§4.2).

use racetype_common::config::RateClassConfig;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
    last_touch: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_ms: u64,
}

impl TokenBucket {
    pub fn new(cfg: RateClassConfig, now: Instant) -> Self {
        Self {
            capacity: cfg.capacity as f64,
            refill_rate_per_ms: cfg.refill_tokens as f64 / cfg.refill_interval_ms as f64,
            tokens: cfg.capacity as f64,
            last_refill: now,
            last_touch: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as f64;
        if elapsed_ms <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed_ms * self.refill_rate_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempt to take one token. Returns whether it was allowed, the
    /// tokens remaining afterward, and (when denied) a retry-after
    /// estimate for the time until one token will be available.
    pub fn check(&mut self, now: Instant) -> CheckResult {
        self.refill(now);
        self.last_touch = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            CheckResult {
                allowed: true,
                remaining: self.tokens.floor() as u32,
                retry_after_ms: 0,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after_ms = (deficit / self.refill_rate_per_ms).ceil().max(1.0) as u64;
            CheckResult {
                allowed: false,
                remaining: 0,
                retry_after_ms,
            }
        }
    }

    pub fn idle_for(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_touch) >= ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(capacity: u32, refill_tokens: u32, refill_interval_ms: u64) -> RateClassConfig {
        RateClassConfig::new(capacity, refill_tokens, refill_interval_ms)
    }

    #[test]
    fn exhausts_capacity_then_denies() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(cfg(3, 1, 1_000), now);
        assert!(bucket.check(now).allowed);
        assert!(bucket.check(now).allowed);
        assert!(bucket.check(now).allowed);
        let denied = bucket.check(now);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[test]
    fn refills_over_time() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(cfg(1, 1, 1_000), now);
        assert!(bucket.check(now).allowed);
        assert!(!bucket.check(now).allowed);
        let later = now + Duration::from_millis(1_000);
        assert!(bucket.check(later).allowed);
    }

    #[test]
    fn keystroke_class_allows_exactly_twenty_per_second() {
        // §8: "across any 1-second window per identity, accepted
        // test:keystroke events <= 20".
        let now = Instant::now();
        let mut bucket = TokenBucket::new(cfg(20, 20, 1_000), now);
        let allowed = (0..25).filter(|_| bucket.check(now).allowed).count();
        assert_eq!(allowed, 20);
    }
}

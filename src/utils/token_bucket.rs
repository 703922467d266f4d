//! Token-bucket rate limiter for upload bandwidth.
//!
//! Tokens refill lazily from elapsed monotonic time at `fill_rate` per
//! second, capped at `capacity`. The chunked uploader consumes tokens
//! proportional to the bytes it is about to send.

use crate::time::Clock;
use std::sync::Arc;
use std::time::Duration;

pub struct TokenBucket {
    clock: Arc<dyn Clock>,
    capacity: f64,
    fill_rate: f64,
    tokens: f64,
    timestamp: Duration,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(clock: Arc<dyn Clock>, capacity: f64, fill_rate: f64) -> Self {
        let timestamp = clock.monotonic();
        Self {
            clock,
            capacity,
            fill_rate,
            tokens: capacity,
            timestamp,
        }
    }

    pub fn with_initial_tokens(
        clock: Arc<dyn Clock>,
        capacity: f64,
        fill_rate: f64,
        initial: f64,
    ) -> Self {
        let timestamp = clock.monotonic();
        Self {
            clock,
            capacity,
            fill_rate,
            tokens: initial,
            timestamp,
        }
    }

    /// Take `tokens` if available right now. Requests larger than capacity
    /// can never succeed.
    pub fn consume(&mut self, tokens: f64) -> bool {
        if tokens < 0.0 {
            return false;
        }
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            return true;
        }
        false
    }

    /// Wait until at least `min` tokens are available, then take and return
    /// up to `max` of whatever has accumulated.
    pub async fn consume_with_wait(&mut self, min: f64, max: f64) -> f64 {
        self.refill();
        if self.tokens >= max {
            self.tokens -= max;
            return max;
        }
        if self.tokens >= min {
            let granted = self.tokens;
            self.tokens = 0.0;
            return granted;
        }

        // A bucket that never refills can't satisfy `min`; hand over what's
        // left instead of waiting forever.
        if self.fill_rate <= 0.0 {
            let granted = self.tokens;
            self.tokens = 0.0;
            return granted;
        }

        // Sleep exactly long enough for the shortfall to refill.
        let shortfall = min - self.tokens;
        let wait = Duration::from_secs_f64(shortfall / self.fill_rate);
        self.clock.sleep(wait).await;
        self.tokens = 0.0;
        self.timestamp = self.clock.monotonic();
        min
    }

    fn refill(&mut self) {
        let now = self.clock.monotonic();
        if self.tokens < self.capacity {
            let elapsed = now.saturating_sub(self.timestamp).as_secs_f64();
            self.tokens = (self.tokens + self.fill_rate * elapsed).min(self.capacity);
        }
        self.timestamp = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::FakeClock;
    use chrono::Utc;
    use chrono_tz::Tz;

    fn clock() -> Arc<FakeClock> {
        Arc::new(FakeClock::new(Utc::now(), Tz::UTC))
    }

    #[test]
    fn test_consume_within_capacity() {
        let clock = clock();
        let mut bucket = TokenBucket::new(clock.clone(), 100.0, 10.0);
        assert!(bucket.consume(60.0));
        assert!(bucket.consume(40.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn test_oversized_request_never_succeeds() {
        let clock = clock();
        let mut bucket = TokenBucket::new(clock.clone(), 100.0, 10.0);
        // Even after a very long idle period the bucket caps at capacity.
        clock.advance(Duration::from_secs(1_000_000));
        assert!(!bucket.consume(101.0));
        assert!(bucket.consume(100.0));
    }

    #[test]
    fn test_lazy_refill() {
        let clock = clock();
        let mut bucket = TokenBucket::with_initial_tokens(clock.clone(), 100.0, 10.0, 0.0);
        assert!(!bucket.consume(50.0));
        clock.advance(Duration::from_secs(5));
        assert!(bucket.consume(50.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn test_negative_request_rejected() {
        let clock = clock();
        let mut bucket = TokenBucket::new(clock.clone(), 100.0, 10.0);
        assert!(!bucket.consume(-1.0));
    }

    #[tokio::test]
    async fn test_consume_with_wait_grants_available() {
        let clock = clock();
        let mut bucket = TokenBucket::new(clock.clone(), 100.0, 10.0);
        // Everything available: full max granted.
        assert_eq!(bucket.consume_with_wait(10.0, 50.0).await, 50.0);
        // Less than max but more than min: grant what's there.
        assert_eq!(bucket.consume_with_wait(10.0, 100.0).await, 50.0);
    }

    #[tokio::test]
    async fn test_consume_with_wait_suspends_for_min() {
        let clock = clock();
        let mut bucket = TokenBucket::with_initial_tokens(clock.clone(), 100.0, 10.0, 0.0);
        let before = clock.monotonic();
        let granted = bucket.consume_with_wait(20.0, 80.0).await;
        assert_eq!(granted, 20.0);
        // The fake clock advanced by the 2s the refill needed.
        assert_eq!(clock.monotonic() - before, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_zero_fill_rate_never_suspends() {
        let clock = clock();
        let mut bucket = TokenBucket::with_initial_tokens(clock.clone(), 40.0, 0.0, 5.0);
        let before = clock.monotonic();
        // A dead bucket grants what's left and then zero, without sleeping.
        assert_eq!(bucket.consume_with_wait(10.0, 40.0).await, 5.0);
        assert_eq!(bucket.consume_with_wait(1.0, 40.0).await, 0.0);
        assert_eq!(clock.monotonic(), before);
    }

    #[tokio::test]
    async fn test_sustained_throughput_bounded_by_fill_rate() {
        let clock = clock();
        let mut bucket = TokenBucket::with_initial_tokens(clock.clone(), 100.0, 10.0, 0.0);
        let mut granted = 0.0;
        for _ in 0..50 {
            granted += bucket.consume_with_wait(25.0, 25.0).await;
        }
        let elapsed = clock.monotonic().as_secs_f64();
        // Within rounding, average throughput never beats the fill rate.
        assert!(granted / elapsed <= 10.0 + 1e-6);
    }
}

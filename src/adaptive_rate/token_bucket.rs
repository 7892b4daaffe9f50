use std::time::{Duration, Instant};

use super::MIN_REFILL_RATE;

/// Continuous-accounting token bucket.
///
/// Tokens accrue at `rate` per second up to `burst`, with fractional accounting so
/// that high rates and mid-flight rate changes stay exact. The bucket starts full.
/// Callers pass `now` explicitly; the bucket never reads the clock itself.
#[derive(Clone, Debug)]
pub(crate) struct TokenBucket {
    rate: f64,
    burst: usize,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate: f64, burst: usize, now: Instant) -> Self {
        let burst = burst.max(1);
        Self {
            rate: clamp_rate(rate),
            burst,
            tokens: burst as f64,
            last_refill: now,
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn burst(&self) -> usize {
        self.burst
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let capacity = self.burst as f64;
        self.tokens = if self.rate.is_infinite() {
            capacity
        } else {
            (self.tokens + elapsed * self.rate).min(capacity)
        };
    }

    /// Takes one token, or returns how long until one will be available.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.rate.is_infinite() || self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }
        Err(self.time_to_next_token())
    }

    // Rounded up to whole nanoseconds so a waiter always wakes with the token available.
    fn time_to_next_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        let nanos = (missing / self.rate * 1e9).ceil();
        if nanos >= u64::MAX as f64 {
            Duration::MAX
        } else {
            Duration::from_nanos((nanos as u64).max(1))
        }
    }

    /// Replaces the refill rate. Tokens accrued so far are kept.
    pub(crate) fn set_rate(&mut self, now: Instant, rate: f64) {
        self.refill(now);
        self.rate = clamp_rate(rate);
    }

    pub(crate) fn set_burst(&mut self, now: Instant, burst: usize) {
        self.refill(now);
        self.burst = burst.max(1);
        self.tokens = self.tokens.min(self.burst as f64);
    }
}

pub(crate) fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() || rate < MIN_REFILL_RATE {
        MIN_REFILL_RATE
    } else {
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let delta = actual.as_secs_f64() - expected.as_secs_f64();
        assert!(delta.abs() < 1e-6, "expected {expected:?}, got {actual:?}");
    }

    #[test]
    fn starts_full_and_drains() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 3, start);

        for _ in 0..3 {
            assert!(bucket.try_acquire(start).is_ok());
        }
        let wait = bucket.try_acquire(start).unwrap_err();
        assert_close(wait, ms(100));
    }

    #[test]
    fn refills_fractionally() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(4.0, 1, start);
        assert!(bucket.try_acquire(start).is_ok());

        let wait = bucket.try_acquire(start + ms(100)).unwrap_err();
        assert_close(wait, ms(150));
        assert!((bucket.tokens() - 0.4).abs() < 1e-9);

        assert!(bucket.try_acquire(start + ms(260)).is_ok());
    }

    #[test]
    fn waiting_the_reported_duration_yields_a_token() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3.0, 1, start);
        assert!(bucket.try_acquire(start).is_ok());

        let mut now = start + ms(17);
        let wait = bucket.try_acquire(now).unwrap_err();
        now += wait;
        assert!(bucket.try_acquire(now).is_ok());
    }

    #[test]
    fn never_exceeds_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 2, start);
        let later = start + Duration::from_secs(60);

        assert!(bucket.try_acquire(later).is_ok());
        assert!(bucket.try_acquire(later).is_ok());
        assert!(bucket.try_acquire(later).is_err());
    }

    #[test]
    fn rate_change_keeps_accrued_tokens() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 1, start);
        assert!(bucket.try_acquire(start).is_ok());

        // Half a token accrues at the old rate, the rest at the new one.
        bucket.set_rate(start + ms(250), 1.0);
        let wait = bucket.try_acquire(start + ms(250)).unwrap_err();
        assert_close(wait, ms(500));
    }

    #[test]
    fn shrinking_burst_drops_excess_tokens() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 5, start);
        bucket.set_burst(start, 2);
        assert_eq!(bucket.burst(), 2);
        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_err());

        bucket.set_burst(start, 0);
        assert_eq!(bucket.burst(), 1);
    }

    #[test]
    fn infinite_rate_never_waits() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(f64::INFINITY, 1, start);
        for _ in 0..1_000 {
            assert!(bucket.try_acquire(start).is_ok());
        }
    }

    #[test]
    fn rate_is_clamped_above_floor() {
        assert_eq!(clamp_rate(0.0), MIN_REFILL_RATE);
        assert_eq!(clamp_rate(-1.0), MIN_REFILL_RATE);
        assert_eq!(clamp_rate(f64::NAN), MIN_REFILL_RATE);
        assert_eq!(clamp_rate(0.5), 0.5);

        let start = Instant::now();
        let mut bucket = TokenBucket::new(0.0, 1, start);
        assert!(bucket.try_acquire(start).is_ok());
        let wait = bucket.try_acquire(start).unwrap_err();
        assert!(wait > Duration::from_secs(1_000_000));
    }
}

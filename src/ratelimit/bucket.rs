//! Token bucket.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. It starts full. Refill is computed lazily
//! on every access from the time elapsed since the last refill.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64) {
        // A `now` earlier than the last refill (callers passing stale instants)
        // adds nothing rather than draining the bucket.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
            self.last_refill = now;
        }
    }
}

/// Continuously refilling token bucket.
///
/// Every operation is atomic with respect to the bucket's own state.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        state.refill(now, f64::from(self.capacity), self.refill_rate);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Return one token taken by a request that was later rejected elsewhere.
    /// Never raises the level above capacity.
    pub fn credit(&self) {
        self.credit_at(Instant::now());
    }

    pub fn credit_at(&self, now: Instant) {
        let mut state = self.lock();
        let capacity = f64::from(self.capacity);
        state.refill(now, capacity, self.refill_rate);
        state.tokens = (state.tokens + 1.0).min(capacity);
    }

    /// Current token level after refill.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        state.refill(now, f64::from(self.capacity), self.refill_rate);
        state.tokens
    }

    /// Refill to capacity.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = f64::from(self.capacity);
        state.last_refill = Instant::now();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_starts_full_and_drains() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(10, 1.0, t0);

        for _ in 0..10 {
            assert!(bucket.try_acquire_at(t0));
        }
        assert!(!bucket.try_acquire_at(t0));

        let later = t0 + Duration::from_secs(5);
        for _ in 0..5 {
            assert!(bucket.try_acquire_at(later));
        }
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(3, 10.0, t0);
        assert!(bucket.try_acquire_at(t0));
        assert_eq!(bucket.tokens_at(t0 + Duration::from_secs(60)), 3.0);
    }

    #[test]
    fn test_credit_restores_and_caps() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(2, 0.0, t0);
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.try_acquire_at(t0));

        bucket.credit_at(t0);
        assert!(bucket.try_acquire_at(t0));

        bucket.credit_at(t0);
        bucket.credit_at(t0);
        bucket.credit_at(t0);
        assert_eq!(bucket.tokens_at(t0), 2.0);
    }

    #[test]
    fn test_stale_instant_does_not_drain() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(1);
        let bucket = TokenBucket::new_at(5, 1.0, later);
        assert_eq!(bucket.tokens_at(t0), 5.0);
        assert!(bucket.try_acquire_at(t0));
    }

    #[test]
    fn test_reset_refills() {
        let bucket = TokenBucket::new(4, 0.0);
        while bucket.try_acquire() {}
        bucket.reset();
        assert_eq!(bucket.tokens(), 4.0);
    }

    proptest! {
        #[test]
        fn prop_level_stays_within_bounds(
            capacity in 1u32..50,
            rate in 0.0f64..20.0,
            ops in proptest::collection::vec((0u8..3, 0u64..2_000), 1..200),
        ) {
            let t0 = Instant::now();
            let bucket = TokenBucket::new_at(capacity, rate, t0);
            let mut now = t0;
            for (op, step_ms) in ops {
                now += Duration::from_millis(step_ms);
                match op {
                    0 => { bucket.try_acquire_at(now); }
                    1 => bucket.credit_at(now),
                    _ => {}
                }
                let level = bucket.tokens_at(now);
                prop_assert!(level >= 0.0);
                prop_assert!(level <= f64::from(capacity));
            }
        }

        #[test]
        fn prop_admissions_bounded_by_capacity_plus_refill(
            capacity in 1u32..30,
            rate in 0.1f64..10.0,
            window_ms in 0u64..10_000,
        ) {
            let t0 = Instant::now();
            let bucket = TokenBucket::new_at(capacity, rate, t0);
            let end = t0 + Duration::from_millis(window_ms);
            let mut admitted = 0u64;
            let mut now = t0;
            while now <= end {
                while bucket.try_acquire_at(now) {
                    admitted += 1;
                }
                now += Duration::from_millis(50);
            }
            let bound = f64::from(capacity) + rate * (window_ms as f64 / 1000.0);
            prop_assert!(admitted as f64 <= (bound + 1e-6).floor());
        }
    }
}

//! Per-client token bucket rate limiting.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::RateLimitConfig;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("rate must be positive, got {0}")]
    InvalidRate(f64),

    #[error("burst must be at least 1, got {0}")]
    InvalidBurst(f64),
}

/// A simple token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64, max_elapsed: Duration) {
        let elapsed = now
            .saturating_duration_since(self.last_update)
            .min(max_elapsed)
            .as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        if now > self.last_update {
            self.last_update = now;
        }
    }

    fn try_acquire(&mut self, now: Instant, capacity: f64, refill_rate: f64, max_elapsed: Duration) -> bool {
        self.refill(now, capacity, refill_rate, max_elapsed);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct LimiterState<K> {
    buckets: HashMap<K, TokenBucket>,
    last_cleanup: Instant,
}

/// Token bucket limiter keyed by client (IP address by default).
///
/// Tokens refill continuously at `rate` per second up to `burst`. Each
/// admitted request costs one token. State is per worker process.
pub struct RateLimiter<K = IpAddr> {
    state: Mutex<LimiterState<K>>,
    rate: f64,
    burst: f64,
    max_entries: usize,
    cleanup_interval: Duration,
    idle_after: Duration,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    pub fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::with_params(
            config.rate,
            config.burst,
            config.max_entries,
            Duration::from_secs(config.cleanup_interval_secs),
        )
    }

    pub fn with_params(
        rate: f64,
        burst: f64,
        max_entries: usize,
        cleanup_interval: Duration,
    ) -> Result<Self, RateLimitError> {
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(RateLimitError::InvalidRate(rate));
        }
        if !(burst >= 1.0) || !burst.is_finite() {
            return Err(RateLimitError::InvalidBurst(burst));
        }

        Ok(Self {
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            rate,
            burst,
            max_entries: max_entries.max(1),
            cleanup_interval,
            idle_after: Duration::try_from_secs_f64(3.0 * burst / rate).unwrap_or(Duration::MAX),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Charge one token for `key`. Returns false when the client is over its limit.
    pub fn check(&self, key: &K) -> bool {
        self.check_at(key, Instant::now())
    }

    /// Like [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, key: &K, now: Instant) -> bool {
        let mut state = self.lock();

        if now.saturating_duration_since(state.last_cleanup) >= self.cleanup_interval {
            let removed = self.remove_idle(&mut state.buckets, now);
            state.last_cleanup = now;
            if removed > 0 {
                tracing::debug!(removed, remaining = state.buckets.len(), "Rate limiter cleanup");
            }
        }

        if !state.buckets.contains_key(key) && state.buckets.len() >= self.max_entries {
            self.make_room(&mut state.buckets, now);
        }

        let (rate, burst, max_elapsed) = (self.rate, self.burst, self.cleanup_interval);
        state
            .buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(burst, now))
            .try_acquire(now, burst, rate, max_elapsed)
    }

    /// Tokens currently held by `key`, without refilling. None if untracked.
    pub fn tokens(&self, key: &K) -> Option<f64> {
        self.lock().buckets.get(key).map(|b| b.tokens)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_idle(&self, buckets: &mut HashMap<K, TokenBucket>, now: Instant) -> usize {
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_update) < self.idle_after);
        before - buckets.len()
    }

    fn make_room(&self, buckets: &mut HashMap<K, TokenBucket>, now: Instant) {
        if self.remove_idle(buckets, now) > 0 {
            return;
        }
        let oldest = buckets
            .iter()
            .min_by_key(|(_, b)| b.last_update)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            buckets.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: f64, max_entries: usize) -> RateLimiter<u32> {
        RateLimiter::with_params(rate, burst, max_entries, Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = limiter(10.0, 50.0, 100);
        let start = Instant::now();

        let admitted = (0..60).filter(|_| limiter.check_at(&1, start)).count();
        assert_eq!(admitted, 50);

        let later = start + Duration::from_secs(1);
        let admitted = (0..20).filter(|_| limiter.check_at(&1, later)).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_tokens_stay_in_range() {
        let limiter = limiter(10.0, 5.0, 100);
        let start = Instant::now();
        assert!(limiter.check_at(&1, start));
        assert_eq!(limiter.tokens(&1), Some(4.0));

        // A long pause never overfills the bucket.
        assert!(limiter.check_at(&1, start + Duration::from_secs(600)));
        assert_eq!(limiter.tokens(&1), Some(4.0));

        for _ in 0..10 {
            limiter.check_at(&1, start + Duration::from_secs(600));
        }
        assert_eq!(limiter.tokens(&1), Some(0.0));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1.0, 2.0, 100);
        let now = Instant::now();
        assert!(limiter.check_at(&1, now));
        assert!(limiter.check_at(&1, now));
        assert!(!limiter.check_at(&1, now));
        assert!(limiter.check_at(&2, now));
    }

    #[test]
    fn test_clock_going_backwards() {
        let limiter = limiter(10.0, 1.0, 100);
        let now = Instant::now() + Duration::from_secs(5);
        assert!(limiter.check_at(&1, now));
        assert!(!limiter.check_at(&1, now - Duration::from_secs(1)));
        assert_eq!(limiter.tokens(&1), Some(0.0));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert_eq!(
            RateLimiter::<u32>::with_params(0.0, 10.0, 10, Duration::from_secs(1)).err(),
            Some(RateLimitError::InvalidRate(0.0))
        );
        assert_eq!(
            RateLimiter::<u32>::with_params(1.0, 0.5, 10, Duration::from_secs(1)).err(),
            Some(RateLimitError::InvalidBurst(0.5))
        );
    }

    #[test]
    fn test_full_table_evicts_idle_first() {
        // Idle after 3 * 2 / 1 = 6 seconds.
        let limiter = limiter(1.0, 2.0, 2);
        let start = Instant::now();
        limiter.check_at(&1, start);
        limiter.check_at(&2, start + Duration::from_secs(5));

        limiter.check_at(&3, start + Duration::from_secs(7));
        assert_eq!(limiter.len(), 2);
        assert!(limiter.tokens(&1).is_none());
        assert!(limiter.tokens(&2).is_some());
    }

    #[test]
    fn test_full_table_evicts_least_recent() {
        let limiter = limiter(1.0, 100.0, 2);
        let start = Instant::now();
        limiter.check_at(&1, start);
        limiter.check_at(&2, start + Duration::from_millis(10));
        limiter.check_at(&1, start + Duration::from_millis(20));

        limiter.check_at(&3, start + Duration::from_millis(30));
        assert!(limiter.tokens(&2).is_none());
        assert!(limiter.tokens(&1).is_some());
        assert!(limiter.tokens(&3).is_some());
    }

    #[test]
    fn test_periodic_cleanup() {
        let limiter =
            RateLimiter::<u32>::with_params(100.0, 1.0, 100, Duration::from_secs(1)).unwrap();
        let start = Instant::now();
        limiter.check_at(&1, start);
        limiter.check_at(&2, start + Duration::from_secs(2));
        assert_eq!(limiter.len(), 1);
    }
}

//! Provides backoff timing control for requeueing failed reconciliations.
//!
//! Two limiters are combined: a global token bucket shared by every key and
//! a per-key exponential backoff. The scheduler waits for the longer of the
//! two.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::object::ObjectKey;

/// Immutable settings of the composite limiter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Size of the global token bucket.
    pub burst: u32,
    /// Sustained global requeues per second. Zero disables the bucket.
    pub frequency: u32,
    /// First per-key delay after a failure.
    pub base_delay: Duration,
    /// Upper bound of the per-key delay.
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst: 200,
            frequency: 30,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1000),
        }
    }
}

/// Result of a reconciliation as seen by the limiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The key converged; its failure history is dropped.
    Success,
    /// The key failed and must be retried later.
    Failure,
}

/// Paces retries of failing keys.
pub trait RateLimiter: Send + Sync {
    /// How long to wait before processing `key` again. Counts as a failure.
    fn when(&self, key: &ObjectKey) -> Duration;
    /// Drop any failure history for `key`.
    fn forget(&self, key: &ObjectKey);
    /// Number of failures recorded for `key` since it was last forgotten.
    fn retries(&self, key: &ObjectKey) -> u32;

    /// Delay for `key` after a pass with the given outcome. Successful keys
    /// are forgotten and need no delay from the limiter.
    fn next_delay(&self, key: &ObjectKey, outcome: Outcome) -> Duration {
        match outcome {
            Outcome::Success => {
                self.forget(key);
                Duration::ZERO
            }
            Outcome::Failure => self.when(key),
        }
    }
}

#[derive(Default)]
struct KeyBackoff {
    last: Duration,
    failures: u32,
}

impl KeyBackoff {
    /// `base` on the first failure, then doubling until `cap`.
    fn next_duration(&mut self, base: Duration, cap: Duration) -> Duration {
        let next = if self.last.is_zero() {
            base
        } else {
            self.last.saturating_mul(2)
        };
        self.last = next.min(cap);
        self.failures = self.failures.saturating_add(1);
        self.last
    }
}

/// Per-key exponential backoff: `base_delay` doubling up to `max_delay`.
pub struct ItemExponentialFailureRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    keys: Mutex<HashMap<ObjectKey, KeyBackoff>>,
}

impl ItemExponentialFailureRateLimiter {
    /// Create a limiter with the given bounds.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.entry(key.clone())
            .or_default()
            .next_duration(self.base_delay, self.max_delay)
    }

    fn forget(&self, key: &ObjectKey) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(key);
    }

    fn retries(&self, key: &ObjectKey) -> u32 {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(key).map(|k| k.failures).unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Global token bucket shared by all keys.
///
/// Every call to `when` reserves one token. When the bucket is empty the
/// reservation still succeeds, and the returned delay is the time until the
/// bucket refills enough to cover it.
pub struct BucketRateLimiter {
    burst: f64,
    frequency: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// A bucket of `burst` tokens refilled at `frequency` tokens per second.
    pub fn new(frequency: u32, burst: u32) -> Self {
        Self {
            burst: f64::from(burst),
            frequency: f64::from(frequency),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    fn reserve_at(&self, now: Instant) -> Duration {
        if self.frequency <= 0.0 {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.frequency).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.frequency)
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ObjectKey) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn retries(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

/// Waits for the slowest of its limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    /// Combine `limiters`.
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }

    /// The global bucket combined with per-key exponential backoff.
    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                config.base_delay,
                config.max_delay,
            )),
            Box::new(BucketRateLimiter::new(config.frequency, config.burst)),
        ])
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &ObjectKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn retries(&self, key: &ObjectKey) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.retries(key))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_secs(10), Duration::from_secs(300));
        let delays: Vec<u64> = (0..7).map(|_| limiter.when(&key("a")).as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(limiter.retries(&key("a")), 7);
    }

    #[test]
    fn key_backoff_starts_at_base() {
        let mut backoff = KeyBackoff::default();
        assert_eq!(
            backoff.next_duration(Duration::from_millis(5), Duration::from_secs(1)),
            Duration::from_millis(5)
        );
        assert_eq!(backoff.failures, 1);
    }

    #[test]
    fn per_key_backoff_is_independent() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(limiter.when(&key("a")), Duration::from_millis(5));
        assert_eq!(limiter.when(&key("a")), Duration::from_millis(10));
        assert_eq!(limiter.when(&key("b")), Duration::from_millis(5));
        assert_eq!(limiter.retries(&key("a")), 2);
        assert_eq!(limiter.retries(&key("b")), 1);
    }

    #[test]
    fn forget_resets_backoff() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        limiter.when(&key("a"));
        limiter.when(&key("a"));
        assert_eq!(limiter.next_delay(&key("a"), Outcome::Success), Duration::ZERO);
        assert_eq!(limiter.retries(&key("a")), 0);
        assert_eq!(
            limiter.next_delay(&key("a"), Outcome::Failure),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn bucket_allows_burst_then_paces() {
        let limiter = BucketRateLimiter::new(10, 2);
        let now = Instant::now();
        assert_eq!(limiter.reserve_at(now), Duration::ZERO);
        assert_eq!(limiter.reserve_at(now), Duration::ZERO);
        assert_eq!(limiter.reserve_at(now), Duration::from_millis(100));
        assert_eq!(limiter.reserve_at(now), Duration::from_millis(200));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = BucketRateLimiter::new(10, 1);
        let now = Instant::now();
        assert_eq!(limiter.reserve_at(now), Duration::ZERO);
        assert_eq!(
            limiter.reserve_at(now + Duration::from_millis(100)),
            Duration::ZERO
        );
    }

    #[test]
    fn zero_frequency_disables_bucket() {
        let limiter = BucketRateLimiter::new(0, 0);
        assert_eq!(limiter.when(&key("a")), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_the_longer_delay() {
        // A single-token bucket at one event per second dominates the 5ms
        // backoff once it is exhausted.
        let limiter = MaxOfRateLimiter::from_config(&RateLimiterConfig {
            burst: 1,
            frequency: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(10),
        });
        assert_eq!(limiter.when(&key("a")), Duration::from_millis(5));
        let paced = limiter.when(&key("b"));
        assert!(paced > Duration::from_millis(900), "{:?}", paced);

        // With a roomy bucket the per-key backoff dominates.
        let limiter = MaxOfRateLimiter::from_config(&RateLimiterConfig {
            burst: 100,
            frequency: 100,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(10),
        });
        assert_eq!(limiter.when(&key("a")), Duration::from_millis(5));
        assert_eq!(limiter.when(&key("a")), Duration::from_millis(10));
        assert_eq!(limiter.retries(&key("a")), 2);
        limiter.forget(&key("a"));
        assert_eq!(limiter.retries(&key("a")), 0);
    }
}

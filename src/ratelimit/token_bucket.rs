//! Token bucket limiter.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::{Clock, MonotonicClock, Timestamp};
use super::table::StateTable;
use crate::error::{ensure_positive, Result};

/// Bucket state for a single key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Tokens available, in `[0, capacity]`
    pub tokens: f64,
    /// Time up to which refill has been credited
    pub last_refill: Timestamp,
}

/// Admits a request per available token, refilling lazily over time.
///
/// New keys start with a full bucket. On every call the refill owed since
/// `last_refill` is credited first, capped at capacity, and committed whether
/// or not the request is then admitted. Admission consumes one token.
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_rate: f64,
    states: StateTable<Bucket>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter with `bucket_capacity` tokens refilled at `refill_rate` tokens/second.
    pub fn new(bucket_capacity: f64, refill_rate: f64) -> Result<Self> {
        Self::build(bucket_capacity, refill_rate, StateTable::new())
    }

    /// Same as [`new`](Self::new) with an explicit shard count for the state table.
    pub fn with_shards(bucket_capacity: f64, refill_rate: f64, shards: usize) -> Result<Self> {
        Self::build(bucket_capacity, refill_rate, StateTable::with_shards(shards)?)
    }

    fn build(bucket_capacity: f64, refill_rate: f64, states: StateTable<Bucket>) -> Result<Self> {
        let capacity = ensure_positive("bucket_capacity", bucket_capacity)?;
        let refill_rate = ensure_positive("refill_rate", refill_rate)?;

        info!(
            capacity = capacity,
            refill_rate = refill_rate,
            "Token bucket limiter created"
        );

        Ok(Self {
            capacity,
            refill_rate,
            states,
            clock: Arc::new(MonotonicClock::new()),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Decide whether a request from `key` at `now` may proceed.
    pub fn admit_at(&self, key: &str, now: Timestamp) -> bool {
        let capacity = self.capacity;
        let rate = self.refill_rate;

        let ((admitted, tokens), created) = self.states.with_state(
            key,
            || Bucket {
                tokens: capacity,
                last_refill: now,
            },
            |bucket| {
                // A clock that steps backwards credits nothing and does not
                // rewind last_refill, so the same interval is never paid twice.
                let elapsed = now.saturating_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
                bucket.last_refill = bucket.last_refill.max(now);

                if bucket.tokens < 1.0 {
                    (false, bucket.tokens)
                } else {
                    bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                    (true, bucket.tokens)
                }
            },
        );

        if created {
            debug!(key = %key, "Tracking new key");
        }
        trace!(key = %key, admitted = admitted, tokens = tokens, "Token bucket decision");
        if !admitted {
            debug!(key = %key, tokens = tokens, "Rate limit exceeded");
        }
        admitted
    }

    /// Decide using the limiter's clock.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, self.clock.now())
    }

    /// Drop keys untouched for `idle_for` whose bucket would already be full
    /// again by `now`. Returns how many keys were removed.
    ///
    /// A removed key comes back with a full bucket, which is exactly what it
    /// would have had, so eviction never changes a decision.
    pub fn evict_idle(&self, now: Timestamp, idle_for: Duration) -> usize {
        let capacity = self.capacity;
        let rate = self.refill_rate;

        self.states.retain(|_, bucket| {
            let idle = now.saturating_since(bucket.last_refill);
            if idle < idle_for {
                return true;
            }
            bucket.tokens + idle.as_secs_f64() * rate < capacity
        })
    }

    /// Number of keys currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    /// Stored bucket for `key`, without crediting pending refill.
    pub fn bucket(&self, key: &str) -> Option<Bucket> {
        self.states.inspect(key, |bucket| *bucket)
    }

    /// Stored token count for `key`, without crediting pending refill.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.bucket(key).map(|bucket| bucket.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(TokenBucketLimiter::new(0.0, 1.0).is_err());
        assert!(TokenBucketLimiter::new(5.0, 0.0).is_err());
        assert!(TokenBucketLimiter::new(-5.0, 1.0).is_err());
        assert!(TokenBucketLimiter::new(5.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_burst_then_reject_then_refill() {
        let limiter = TokenBucketLimiter::new(5.0, 5.0).unwrap();
        let t0 = Timestamp::ZERO;

        for i in 0..5 {
            assert!(limiter.admit_at("bob", t0), "request {} should pass", i + 1);
        }
        assert_eq!(limiter.tokens("bob"), Some(0.0));
        assert!(!limiter.admit_at("bob", t0));

        assert!(limiter.admit_at("bob", Timestamp::from_millis(200)));
        assert!(!limiter.admit_at("bob", Timestamp::from_millis(200)));
    }

    #[test]
    fn test_refill_is_committed_on_rejection() {
        let limiter = TokenBucketLimiter::new(1.0, 1.0).unwrap();

        assert!(limiter.admit_at("bob", Timestamp::ZERO));
        assert!(!limiter.admit_at("bob", Timestamp::from_millis(600)));

        let bucket = limiter.bucket("bob").unwrap();
        assert!((bucket.tokens - 0.6).abs() < 1e-9);
        assert_eq!(bucket.last_refill, Timestamp::from_millis(600));

        // The 0.6 credited above is kept, so 0.4s more is enough.
        assert!(limiter.admit_at("bob", Timestamp::from_millis(1000)));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let limiter = TokenBucketLimiter::new(3.0, 10.0).unwrap();

        assert!(limiter.admit_at("bob", Timestamp::ZERO));
        assert!(limiter.admit_at("bob", Timestamp::from_secs_f64(3600.0)));
        assert_eq!(limiter.tokens("bob"), Some(2.0));

        for _ in 0..2 {
            assert!(limiter.admit_at("bob", Timestamp::from_secs_f64(3600.0)));
        }
        assert!(!limiter.admit_at("bob", Timestamp::from_secs_f64(3600.0)));
    }

    #[test]
    fn test_backwards_clock_credits_nothing() {
        let limiter = TokenBucketLimiter::new(1.0, 1.0).unwrap();

        assert!(limiter.admit_at("bob", Timestamp::from_secs_f64(10.0)));
        assert!(!limiter.admit_at("bob", Timestamp::from_secs_f64(5.0)));

        let bucket = limiter.bucket("bob").unwrap();
        assert_eq!(bucket.tokens, 0.0);
        assert_eq!(bucket.last_refill, Timestamp::from_secs_f64(10.0));

        assert!(!limiter.admit_at("bob", Timestamp::from_secs_f64(10.5)));
        assert!(limiter.admit_at("bob", Timestamp::from_secs_f64(11.0)));
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let limiter = TokenBucketLimiter::new(4.0, 3.0).unwrap();

        for ms in (0..5000).step_by(7) {
            limiter.admit_at("bob", Timestamp::from_millis(ms));
            let tokens = limiter.tokens("bob").unwrap();
            assert!((0.0..=4.0).contains(&tokens), "tokens {} at {}ms", tokens, ms);
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(2.0, 1.0).unwrap();

        for _ in 0..50 {
            limiter.admit_at("mallory", Timestamp::ZERO);
        }
        assert!(limiter.admit_at("alice", Timestamp::ZERO));
        assert!(limiter.admit_at("alice", Timestamp::ZERO));
        assert!(!limiter.admit_at("alice", Timestamp::ZERO));
    }

    #[test]
    fn test_fractional_capacity_below_one_never_admits() {
        let limiter = TokenBucketLimiter::new(0.5, 1.0).unwrap();

        assert!(!limiter.admit_at("bob", Timestamp::ZERO));
        assert!(!limiter.admit_at("bob", Timestamp::from_secs_f64(100.0)));
    }

    #[test]
    fn test_admit_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let limiter = TokenBucketLimiter::new(1.0, 2.0)
            .unwrap()
            .with_clock(clock.clone());

        assert!(limiter.admit("bob"));
        assert!(!limiter.admit("bob"));

        clock.advance(Duration::from_millis(500));
        assert!(limiter.admit("bob"));
    }

    #[test]
    fn test_evict_idle_only_removes_full_buckets() {
        let limiter = TokenBucketLimiter::new(10.0, 1.0).unwrap();
        let t0 = Timestamp::ZERO;

        assert!(limiter.admit_at("light", t0));
        for _ in 0..10 {
            limiter.admit_at("heavy", t0);
        }

        // light needs 1s to refill, heavy needs 10s
        let removed = limiter.evict_idle(Timestamp::from_secs_f64(5.0), Duration::from_secs(2));
        assert_eq!(removed, 1);
        assert!(limiter.bucket("light").is_none());
        assert!(limiter.bucket("heavy").is_some());

        let removed = limiter.evict_idle(Timestamp::from_secs_f64(10.0), Duration::from_secs(2));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_evict_idle_keeps_recent_keys() {
        let limiter = TokenBucketLimiter::new(10.0, 100.0).unwrap();
        limiter.admit_at("bob", Timestamp::ZERO);

        let removed = limiter.evict_idle(Timestamp::from_secs_f64(1.0), Duration::from_secs(60));
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_concurrent_callers_never_exceed_capacity() {
        let limiter = TokenBucketLimiter::with_shards(20.0, 0.001, 4).unwrap();
        let accepted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if limiter.admit_at("shared", Timestamp::ZERO) {
                            accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(accepted.into_inner(), 20);
        assert_eq!(limiter.tokens("shared"), Some(0.0));
    }
}

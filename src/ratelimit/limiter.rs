//! The admission capability shared by both limiter algorithms.

use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, Timestamp};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::config::PolicyConfig;
use crate::error::Result;

/// Trait for admission-control implementations.
///
/// `admit_at` must be safe to call concurrently for any mix of keys, and
/// calls touching the same key must behave as if run one after another.
pub trait RateLimiter: Send + Sync {
    /// Decide whether a request from `key` at `now` may proceed.
    fn admit_at(&self, key: &str, now: Timestamp) -> bool;

    /// Remove keys whose state no longer affects any decision and which
    /// have been idle for at least `idle_for`.
    fn evict_idle(&self, now: Timestamp, idle_for: Duration) -> usize;

    /// Number of keys currently holding state.
    fn tracked_keys(&self) -> usize;

    /// The time source `admit` reads.
    fn clock(&self) -> &dyn Clock;

    /// Decide at the current time of [`clock`](Self::clock).
    fn admit(&self, key: &str) -> bool {
        self.admit_at(key, self.clock().now())
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn admit_at(&self, key: &str, now: Timestamp) -> bool {
        SlidingWindowLimiter::admit_at(self, key, now)
    }

    fn evict_idle(&self, now: Timestamp, idle_for: Duration) -> usize {
        SlidingWindowLimiter::evict_idle(self, now, idle_for)
    }

    fn tracked_keys(&self) -> usize {
        SlidingWindowLimiter::tracked_keys(self)
    }

    fn clock(&self) -> &dyn Clock {
        SlidingWindowLimiter::clock(self)
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn admit_at(&self, key: &str, now: Timestamp) -> bool {
        TokenBucketLimiter::admit_at(self, key, now)
    }

    fn evict_idle(&self, now: Timestamp, idle_for: Duration) -> usize {
        TokenBucketLimiter::evict_idle(self, now, idle_for)
    }

    fn tracked_keys(&self) -> usize {
        TokenBucketLimiter::tracked_keys(self)
    }

    fn clock(&self) -> &dyn Clock {
        TokenBucketLimiter::clock(self)
    }
}

/// A limiter of either algorithm, chosen at construction.
pub enum Limiter {
    SlidingWindow(SlidingWindowLimiter),
    TokenBucket(TokenBucketLimiter),
}

impl Limiter {
    /// Build the limiter a policy describes.
    pub fn from_policy(policy: &PolicyConfig, shards: Option<usize>) -> Result<Self> {
        let limiter = match *policy {
            PolicyConfig::SlidingWindow {
                max_requests,
                window_seconds,
            } => Limiter::SlidingWindow(match shards {
                Some(shards) => {
                    SlidingWindowLimiter::with_shards(max_requests, window_seconds, shards)?
                }
                None => SlidingWindowLimiter::new(max_requests, window_seconds)?,
            }),
            PolicyConfig::TokenBucket {
                bucket_capacity,
                refill_rate,
            } => Limiter::TokenBucket(match shards {
                Some(shards) => {
                    TokenBucketLimiter::with_shards(bucket_capacity, refill_rate, shards)?
                }
                None => TokenBucketLimiter::new(bucket_capacity, refill_rate)?,
            }),
        };
        Ok(limiter)
    }

    /// Replace the time source of the wrapped limiter.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        match self {
            Limiter::SlidingWindow(l) => Limiter::SlidingWindow(l.with_clock(clock)),
            Limiter::TokenBucket(l) => Limiter::TokenBucket(l.with_clock(clock)),
        }
    }

    /// Short algorithm name, for logs and reports.
    pub fn algorithm(&self) -> &'static str {
        match self {
            Limiter::SlidingWindow(_) => "sliding_window",
            Limiter::TokenBucket(_) => "token_bucket",
        }
    }

    fn inner(&self) -> &dyn RateLimiter {
        match self {
            Limiter::SlidingWindow(l) => l,
            Limiter::TokenBucket(l) => l,
        }
    }
}

impl From<SlidingWindowLimiter> for Limiter {
    fn from(limiter: SlidingWindowLimiter) -> Self {
        Limiter::SlidingWindow(limiter)
    }
}

impl From<TokenBucketLimiter> for Limiter {
    fn from(limiter: TokenBucketLimiter) -> Self {
        Limiter::TokenBucket(limiter)
    }
}

impl RateLimiter for Limiter {
    fn admit_at(&self, key: &str, now: Timestamp) -> bool {
        self.inner().admit_at(key, now)
    }

    fn evict_idle(&self, now: Timestamp, idle_for: Duration) -> usize {
        self.inner().evict_idle(now, idle_for)
    }

    fn tracked_keys(&self) -> usize {
        self.inner().tracked_keys()
    }

    fn clock(&self) -> &dyn Clock {
        self.inner().clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn sliding(max_requests: u32, window_seconds: f64) -> PolicyConfig {
        PolicyConfig::SlidingWindow {
            max_requests,
            window_seconds,
        }
    }

    fn bucket(bucket_capacity: f64, refill_rate: f64) -> PolicyConfig {
        PolicyConfig::TokenBucket {
            bucket_capacity,
            refill_rate,
        }
    }

    #[test]
    fn test_from_policy_selects_variant() {
        let limiter = Limiter::from_policy(&sliding(5, 1.0), None).unwrap();
        assert_eq!(limiter.algorithm(), "sliding_window");

        let limiter = Limiter::from_policy(&bucket(5.0, 5.0), Some(8)).unwrap();
        assert_eq!(limiter.algorithm(), "token_bucket");
    }

    #[test]
    fn test_from_policy_rejects_misconfiguration() {
        assert!(Limiter::from_policy(&sliding(0, 1.0), None).is_err());
        assert!(Limiter::from_policy(&bucket(5.0, -1.0), None).is_err());
    }

    #[test]
    fn test_both_variants_share_the_contract() {
        let policies = [sliding(5, 1.0), bucket(5.0, 5.0)];

        for policy in &policies {
            let limiter = Limiter::from_policy(policy, None).unwrap();
            let t0 = Timestamp::ZERO;

            for _ in 0..5 {
                assert!(limiter.admit_at("alice", t0), "{}", limiter.algorithm());
            }
            assert!(!limiter.admit_at("alice", t0), "{}", limiter.algorithm());
            assert!(limiter.admit_at("bob", t0), "{}", limiter.algorithm());
            assert_eq!(limiter.tracked_keys(), 2);

            // a slot or a token frees within a second under both policies
            assert!(limiter.admit_at("alice", Timestamp::from_secs_f64(1.0)));
        }
    }

    #[test]
    fn test_admit_through_trait_object() {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let limiter: Box<dyn RateLimiter> = Box::new(
            Limiter::from_policy(&bucket(1.0, 1.0), None)
                .unwrap()
                .with_clock(clock.clone()),
        );

        assert!(limiter.admit("carol"));
        assert!(!limiter.admit("carol"));
        clock.advance(Duration::from_secs(1));
        assert!(limiter.admit("carol"));
    }

    #[test]
    fn test_evict_idle_dispatches() {
        let limiter: Limiter = SlidingWindowLimiter::new(1, 1.0).unwrap().into();
        limiter.admit_at("alice", Timestamp::ZERO);

        let removed = limiter.evict_idle(Timestamp::from_secs_f64(10.0), Duration::from_secs(5));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}

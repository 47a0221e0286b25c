//! Sliding time window limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::{Clock, MonotonicClock, Timestamp};
use super::table::StateTable;
use crate::error::{ensure_positive, Result, TurnstileError};

/// Admits at most `max_requests` per key within any trailing window.
///
/// Each key keeps the timestamps of its admitted requests in arrival order.
/// A call first trims the timestamps that have left the window from the
/// front of the queue, then admits and records `now` if fewer than
/// `max_requests` remain. Each timestamp is trimmed at most once, so the
/// amortized cost per call is constant.
///
/// The window is half-open on the old side: a timestamp exactly
/// `window` before `now` no longer counts.
///
/// Timestamps are assumed non-decreasing per key. If the clock steps
/// backwards the queue is left as is and the key may be under-trimmed until
/// time catches up.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    states: StateTable<VecDeque<Timestamp>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `max_requests` per `window_seconds` per key.
    pub fn new(max_requests: u32, window_seconds: f64) -> Result<Self> {
        Self::build(max_requests, window_seconds, StateTable::new())
    }

    /// Same as [`new`](Self::new) with an explicit shard count for the state table.
    pub fn with_shards(max_requests: u32, window_seconds: f64, shards: usize) -> Result<Self> {
        Self::build(max_requests, window_seconds, StateTable::with_shards(shards)?)
    }

    fn build(
        max_requests: u32,
        window_seconds: f64,
        states: StateTable<VecDeque<Timestamp>>,
    ) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::InvalidParameter {
                name: "max_requests",
                value: 0.0,
            });
        }
        let window_seconds = ensure_positive("window_seconds", window_seconds)?;
        let window = Duration::try_from_secs_f64(window_seconds).map_err(|e| {
            TurnstileError::Config(format!("window_seconds {}: {}", window_seconds, e))
        })?;

        info!(
            max_requests = max_requests,
            window_ms = window.as_millis() as u64,
            "Sliding window limiter created"
        );

        Ok(Self {
            max_requests: max_requests as usize,
            window,
            states,
            clock: Arc::new(MonotonicClock::new()),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Decide whether a request from `key` at `now` may proceed.
    pub fn admit_at(&self, key: &str, now: Timestamp) -> bool {
        let cutoff = now.checked_sub(self.window);
        let limit = self.max_requests;

        let ((admitted, in_window), created) = self.states.with_state(
            key,
            VecDeque::new,
            |stamps| {
                if let Some(cutoff) = cutoff {
                    while stamps.front().map_or(false, |oldest| *oldest <= cutoff) {
                        stamps.pop_front();
                    }
                }

                if stamps.len() >= limit {
                    (false, stamps.len())
                } else {
                    stamps.push_back(now);
                    (true, stamps.len())
                }
            },
        );

        if created {
            debug!(key = %key, "Tracking new key");
        }
        trace!(key = %key, admitted = admitted, in_window = in_window, "Sliding window decision");
        if !admitted {
            debug!(key = %key, limit = limit, "Rate limit exceeded");
        }
        admitted
    }

    /// Decide using the limiter's clock.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, self.clock.now())
    }

    /// Drop keys with nothing left in the window whose last admission is
    /// older than `idle_for`. Returns how many keys were removed.
    ///
    /// A key still holding in-window timestamps is never removed, whatever
    /// `idle_for` is, so eviction cannot free capacity early.
    pub fn evict_idle(&self, now: Timestamp, idle_for: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(idle_for.max(self.window)) else {
            return 0;
        };

        self.states.retain(|_, stamps| {
            stamps.back().map_or(false, |newest| *newest > cutoff)
        })
    }

    /// Number of keys currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    /// Timestamps recorded for `key`, including any not yet trimmed.
    pub fn window_len(&self, key: &str) -> Option<usize> {
        self.states.inspect(key, |stamps| stamps.len())
    }
}

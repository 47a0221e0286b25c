//! Time source for admission decisions.
//!
//! Limiters never read a wall clock directly. They ask a [`Clock`] for the
//! current [`Timestamp`], which lets tests drive window boundaries and refill
//! behaviour without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point in monotonic time, measured as an offset from a clock's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The clock origin.
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// Create a timestamp from an offset since the origin.
    pub const fn from_offset(offset: Duration) -> Self {
        Self(offset)
    }

    /// Create a timestamp from fractional seconds since the origin.
    ///
    /// Negative or non-finite inputs saturate to the origin.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }

    /// Create a timestamp from whole milliseconds since the origin.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Offset since the origin.
    pub fn offset(&self) -> Duration {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// Step back by `by`, or `None` if that would cross the origin.
    pub fn checked_sub(&self, by: Duration) -> Option<Timestamp> {
        self.0.checked_sub(by).map(Timestamp)
    }

    /// Step forward by `by`.
    pub fn saturating_add(&self, by: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(by))
    }
}

/// Source of the current time for a limiter.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;
}

/// Process-monotonic clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed())
    }
}

/// Manually driven clock, shared between a test and the limiters under test.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: AtomicU64::new(duration_to_nanos(start.0)),
        }
    }

    /// Jump to `to`. Moving backwards is allowed and models clock skew.
    pub fn set(&self, to: Timestamp) {
        self.nanos.store(duration_to_nanos(to.0), Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(duration_to_nanos(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(Duration::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

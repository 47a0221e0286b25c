//! Per-key admission control and its state management.

mod clock;
mod limiter;
mod registry;
mod sliding_window;
mod sweeper;
mod table;
mod token_bucket;

pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use limiter::{Limiter, RateLimiter};
pub use registry::LimiterRegistry;
pub use sliding_window::SlidingWindowLimiter;
pub use sweeper::{sweep, Sweeper};
pub use table::StateTable;
pub use token_bucket::{Bucket, TokenBucketLimiter};

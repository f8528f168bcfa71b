//! Rate limiting strategies and the machinery that drives them.

mod clock;
mod fixed_window;
mod leaky_bucket;
mod ticker;
mod token_bucket;

pub use clock::{Clock, ManualClock, TokioClock};
pub use fixed_window::{FixedWindowLimiter, FixedWindowSnapshot};
pub use leaky_bucket::{LeakyBucketLimiter, LeakyBucketSnapshot, Packet};
pub use ticker::Ticker;
pub use token_bucket::{TokenBucketLimiter, TokenBucketSnapshot};

/// A gate that admits or rejects one unit of work at a time.
///
/// Implementations never block: a rejection is immediate and the caller
/// decides whether to retry, drop or escalate.
pub trait Limiter: Send + Sync {
    /// Returns `true` if the current call is admitted.
    fn allow(&self) -> bool;
}

/// Convert a duration to whole milliseconds for snapshots and logs.
pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

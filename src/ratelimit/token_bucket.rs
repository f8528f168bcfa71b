//! Token bucket with a background refill task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::clock::{Clock, TokioClock};
use super::ticker::Ticker;
use super::{millis, Limiter};
use crate::config::{require_nonzero_duration, require_positive, TokenBucketConfig};
use crate::error::Result;

/// Admits a call for every token in the bucket.
///
/// The bucket starts full. A background ticker adds `tokens_per_refill`
/// tokens every `refill_interval`, never beyond `capacity`, so bursts of up
/// to `capacity` are allowed after idle periods while sustained throughput is
/// bounded by `tokens_per_refill / refill_interval`.
///
/// Must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: u64,
    tokens_per_refill: u64,
    refill_interval: Duration,
    state: Arc<Mutex<BucketState>>,
    ticker: Ticker,
}

#[derive(Debug)]
struct BucketState {
    /// Current balance, never above capacity
    tokens: u64,
    /// Refill ticks applied so far
    refills: u64,
    /// Cleared by `stop`; ticks observed after that are ignored
    running: bool,
}

/// Point-in-time view of a token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBucketSnapshot {
    pub capacity: u64,
    pub tokens: u64,
    pub tokens_per_refill: u64,
    pub refill_interval_ms: u64,
    pub refills: u64,
    pub running: bool,
}

impl TokenBucketLimiter {
    /// Create a full bucket refilled on the Tokio clock.
    pub fn new(capacity: u64, tokens_per_refill: u64, refill_interval: Duration) -> Result<Self> {
        Self::with_clock(capacity, tokens_per_refill, refill_interval, Arc::new(TokioClock))
    }

    /// Create a bucket from its configuration section.
    pub fn from_config(config: &TokenBucketConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.capacity, config.tokens_per_refill, config.refill_interval())
    }

    /// Create a full bucket whose refill ticks are scheduled on `clock`.
    pub fn with_clock<C: Clock>(
        capacity: u64,
        tokens_per_refill: u64,
        refill_interval: Duration,
        clock: Arc<C>,
    ) -> Result<Self> {
        require_positive("capacity", capacity)?;
        require_positive("tokens_per_refill", tokens_per_refill)?;
        require_nonzero_duration("refill_interval", refill_interval)?;

        let state = Arc::new(Mutex::new(BucketState {
            tokens: capacity,
            refills: 0,
            running: true,
        }));

        let shared = state.clone();
        let ticker = Ticker::spawn(clock, refill_interval, "token_bucket_refill", move || {
            refill(&shared, capacity, tokens_per_refill)
        })?;

        info!(
            capacity = capacity,
            tokens_per_refill = tokens_per_refill,
            refill_interval = ?refill_interval,
            "Token bucket limiter created"
        );

        Ok(Self {
            capacity,
            tokens_per_refill,
            refill_interval,
            state,
            ticker,
        })
    }

    /// Take one token if any is left.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        if state.tokens > 0 {
            state.tokens -= 1;
            trace!(remaining = state.tokens, "Token taken");
            true
        } else {
            debug!(capacity = self.capacity, "Token bucket empty");
            false
        }
    }

    /// Stop refilling. The current balance stays usable.
    ///
    /// Once this returns no further refill is applied, even by a tick that
    /// was already in flight. Calling it again has no effect.
    pub fn stop(&self) {
        self.state.lock().running = false;
        self.ticker.stop();
    }

    /// Stop refilling and wait for the background task to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.ticker.join().await
    }

    /// Get the current token balance.
    pub fn tokens(&self) -> u64 {
        self.state.lock().tokens
    }

    /// Get the maximum token balance.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether the refill task is still applying ticks.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Get a point-in-time view of the bucket.
    pub fn snapshot(&self) -> TokenBucketSnapshot {
        let state = self.state.lock();
        TokenBucketSnapshot {
            capacity: self.capacity,
            tokens: state.tokens,
            tokens_per_refill: self.tokens_per_refill,
            refill_interval_ms: millis(self.refill_interval),
            refills: state.refills,
            running: state.running,
        }
    }
}

impl Limiter for TokenBucketLimiter {
    fn allow(&self) -> bool {
        TokenBucketLimiter::allow(self)
    }
}

fn refill(state: &Mutex<BucketState>, capacity: u64, tokens_per_refill: u64) {
    let mut state = state.lock();
    if !state.running {
        return;
    }

    let before = state.tokens;
    state.tokens = capacity.min(state.tokens.saturating_add(tokens_per_refill));
    state.refills += 1;
    trace!(before = before, after = state.tokens, "Refilled token bucket");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::clock::ManualClock;

    fn count_admitted(limiter: &TokenBucketLimiter, calls: usize) -> usize {
        (0..calls).filter(|_| limiter.allow()).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = TokenBucketLimiter::new(5, 2, Duration::from_secs(1)).unwrap();

        let results: Vec<bool> = (0..10).map(|_| limiter.allow()).collect();
        assert_eq!(results, [true, true, true, true, true, false, false, false, false, false]);

        tokio::time::sleep(Duration::from_millis(1001)).await;

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        limiter.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = TokenBucketLimiter::new(5, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(count_admitted(&limiter, 1), 1);

        // Plenty of refills while nearly full.
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        assert_eq!(limiter.tokens(), 5);
        assert_eq!(limiter.snapshot().refills, 10);
        assert_eq!(count_admitted(&limiter, 6), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill_clamped() {
        let limiter = TokenBucketLimiter::new(5, 3, Duration::from_secs(1)).unwrap();
        assert_eq!(count_admitted(&limiter, 1), 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        // 4 + 3 clamps to 5.
        assert_eq!(limiter.tokens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admissions_between_refills_bounded() {
        let limiter = TokenBucketLimiter::new(10, 3, Duration::from_millis(100)).unwrap();
        assert_eq!(count_admitted(&limiter, 20), 10);

        // Sample halfway between ticks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(count_admitted(&limiter, 20), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_balance() {
        let limiter = TokenBucketLimiter::new(5, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(count_admitted(&limiter, 4), 4);

        limiter.stop();
        limiter.stop();
        assert!(!limiter.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(limiter.tokens(), 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.snapshot().refills, 0);

        limiter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_wins_over_pending_tick() {
        let clock = Arc::new(ManualClock::new());
        let limiter =
            TokenBucketLimiter::with_clock(2, 1, Duration::from_millis(100), clock.clone()).unwrap();
        assert_eq!(count_admitted(&limiter, 2), 2);

        // The tick is due but the task has not run yet when stop lands.
        clock.advance(Duration::from_millis(100));
        limiter.stop();
        tokio::task::yield_now().await;

        assert_eq!(limiter.tokens(), 0);
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_ends_refill_task() {
        let limiter = TokenBucketLimiter::new(5, 2, Duration::from_secs(1)).unwrap();
        let state = Arc::downgrade(&limiter.state);

        drop(limiter);
        // The refill closure holds the last strong reference until the task exits.
        for _ in 0..100 {
            if state.strong_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(state.strong_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_bounded_by_balance() {
        let limiter = Arc::new(TokenBucketLimiter::new(50, 1, Duration::from_secs(60)).unwrap());

        let handles: Vec<_> = (0..80)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow() })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let admitted = results.into_iter().filter(|r| matches!(r, Ok(true))).count();
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn test_rejects_invalid_configuration() {
        assert!(matches!(
            TokenBucketLimiter::new(0, 1, Duration::from_secs(1)),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(5, 0, Duration::from_secs(1)),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(5, 1, Duration::ZERO),
            Err(TollgateError::Config(_))
        ));
    }

    #[test]
    fn test_requires_runtime() {
        let result = TokenBucketLimiter::new(5, 1, Duration::from_secs(1));
        assert!(matches!(result, Err(TollgateError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_from_config_and_snapshot() {
        let limiter = TokenBucketLimiter::from_config(&TokenBucketConfig::default()).unwrap();
        limiter.allow();

        assert_eq!(
            limiter.snapshot(),
            TokenBucketSnapshot {
                capacity: 5,
                tokens: 4,
                tokens_per_refill: 2,
                refill_interval_ms: 1000,
                refills: 0,
                running: true,
            }
        );
    }
}

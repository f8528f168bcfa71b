//! Time sources shared by the limiters.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A source of time and timer wakeups.
///
/// Every limiter reads time through a `Clock`, and the background tickers
/// sleep through one, so tests can swap in a clock they control.
#[async_trait]
pub trait Clock: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Resolve once `now() >= deadline`.
    async fn sleep_until(&self, deadline: Instant);
}

/// Clock backed by `tokio::time`.
///
/// Under a paused runtime (`tokio::time::pause` or
/// `#[tokio::test(start_paused = true)]`) this clock is fully deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    advanced: Notify,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            advanced: Notify::new(),
        }
    }

    /// Move time forward and wake every pending sleeper.
    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
        self.advanced.notify_waiters();
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    async fn sleep_until(&self, deadline: Instant) {
        loop {
            // Register interest before checking the time so an advance
            // between the check and the await is not lost.
            let advanced = self.advanced.notified();
            tokio::pin!(advanced);
            advanced.as_mut().enable();

            if self.now() >= deadline {
                return;
            }
            advanced.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock_starts_frozen() {
        let clock = ManualClock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), first);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(250));
        clock.advance(Duration::from_millis(750));

        assert_eq!(clock.now() - start, Duration::from_secs(1));
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_returns_immediately_when_due() {
        let clock = ManualClock::new();
        clock.sleep_until(clock.now()).await;
    }

    #[tokio::test]
    async fn test_manual_clock_wakes_sleeper_on_advance() {
        let clock = Arc::new(ManualClock::new());
        let deadline = clock.now() + Duration::from_secs(10);

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep_until(deadline).await })
        };

        // Not enough: the sleeper must stay parked.
        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(4));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(6));
        sleeper.await.unwrap();
        assert!(clock.now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();

        clock.sleep_until(start + Duration::from_secs(3)).await;

        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }
}

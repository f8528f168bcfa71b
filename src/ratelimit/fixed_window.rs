//! Fixed window counter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::clock::{Clock, TokioClock};
use super::{millis, Limiter};
use crate::config::{require_nonzero_duration, require_positive, FixedWindowConfig};
use crate::error::Result;

/// Admits up to `max_requests` calls per fixed-length window.
///
/// The window is reset lazily by the first call that observes it expired,
/// so there is no background task. Capacity left over in an expired window
/// is discarded rather than carried forward.
#[derive(Debug)]
pub struct FixedWindowLimiter<C: Clock = TokioClock> {
    /// Length of one window
    window: Duration,
    /// Admissions allowed per window
    max_requests: u64,
    clock: Arc<C>,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    /// Admissions granted in the current window
    request_count: u64,
    /// When the current window started
    window_start: Instant,
}

/// Point-in-time view of a fixed window limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixedWindowSnapshot {
    pub max_requests: u64,
    pub request_count: u64,
    pub window_ms: u64,
    pub resets_in_ms: u64,
}

impl FixedWindowLimiter {
    /// Create a limiter on the Tokio clock.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        Self::with_clock(window, max_requests, Arc::new(TokioClock))
    }

    /// Create a limiter from its configuration section.
    pub fn from_config(config: &FixedWindowConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.window(), config.max_requests)
    }
}

impl<C: Clock> FixedWindowLimiter<C> {
    /// Create a limiter reading time from `clock`.
    ///
    /// The first window starts now.
    pub fn with_clock(window: Duration, max_requests: u64, clock: Arc<C>) -> Result<Self> {
        require_nonzero_duration("window", window)?;
        require_positive("max_requests", max_requests)?;

        let window_start = clock.now();
        Ok(Self {
            window,
            max_requests,
            clock,
            state: Mutex::new(WindowState {
                request_count: 0,
                window_start,
            }),
        })
    }

    /// Decide whether the current call is admitted.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = self.clock.now();

        if now.saturating_duration_since(state.window_start) >= self.window {
            trace!(
                previous_count = state.request_count,
                "Window expired, starting a new one"
            );
            state.window_start = now;
            state.request_count = 0;
        }

        if state.request_count < self.max_requests {
            state.request_count += 1;
            trace!(count = state.request_count, limit = self.max_requests, "Request admitted");
            true
        } else {
            debug!(limit = self.max_requests, "Fixed window limit exceeded");
            false
        }
    }

    /// Admissions still available in the current window.
    pub fn remaining(&self) -> u64 {
        let state = self.state.lock();
        let (_, count) = self.observe(&state);
        self.max_requests - count
    }

    /// Get the admission limit per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Observe the limiter without resetting an expired window.
    pub fn snapshot(&self) -> FixedWindowSnapshot {
        let state = self.state.lock();
        let (elapsed, request_count) = self.observe(&state);
        FixedWindowSnapshot {
            max_requests: self.max_requests,
            request_count,
            window_ms: millis(self.window),
            resets_in_ms: millis(self.window.saturating_sub(elapsed)),
        }
    }

    /// Elapsed time in the current window and the count it implies, from a
    /// single clock read. An expired window counts as empty.
    fn observe(&self, state: &WindowState) -> (Duration, u64) {
        let elapsed = self.clock.now().saturating_duration_since(state.window_start);
        if elapsed >= self.window {
            (elapsed, 0)
        } else {
            (elapsed, state.request_count)
        }
    }
}

impl<C: Clock> Limiter for FixedWindowLimiter<C> {
    fn allow(&self) -> bool {
        FixedWindowLimiter::<C>::allow(self)
    }
}

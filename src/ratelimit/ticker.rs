//! Cancellable periodic background task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::clock::Clock;
use crate::error::{Result, TollgateError};

/// Handle to a background task that calls a closure once per period.
///
/// The first tick fires one period after spawning. A tick that runs late does
/// not trigger catch-up ticks: the next deadline moves to the next nominal
/// offset after the current time.
#[derive(Debug)]
pub struct Ticker {
    name: &'static str,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Spawn a ticker on the current Tokio runtime.
    pub fn spawn<C, F>(clock: Arc<C>, period: Duration, name: &'static str, mut on_tick: F) -> Result<Self>
    where
        C: Clock,
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(TollgateError::Config(format!(
                "{} period must be greater than zero",
                name
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TollgateError::NoRuntime)?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let start = clock.now();

        let handle = runtime.spawn(async move {
            let mut deadline = start + period;
            loop {
                tokio::select! {
                    biased;
                    // Fires on stop() and when the Ticker is dropped.
                    _ = &mut shutdown_rx => break,
                    _ = clock.sleep_until(deadline) => {}
                }

                trace!(ticker = name, "Tick");
                on_tick();

                deadline = next_deadline(deadline, period, clock.now());
            }
            debug!(ticker = name, "Ticker task exited");
        });

        info!(ticker = name, period = ?period, "Started background ticker");

        Ok(Self {
            name,
            shutdown: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the task to exit. Calling this more than once is a no-op.
    pub fn stop(&self) {
        match self.shutdown.lock().take() {
            Some(tx) => {
                // The task may already be gone; nothing to do then.
                let _ = tx.send(());
                info!(ticker = self.name, "Stopped background ticker");
            }
            None => debug!(ticker = self.name, "Ticker already stopped"),
        }
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.lock().is_none()
    }

    /// Stop the ticker and wait for its task to finish.
    pub async fn join(&self) -> Result<()> {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

/// Deadline following a tick that was due at `due` and finished at `now`.
///
/// Offsets already in the past are skipped. Computed here rather than with
/// `tokio::time::interval` so every sleep goes through the `Clock`.
fn next_deadline(due: Instant, period: Duration, now: Instant) -> Instant {
    let next = due + period;
    if next > now {
        return next;
    }

    // Skip every offset that has already passed.
    let behind = (now - next).as_nanos();
    let skipped = behind / period.as_nanos() + 1;
    let skip = period.as_nanos().saturating_mul(skipped);
    next + Duration::from_nanos(u64::try_from(skip).unwrap_or(u64::MAX))
}

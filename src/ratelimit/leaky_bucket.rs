//! Leaky bucket traffic shaper.
//!
//! Packets are queued up to a total weight of `capacity` and transmitted in
//! FIFO order by a background ticker, at most `leak_per_tick` weight per
//! tick. A packet is never split across ticks: if the head of the queue is
//! heavier than what is left of the tick's budget, it waits for the next
//! tick and the leftover budget is discarded.

use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::clock::{Clock, TokioClock};
use super::millis;
use super::ticker::Ticker;
use crate::config::{require_nonzero_duration, require_positive, LeakyBucketConfig};
use crate::error::Result;

/// A unit of work with a positive weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Packet {
    pub id: u64,
    pub weight: NonZeroU64,
}

impl Packet {
    /// Create a packet with a known positive weight.
    pub fn new(id: u64, weight: NonZeroU64) -> Self {
        Self { id, weight }
    }

    /// Returns `None` for a zero weight.
    pub fn try_new(id: u64, weight: u64) -> Option<Self> {
        NonZeroU64::new(weight).map(|weight| Self { id, weight })
    }

    /// Get the packet weight as a plain integer.
    pub fn weight(&self) -> u64 {
        self.weight.get()
    }
}

/// Bounded FIFO of weighted packets drained at a fixed rate.
///
/// Must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct LeakyBucketLimiter {
    capacity: u64,
    leak_per_tick: u64,
    tick_interval: Duration,
    state: Arc<Mutex<QueueState>>,
    ticker: Ticker,
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Packet>,
    /// Sum of the weights in `queue`
    current_load: u64,
    /// Packets transmitted so far
    transmitted: u64,
    /// Receives transmitted packets, if someone subscribed
    sink: Option<mpsc::UnboundedSender<Packet>>,
    /// Cleared by `stop`; ticks observed after that are ignored
    running: bool,
}

/// Point-in-time view of a leaky bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakyBucketSnapshot {
    pub capacity: u64,
    pub leak_per_tick: u64,
    pub tick_interval_ms: u64,
    pub current_load: u64,
    pub queued: usize,
    pub transmitted: u64,
    pub running: bool,
}

impl LeakyBucketLimiter {
    /// Create an empty bucket drained on the Tokio clock.
    pub fn new(capacity: u64, leak_per_tick: u64, tick_interval: Duration) -> Result<Self> {
        Self::with_clock(capacity, leak_per_tick, tick_interval, Arc::new(TokioClock))
    }

    /// Create a bucket from its configuration section.
    pub fn from_config(config: &LeakyBucketConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.capacity, config.leak_per_tick, config.tick_interval())
    }

    /// Create an empty bucket whose drain ticks are scheduled on `clock`.
    pub fn with_clock<C: Clock>(
        capacity: u64,
        leak_per_tick: u64,
        tick_interval: Duration,
        clock: Arc<C>,
    ) -> Result<Self> {
        require_positive("capacity", capacity)?;
        require_positive("leak_per_tick", leak_per_tick)?;
        require_nonzero_duration("tick_interval", tick_interval)?;

        let state = Arc::new(Mutex::new(QueueState {
            queue: VecDeque::new(),
            current_load: 0,
            transmitted: 0,
            sink: None,
            running: true,
        }));

        let shared = state.clone();
        let ticker = Ticker::spawn(clock, tick_interval, "leaky_bucket_drain", move || {
            drain(&shared, leak_per_tick)
        })?;

        info!(
            capacity = capacity,
            leak_per_tick = leak_per_tick,
            tick_interval = ?tick_interval,
            "Leaky bucket limiter created"
        );

        Ok(Self {
            capacity,
            leak_per_tick,
            tick_interval,
            state,
            ticker,
        })
    }

    /// Queue a packet if it fits.
    ///
    /// Returns `false` without touching the queue when the packet would push
    /// the load over capacity. Never blocks.
    pub fn enqueue(&self, packet: Packet) -> bool {
        let mut state = self.state.lock();

        let fits = state
            .current_load
            .checked_add(packet.weight())
            .map_or(false, |load| load <= self.capacity);

        if !fits {
            debug!(
                id = packet.id,
                weight = packet.weight(),
                load = state.current_load,
                capacity = self.capacity,
                "Bucket is full, packet rejected"
            );
            return false;
        }

        state.current_load += packet.weight();
        state.queue.push_back(packet);
        trace!(
            id = packet.id,
            weight = packet.weight(),
            load = state.current_load,
            "Packet queued"
        );
        true
    }

    /// Receive every packet transmitted from now on, in FIFO order.
    ///
    /// A new subscription replaces the previous one.
    pub fn transmissions(&self) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().sink = Some(tx);
        rx
    }

    /// Stop draining. Queued packets stay queued and `enqueue` keeps working
    /// against the frozen load.
    ///
    /// Once this returns no further packet is transmitted, even by a tick
    /// that was already in flight. Calling it again has no effect.
    pub fn stop(&self) {
        self.state.lock().running = false;
        self.ticker.stop();
    }

    /// Stop draining and wait for the background task to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.ticker.join().await
    }

    /// Get the total weight currently queued.
    pub fn current_load(&self) -> u64 {
        self.state.lock().current_load
    }

    /// Number of packets waiting.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Get the maximum total queued weight.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether the drain task is still applying ticks.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Get a point-in-time view of the bucket.
    pub fn snapshot(&self) -> LeakyBucketSnapshot {
        let state = self.state.lock();
        LeakyBucketSnapshot {
            capacity: self.capacity,
            leak_per_tick: self.leak_per_tick,
            tick_interval_ms: millis(self.tick_interval),
            current_load: state.current_load,
            queued: state.queue.len(),
            transmitted: state.transmitted,
            running: state.running,
        }
    }
}

fn drain(state: &Mutex<QueueState>, leak_per_tick: u64) {
    let mut state = state.lock();
    if !state.running {
        return;
    }

    let mut budget = leak_per_tick;
    while let Some(head) = state.queue.front().copied() {
        if head.weight() > budget {
            break;
        }
        state.queue.pop_front();
        budget -= head.weight();
        state.current_load -= head.weight();
        state.transmitted += 1;
        debug!(id = head.id, weight = head.weight(), "Packet transmitted");

        let delivered = state.sink.as_ref().map_or(true, |sink| sink.send(head).is_ok());
        if !delivered {
            trace!("Transmission receiver dropped");
            state.sink = None;
        }
    }

    if state.queue.is_empty() {
        debug!("No packets in the bucket");
    }
}

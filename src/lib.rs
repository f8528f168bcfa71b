//! Tollgate - in-process admission control
//!
//! This crate provides three interchangeable rate limiters guarding a single
//! resource each: a fixed window counter, a token bucket refilled by a
//! background task, and a leaky bucket that queues weighted packets and
//! drains them at a fixed rate. Decisions are synchronous and never block.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, TollgateError};
pub use ratelimit::{
    Clock, FixedWindowLimiter, LeakyBucketLimiter, Limiter, ManualClock, Packet, TokenBucketLimiter,
    TokioClock,
};

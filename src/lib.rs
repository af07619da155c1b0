//! Turnstile - per-key rate limiting
//!
//! This crate implements fixed window, sliding window, token bucket and
//! leaky bucket limiters over a pluggable storage backend: an in-process
//! concurrent map, or Redis for limits shared between processes. Backend
//! failures are turned into decisions by a fail-open or fail-closed policy.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod storage;

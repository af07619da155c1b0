//! State layout shared by the token and leaky buckets.

use std::time::Duration;

use crate::storage::KeyCommands;

/// Hash field holding tokens (token bucket) or water (leaky bucket).
pub const LEVEL: &str = "level";
/// Hash field holding the timestamp of the last refill or leak.
pub const LAST_UPDATE: &str = "last_update";

/// Bucket state as stored under one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens within `[0, limit]`, or water within `[0, limit + 1)`
    pub level: f64,
    /// Microseconds since the Unix epoch
    pub last_update: i64,
}

impl BucketState {
    /// Read the state, `None` if either field is missing.
    pub(crate) fn load(commands: &mut dyn KeyCommands) -> Option<Self> {
        match commands.hmget(&[LEVEL, LAST_UPDATE])[..] {
            [Some(level), Some(last_update)] => Some(Self {
                level,
                last_update: last_update as i64,
            }),
            _ => None,
        }
    }

    /// Write both fields together.
    pub(crate) fn store(&self, commands: &mut dyn KeyCommands, ttl: Duration) {
        commands.hmset(
            &[(LEVEL, self.level), (LAST_UPDATE, self.last_update as f64)],
            ttl,
        );
    }

    /// Time elapsed since the last update, zero if the clock went backwards.
    pub(crate) fn elapsed_since(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_update).max(0)
    }
}

//! Leaky bucket (as a meter).

use std::time::Duration;
use tracing::trace;

use super::algorithm::Algorithm;
use super::bucket::BucketState;
use crate::clock::micros;
use crate::config::Strategy;
use crate::storage::{ttl_millis, KeyCommands, Script, Storage, StorageResult};

const LEAK_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'level', 'last_update')
local water = tonumber(state[1])
local last = tonumber(state[2])
if water == nil or last == nil then
  water = 0
  last = now
end

if now > last then
  water = math.max(0, water - (now - last) * limit / window)
  last = now
end

local allowed = 0
if water < limit then
  water = water + 1
  allowed = 1
end

redis.call('HSET', KEYS[1],
  'level', string.format('%.17g', water),
  'last_update', string.format('%.17g', last))
redis.call('PEXPIRE', KEYS[1], ttl)
return allowed
"#;

/// Water drains at `limit / window`. A request is admitted while the level is
/// below `limit` and adds one unit, so a partly drained bucket can briefly
/// hold up to just under `limit + 1`.
///
/// The bucket starts empty and an idle key expires after one window, which is
/// exactly how long a full bucket takes to drain.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    limit: u64,
    window: Duration,
}

impl LeakyBucket {
    pub const PREFIX: &'static str = "lb";

    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Apply one request to `state` at `now`.
    ///
    /// Returns the new state and whether the request was admitted.
    pub fn step(&self, state: Option<BucketState>, now: i64) -> (BucketState, bool) {
        leak(state, now, self.limit as f64, micros(self.window))
    }
}

fn leak(state: Option<BucketState>, now: i64, limit: f64, window: i64) -> (BucketState, bool) {
    let mut bucket = state.unwrap_or(BucketState {
        level: 0.0,
        last_update: now,
    });

    let elapsed = bucket.elapsed_since(now);
    if elapsed > 0 {
        bucket.level = (bucket.level - elapsed as f64 * limit / window as f64).max(0.0);
        bucket.last_update = now;
    }

    let allowed = bucket.level < limit;
    if allowed {
        bucket.level += 1.0;
    }
    (bucket, allowed)
}

struct LeakScript {
    limit: u64,
    window: i64,
    now: i64,
    ttl: Duration,
}

impl Script for LeakScript {
    fn source(&self) -> &'static str {
        LEAK_LUA
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.limit.to_string(),
            self.window.to_string(),
            self.now.to_string(),
            ttl_millis(self.ttl).to_string(),
        ]
    }

    fn run(&self, commands: &mut dyn KeyCommands) -> i64 {
        let state = BucketState::load(commands);
        let (next, allowed) = leak(state, self.now, self.limit as f64, self.window);
        next.store(commands, self.ttl);
        allowed as i64
    }
}

impl Algorithm for LeakyBucket {
    fn strategy(&self) -> Strategy {
        Strategy::LeakyBucket
    }

    fn prefix(&self) -> &'static str {
        Self::PREFIX
    }

    fn check(&self, storage: &dyn Storage, key: &str, now: i64) -> StorageResult<bool> {
        let script = LeakScript {
            limit: self.limit,
            window: micros(self.window),
            now,
            ttl: self.window,
        };
        let allowed = storage.eval(key, &script)? == 1;
        trace!(key = %key, allowed, "Leaky bucket decision");
        Ok(allowed)
    }
}

//! Token bucket with continuous refill.

use std::time::Duration;
use tracing::trace;

use super::algorithm::Algorithm;
use super::bucket::BucketState;
use crate::clock::micros;
use crate::config::Strategy;
use crate::storage::{ttl_millis, KeyCommands, Script, Storage, StorageResult};

const REFILL_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'level', 'last_update')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = limit
  last = now
end

if now > last then
  tokens = math.min(limit, tokens + (now - last) * limit / window)
  last = now
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1],
  'level', string.format('%.17g', tokens),
  'last_update', string.format('%.17g', last))
redis.call('PEXPIRE', KEYS[1], ttl)
return allowed
"#;

/// Allows bursts up to `limit`, refilling at `limit / window` tokens per unit
/// of time with real-valued accounting.
///
/// The bucket starts full. State expires after one idle window, by which time
/// it would have refilled completely anyway.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    limit: u64,
    window: Duration,
}

impl TokenBucket {
    pub const PREFIX: &'static str = "tb";

    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Apply one request to `state` at `now`.
    ///
    /// Returns the new state and whether the request was admitted.
    pub fn step(&self, state: Option<BucketState>, now: i64) -> (BucketState, bool) {
        refill(state, now, self.limit as f64, micros(self.window))
    }
}

fn refill(state: Option<BucketState>, now: i64, limit: f64, window: i64) -> (BucketState, bool) {
    let mut bucket = state.unwrap_or(BucketState {
        level: limit,
        last_update: now,
    });

    let elapsed = bucket.elapsed_since(now);
    if elapsed > 0 {
        bucket.level = limit.min(bucket.level + elapsed as f64 * limit / window as f64);
        bucket.last_update = now;
    }

    let allowed = bucket.level >= 1.0;
    if allowed {
        bucket.level -= 1.0;
    }
    (bucket, allowed)
}

/// One refill-and-take, as a storage script.
struct RefillScript {
    limit: u64,
    window: i64,
    now: i64,
    ttl: Duration,
}

impl Script for RefillScript {
    fn source(&self) -> &'static str {
        REFILL_LUA
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
        let (next, allowed) = refill(state, self.now, self.limit as f64, self.window);
        next.store(commands, self.ttl);
        allowed as i64
    }
}

impl Algorithm for TokenBucket {
    fn strategy(&self) -> Strategy {
        Strategy::TokenBucket
    }

    fn prefix(&self) -> &'static str {
        Self::PREFIX
    }

    fn check(&self, storage: &dyn Storage, key: &str, now: i64) -> StorageResult<bool> {
        let script = RefillScript {
            limit: self.limit,
            window: micros(self.window),
            now,
            ttl: self.window,
        };
        let allowed = storage.eval(key, &script)? == 1;
        trace!(key = %key, allowed, "Token bucket decision");
        Ok(allowed)
    }
}

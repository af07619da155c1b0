//! Sliding window limiters.
//!
//! [`SlidingWindow`] keeps one sorted-set entry per admitted request and is
//! exact: no trailing window of length `window` ever holds more than `limit`
//! admissions. [`WeightedSlidingWindow`] keeps two counters and interpolates
//! between them, trading a bounded overshoot at unlucky phase alignment for
//! constant-size state.

use std::time::Duration;
use tracing::trace;

use super::algorithm::Algorithm;
use crate::clock::micros;
use crate::config::Strategy;
use crate::storage::{ttl_millis, KeyCommands, Script, Storage, StorageResult};

const LOG_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', string.format('%.17g', now - window))
if redis.call('ZCARD', KEYS[1]) < limit then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[5])
  redis.call('PEXPIRE', KEYS[1], ttl)
  return 1
end
return 0
"#;

const WEIGHTED_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'previous', 'current', 'window_start')
local previous = tonumber(state[1]) or 0
local current = tonumber(state[2]) or 0
local start = tonumber(state[3])
if start == nil then
  previous = 0
  current = 0
  start = now
end

local elapsed = now - start
if elapsed >= window then
  local intervals = math.floor(elapsed / window)
  if intervals == 1 then
    previous = current
  else
    previous = 0
  end
  current = 0
  start = start + intervals * window
  elapsed = now - start
end

local ratio = 0
if elapsed > 0 then
  ratio = elapsed / window
end

local allowed = 0
if previous * (1 - ratio) + current < limit then
  current = current + 1
  allowed = 1
end

redis.call('HSET', KEYS[1],
  'previous', string.format('%.17g', previous),
  'current', string.format('%.17g', current),
  'window_start', string.format('%.17g', start))
redis.call('PEXPIRE', KEYS[1], ttl)
return allowed
"#;

/// Exact sliding log over a sorted set of request timestamps.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: u64,
    window: Duration,
}

impl SlidingWindow {
    pub const PREFIX: &'static str = "sw";

    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

struct LogScript {
    limit: u64,
    window: i64,
    now: i64,
    member: String,
    ttl: Duration,
}

impl Script for LogScript {
    fn source(&self) -> &'static str {
        LOG_LUA
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.limit.to_string(),
            self.window.to_string(),
            self.now.to_string(),
            ttl_millis(self.ttl).to_string(),
            self.member.clone(),
        ]
    }

    fn run(&self, commands: &mut dyn KeyCommands) -> i64 {
        // Entries at exactly `now - window` have left the window.
        commands.zrem_range_by_score(f64::NEG_INFINITY, (self.now - self.window) as f64);
        if (commands.zcard() as u64) < self.limit {
            commands.zadd(self.now as f64, &self.member, self.ttl);
            1
        } else {
            0
        }
    }
}

impl Algorithm for SlidingWindow {
    fn strategy(&self) -> Strategy {
        Strategy::SlidingWindow
    }

    fn prefix(&self) -> &'static str {
        Self::PREFIX
    }

    fn check(&self, storage: &dyn Storage, key: &str, now: i64) -> StorageResult<bool> {
        // Members must be unique even when two processes stamp the same
        // microsecond.
        let script = LogScript {
            limit: self.limit,
            window: micros(self.window),
            now,
            member: format!("{}-{:016x}", now, rand::random::<u64>()),
            ttl: self.window,
        };
        let allowed = storage.eval(key, &script)? == 1;
        trace!(key = %key, allowed, "Sliding window decision");
        Ok(allowed)
    }
}

/// Counter state of the weighted approximation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedState {
    pub previous: f64,
    pub current: f64,
    /// Start of the current sub-window, microseconds since the Unix epoch
    pub window_start: i64,
}

const PREVIOUS: &str = "previous";
const CURRENT: &str = "current";
const WINDOW_START: &str = "window_start";

/// Two fixed sub-window counters, with the previous one weighted by how much
/// of it still overlaps the trailing window.
///
/// Can admit up to about `2 * limit` in one trailing window when traffic is
/// concentrated at the end of one sub-window and the start of the next.
#[derive(Debug, Clone)]
pub struct WeightedSlidingWindow {
    limit: u64,
    window: Duration,
}

impl WeightedSlidingWindow {
    pub const PREFIX: &'static str = "swc";

    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Apply one request to `state` at `now`.
    pub fn step(&self, state: Option<WeightedState>, now: i64) -> (WeightedState, bool) {
        weigh(state, now, self.limit as f64, micros(self.window))
    }
}

fn weigh(state: Option<WeightedState>, now: i64, limit: f64, window: i64) -> (WeightedState, bool) {
    let mut state = state.unwrap_or(WeightedState {
        previous: 0.0,
        current: 0.0,
        window_start: now,
    });

    let mut elapsed = now - state.window_start;
    if elapsed >= window {
        let intervals = elapsed / window;
        state.previous = if intervals == 1 { state.current } else { 0.0 };
        state.current = 0.0;
        state.window_start += intervals * window;
        elapsed = now - state.window_start;
    }

    let ratio = if elapsed > 0 {
        elapsed as f64 / window as f64
    } else {
        0.0
    };

    let allowed = state.previous * (1.0 - ratio) + state.current < limit;
    if allowed {
        state.current += 1.0;
    }
    (state, allowed)
}

struct WeightedScript {
    limit: u64,
    window: i64,
    now: i64,
    ttl: Duration,
}

impl Script for WeightedScript {
    fn source(&self) -> &'static str {
        WEIGHTED_LUA
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
        let state = match commands.hmget(&[PREVIOUS, CURRENT, WINDOW_START])[..] {
            [previous, current, Some(window_start)] => Some(WeightedState {
                previous: previous.unwrap_or(0.0),
                current: current.unwrap_or(0.0),
                window_start: window_start as i64,
            }),
            _ => None,
        };
        let (next, allowed) = weigh(state, self.now, self.limit as f64, self.window);
        commands.hmset(
            &[
                (PREVIOUS, next.previous),
                (CURRENT, next.current),
                (WINDOW_START, next.window_start as f64),
            ],
            self.ttl,
        );
        allowed as i64
    }
}

impl Algorithm for WeightedSlidingWindow {
    fn strategy(&self) -> Strategy {
        Strategy::SlidingWindow
    }

    fn prefix(&self) -> &'static str {
        Self::PREFIX
    }

    fn check(&self, storage: &dyn Storage, key: &str, now: i64) -> StorageResult<bool> {
        // The previous sub-window must outlive the current one.
        let script = WeightedScript {
            limit: self.limit,
            window: micros(self.window),
            now,
            ttl: self.window.saturating_mul(2),
        };
        let allowed = storage.eval(key, &script)? == 1;
        trace!(key = %key, allowed, "Weighted sliding window decision");
        Ok(allowed)
    }
}

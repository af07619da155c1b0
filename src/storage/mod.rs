//! Backend-agnostic storage for rate limit state.
//!
//! Every operation is keyed by one storage key and is atomic with respect to
//! other callers on that key. A multi-step read-modify-write is only atomic
//! when it is expressed as a [`Script`] and handed to [`Storage::eval`]: the
//! in-process backend runs it under the key's lock, the Redis backend runs
//! its Lua rendering server-side.

mod memory;
mod redis_storage;

pub use memory::MemoryStorage;
pub use redis_storage::RedisStorage;

use std::time::Duration;

use crate::error::BackendUnavailable;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, BackendUnavailable>;

/// Storage contract shared by all backends.
///
/// Reads of absent or expired keys return the zero value of the operation
/// (`0`, an empty list, `None` fields) rather than an error.
///
/// Each key holds one shape (scalar, list, sorted set or hash). Reading a key
/// through an operation of another shape is backend-specific: the in-process
/// backend sees the zero value, Redis replies `WRONGTYPE`, which surfaces as
/// [`BackendUnavailable`]. Algorithm prefixes keep each key to one shape.
pub trait Storage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Increment a counter. An absent or expired counter starts at 1 with `ttl`;
    /// an existing counter keeps its expiry.
    fn incr(&self, key: &str, ttl: Duration) -> StorageResult<i64>;

    /// Read a scalar, `0.0` when absent.
    ///
    /// A key of another shape reads as `0.0` in memory and fails on Redis.
    fn get(&self, key: &str) -> StorageResult<f64>;

    /// Store a scalar and refresh `ttl`.
    fn set(&self, key: &str, value: f64, ttl: Duration) -> StorageResult<()>;

    /// Append a timestamp to a list and refresh `ttl`.
    fn append_list(&self, key: &str, value: i64, ttl: Duration) -> StorageResult<()>;

    /// Read every retained list entry, oldest first.
    fn get_list(&self, key: &str) -> StorageResult<Vec<i64>>;

    /// Keep only the `keep` most recent list entries.
    fn trim_list(&self, key: &str, keep: usize) -> StorageResult<()>;

    /// Add `member` with `score` to a sorted set and refresh `ttl`.
    fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> StorageResult<()>;

    /// Remove members with `min <= score <= max`, returning how many went.
    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StorageResult<usize>;

    /// Number of members in a sorted set.
    fn zcard(&self, key: &str) -> StorageResult<usize>;

    /// Members with `min <= score <= max`, lowest score first.
    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>>;

    /// Write several hash fields together and refresh `ttl`.
    fn hmset(&self, key: &str, fields: &[(&str, f64)], ttl: Duration) -> StorageResult<()>;

    /// Read several hash fields together.
    fn hmget(&self, key: &str, fields: &[&str]) -> StorageResult<Vec<Option<f64>>>;

    /// Run `script` atomically against `key`.
    fn eval(&self, key: &str, script: &dyn Script) -> StorageResult<i64>;
}

/// Primitive operations on a single, already-serialized key.
///
/// This is the vocabulary in which the in-process rendering of a [`Script`]
/// is written. Errors cannot occur at this level.
pub trait KeyCommands {
    /// Scalar value, `0.0` when absent.
    fn get(&mut self) -> f64;
    /// Store a scalar and refresh `ttl`.
    fn set(&mut self, value: f64, ttl: Duration);
    /// Increment; `ttl` applies only when the counter is created.
    fn incr(&mut self, ttl: Duration) -> i64;
    /// Append to the list and refresh `ttl`.
    fn append_list(&mut self, value: i64, ttl: Duration);
    /// All list entries, oldest first.
    fn list(&mut self) -> Vec<i64>;
    /// Keep the `keep` most recent list entries.
    fn trim_list(&mut self, keep: usize);
    /// Add or move `member` to `score` and refresh `ttl`.
    fn zadd(&mut self, score: f64, member: &str, ttl: Duration);
    /// Remove members with `min <= score <= max`.
    fn zrem_range_by_score(&mut self, min: f64, max: f64) -> usize;
    /// Sorted set size.
    fn zcard(&mut self) -> usize;
    /// Members with `min <= score <= max`, lowest first.
    fn zrange_by_score(&mut self, min: f64, max: f64) -> Vec<String>;
    /// Write hash fields and refresh `ttl`.
    fn hmset(&mut self, fields: &[(&str, f64)], ttl: Duration);
    /// Read hash fields, `None` for each absent one.
    fn hmget(&mut self, fields: &[&str]) -> Vec<Option<f64>>;
}

/// An atomic read-modify-write over one key.
///
/// `source` and `args` are evaluated by script-capable remote backends with
/// the storage key as `KEYS[1]`; `run` is the equivalent in-process program.
/// Both renderings must agree on state layout and return value.
pub trait Script {
    /// Lua source.
    fn source(&self) -> &'static str;

    /// `ARGV` for the Lua source.
    fn args(&self) -> Vec<String>;

    /// In-process rendering, executed while the key is locked.
    fn run(&self, commands: &mut dyn KeyCommands) -> i64;
}

/// TTL in whole milliseconds, never zero.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    // Round up so sub-millisecond remainders do not shorten the window.
    if Duration::from_millis(millis) < ttl {
        millis.saturating_add(1).max(1)
    } else {
        millis.max(1)
    }
}

/// Format a number so it round-trips exactly through a string store.
pub(crate) fn format_number(value: f64) -> String {
    if value == f64::INFINITY {
        "+inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        value.to_string()
    }
}

//! The algorithm seam shared by all strategies.

use std::fmt;

use crate::config::Strategy;
use crate::storage::{Storage, StorageResult};

/// A rate limiting algorithm.
///
/// An algorithm owns no per-key state itself: everything lives in the storage
/// backend under `key`, and `check` performs one admission decision as a
/// single atomic storage operation.
pub trait Algorithm: Send + Sync + fmt::Debug {
    /// The strategy this algorithm implements.
    fn strategy(&self) -> Strategy;

    /// Storage key prefix, unique per algorithm variant.
    fn prefix(&self) -> &'static str;

    /// Decide whether one more request on `key` may proceed at `now`
    /// (microseconds since the Unix epoch), updating stored state.
    fn check(&self, storage: &dyn Storage, key: &str, now: i64) -> StorageResult<bool>;
}

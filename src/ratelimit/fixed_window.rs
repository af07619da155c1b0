//! Fixed window counter.

use std::time::Duration;
use tracing::trace;

use super::algorithm::Algorithm;
use crate::config::Strategy;
use crate::storage::{Storage, StorageResult};

/// Counts requests in windows anchored at the first request of each window.
///
/// The window boundary is the backend TTL of the counter, so a key can see up
/// to `2 * limit` admissions across a boundary: `limit` at the end of one
/// window and `limit` again at the start of the next.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
}

impl FixedWindow {
    pub const PREFIX: &'static str = "fw";

    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl Algorithm for FixedWindow {
    fn strategy(&self) -> Strategy {
        Strategy::FixedWindow
    }

    fn prefix(&self) -> &'static str {
        Self::PREFIX
    }

    fn check(&self, storage: &dyn Storage, key: &str, _now: i64) -> StorageResult<bool> {
        let count = storage.incr(key, self.window)?;
        trace!(key = %key, count, limit = self.limit, "Fixed window count");
        Ok(u64::try_from(count).map_or(false, |count| count <= self.limit))
    }
}

//! In-process storage backend.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{KeyCommands, Script, Storage, StorageResult};
use crate::clock::{micros, Clock, SystemClock};

/// Value held by one key. A key has exactly one shape at a time; writing a
/// different shape replaces it and reading the wrong shape sees nothing.
#[derive(Debug, Default)]
enum Value {
    #[default]
    Empty,
    Scalar(f64),
    List(Vec<i64>),
    Sorted(Vec<(f64, String)>),
    Hash(HashMap<String, f64>),
}

/// State cell for one storage key.
#[derive(Debug, Default)]
struct Slot {
    value: Value,
    /// Expiry in clock microseconds
    expires_at: Option<i64>,
}

impl Slot {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn clear(&mut self) {
        self.value = Value::Empty;
        self.expires_at = None;
    }
}

/// Applies [`KeyCommands`] to one locked slot at a fixed instant.
struct SlotCommands<'a> {
    slot: &'a mut Slot,
    now: i64,
}

impl SlotCommands<'_> {
    fn touch(&mut self, ttl: Duration) {
        self.slot.expires_at = Some(self.now.saturating_add(micros(ttl)));
    }

    fn list_mut(&mut self) -> &mut Vec<i64> {
        if !matches!(self.slot.value, Value::List(_)) {
            self.slot.value = Value::List(Vec::new());
        }
        match &mut self.slot.value {
            Value::List(entries) => entries,
            _ => unreachable!("slot was just set to a list"),
        }
    }

    fn sorted_mut(&mut self) -> &mut Vec<(f64, String)> {
        if !matches!(self.slot.value, Value::Sorted(_)) {
            self.slot.value = Value::Sorted(Vec::new());
        }
        match &mut self.slot.value {
            Value::Sorted(members) => members,
            _ => unreachable!("slot was just set to a sorted set"),
        }
    }

    fn hash_mut(&mut self) -> &mut HashMap<String, f64> {
        if !matches!(self.slot.value, Value::Hash(_)) {
            self.slot.value = Value::Hash(HashMap::new());
        }
        match &mut self.slot.value {
            Value::Hash(fields) => fields,
            _ => unreachable!("slot was just set to a hash"),
        }
    }
}

impl KeyCommands for SlotCommands<'_> {
    fn get(&mut self) -> f64 {
        match self.slot.value {
            Value::Scalar(value) => value,
            _ => 0.0,
        }
    }

    fn set(&mut self, value: f64, ttl: Duration) {
        self.slot.value = Value::Scalar(value);
        self.touch(ttl);
    }

    fn incr(&mut self, ttl: Duration) -> i64 {
        match &mut self.slot.value {
            Value::Scalar(value) => {
                *value += 1.0;
                *value as i64
            }
            _ => {
                self.slot.value = Value::Scalar(1.0);
                self.touch(ttl);
                1
            }
        }
    }

    fn append_list(&mut self, value: i64, ttl: Duration) {
        self.list_mut().push(value);
        self.touch(ttl);
    }

    fn list(&mut self) -> Vec<i64> {
        match &self.slot.value {
            Value::List(entries) => entries.clone(),
            _ => Vec::new(),
        }
    }

    fn trim_list(&mut self, keep: usize) {
        if let Value::List(entries) = &mut self.slot.value {
            if entries.len() > keep {
                entries.drain(..entries.len() - keep);
            }
            if entries.is_empty() {
                self.slot.clear();
            }
        }
    }

    fn zadd(&mut self, score: f64, member: &str, ttl: Duration) {
        let members = self.sorted_mut();
        members.retain(|(_, existing)| existing != member);
        let at = members.partition_point(|(s, m)| (*s, m.as_str()) <= (score, member));
        members.insert(at, (score, member.to_string()));
        self.touch(ttl);
    }

    fn zrem_range_by_score(&mut self, min: f64, max: f64) -> usize {
        let Value::Sorted(members) = &mut self.slot.value else {
            return 0;
        };
        let before = members.len();
        members.retain(|(score, _)| *score < min || *score > max);
        let removed = before - members.len();
        if members.is_empty() {
            self.slot.clear();
        }
        removed
    }

    fn zcard(&mut self) -> usize {
        match &self.slot.value {
            Value::Sorted(members) => members.len(),
            _ => 0,
        }
    }

    fn zrange_by_score(&mut self, min: f64, max: f64) -> Vec<String> {
        match &self.slot.value {
            Value::Sorted(members) => members
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(_, member)| member.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn hmset(&mut self, fields: &[(&str, f64)], ttl: Duration) {
        let hash = self.hash_mut();
        for (field, value) in fields {
            hash.insert((*field).to_string(), *value);
        }
        self.touch(ttl);
    }

    fn hmget(&mut self, fields: &[&str]) -> Vec<Option<f64>> {
        match &self.slot.value {
            Value::Hash(hash) => fields.iter().map(|f| hash.get(*f).copied()).collect(),
            _ => vec![None; fields.len()],
        }
    }
}

/// Key count that triggers the first size-based sweep.
const SWEEP_THRESHOLD: usize = 1024;

/// Longest stretch of clock time between two sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Storage held in process memory.
///
/// Each key owns an independently locked slot, created on first access with
/// an atomic insert-if-absent. Operations on different keys never share a
/// lock beyond the brief map lookup.
///
/// Expired slots are reclaimed automatically by a sweep that runs on the
/// calling thread when the key count reaches a threshold (doubled from what
/// survives each sweep) or when [`SWEEP_INTERVAL`] has passed since the last
/// one.
#[derive(Debug)]
pub struct MemoryStorage {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    clock: Arc<dyn Clock>,
    sweep_at_len: AtomicUsize,
    next_sweep: AtomicI64,
    sweeping: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that computes expiry from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now_micros().saturating_add(micros(SWEEP_INTERVAL));
        Self {
            slots: DashMap::new(),
            clock,
            sweep_at_len: AtomicUsize::new(SWEEP_THRESHOLD),
            next_sweep: AtomicI64::new(next_sweep),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Number of keys currently tracked, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no keys are tracked at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop slots that are expired or empty and not in use by any caller.
    ///
    /// Runs automatically as keys accumulate; calling it directly forces a
    /// sweep now. Returns the number of reclaimed keys.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_micros();
        let before = self.slots.len();
        // The shard write lock is held during `retain`, so no new handle to a
        // slot can be cloned while its strong count is checked.
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let guard = slot.lock();
            !(guard.is_expired(now) || matches!(guard.value, Value::Empty))
        });
        let purged = before.saturating_sub(self.slots.len());
        if purged > 0 {
            debug!(purged, "Purged expired keys");
        }
        purged
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        // Map guards must be released before a sweep takes shard write locks.
        let existing = self.slots.get(key).map(|slot| Arc::clone(slot.value()));
        let (slot, created) = match existing {
            Some(slot) => (slot, false),
            None => {
                let entry = self.slots.entry(key.to_string()).or_insert_with(|| {
                    trace!(key = %key, "Creating storage slot");
                    Arc::new(Mutex::new(Slot::default()))
                });
                (Arc::clone(entry.value()), true)
            }
        };

        let now = self.clock.now_micros();
        let due_by_time = now >= self.next_sweep.load(Ordering::Relaxed);
        let due_by_size =
            created && self.slots.len() >= self.sweep_at_len.load(Ordering::Relaxed);
        if due_by_time || due_by_size {
            self.sweep(now);
        }
        slot
    }

    /// Purge expired slots and schedule the next sweep. Only one caller
    /// sweeps at a time; the others carry on.
    fn sweep(&self, now: i64) {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.purge_expired();
        let survivors = self.slots.len();
        self.sweep_at_len.store(
            survivors.saturating_mul(2).max(SWEEP_THRESHOLD),
            Ordering::Relaxed,
        );
        self.next_sweep
            .store(now.saturating_add(micros(SWEEP_INTERVAL)), Ordering::Relaxed);
        self.sweeping.store(false, Ordering::Release);
    }

    fn with_key<T>(&self, key: &str, op: impl FnOnce(&mut SlotCommands<'_>) -> T) -> T {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        let now = self.clock.now_micros();
        if guard.is_expired(now) {
            guard.clear();
        }
        let mut commands = SlotCommands {
            slot: &mut *guard,
            now,
        };
        op(&mut commands)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn incr(&self, key: &str, ttl: Duration) -> StorageResult<i64> {
        Ok(self.with_key(key, |c| c.incr(ttl)))
    }

    fn get(&self, key: &str) -> StorageResult<f64> {
        Ok(self.with_key(key, |c| c.get()))
    }

    fn set(&self, key: &str, value: f64, ttl: Duration) -> StorageResult<()> {
        self.with_key(key, |c| c.set(value, ttl));
        Ok(())
    }

    fn append_list(&self, key: &str, value: i64, ttl: Duration) -> StorageResult<()> {
        self.with_key(key, |c| c.append_list(value, ttl));
        Ok(())
    }

    fn get_list(&self, key: &str) -> StorageResult<Vec<i64>> {
        Ok(self.with_key(key, |c| c.list()))
    }

    fn trim_list(&self, key: &str, keep: usize) -> StorageResult<()> {
        self.with_key(key, |c| c.trim_list(keep));
        Ok(())
    }

    fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> StorageResult<()> {
        self.with_key(key, |c| c.zadd(score, member, ttl));
        Ok(())
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StorageResult<usize> {
        Ok(self.with_key(key, |c| c.zrem_range_by_score(min, max)))
    }

    fn zcard(&self, key: &str) -> StorageResult<usize> {
        Ok(self.with_key(key, |c| c.zcard()))
    }

    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>> {
        Ok(self.with_key(key, |c| c.zrange_by_score(min, max)))
    }

    fn hmset(&self, key: &str, fields: &[(&str, f64)], ttl: Duration) -> StorageResult<()> {
        self.with_key(key, |c| c.hmset(fields, ttl));
        Ok(())
    }

    fn hmget(&self, key: &str, fields: &[&str]) -> StorageResult<Vec<Option<f64>>> {
        Ok(self.with_key(key, |c| c.hmget(fields)))
    }

    fn eval(&self, key: &str, script: &dyn Script) -> StorageResult<i64> {
        Ok(self.with_key(key, |c| script.run(c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStorage) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let storage = MemoryStorage::with_clock(clock.clone());
        (clock, storage)
    }

    #[test]
    fn test_incr_starts_at_one_and_keeps_expiry() {
        let (clock, storage) = store();
        let ttl = Duration::from_secs(2);

        assert_eq!(storage.incr("fw:a", ttl).unwrap(), 1);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(storage.incr("fw:a", ttl).unwrap(), 2);

        // Expiry was fixed by the first increment, not the second.
        clock.advance(Duration::from_millis(600));
        assert_eq!(storage.incr("fw:a", ttl).unwrap(), 1);
    }

    #[test]
    fn test_get_absent_is_zero() {
        let (_, storage) = store();
        assert_eq!(storage.get("missing").unwrap(), 0.0);
        assert_eq!(storage.hmget("missing", &["a", "b"]).unwrap(), vec![None, None]);
        assert!(storage.get_list("missing").unwrap().is_empty());
        assert_eq!(storage.zcard("missing").unwrap(), 0);
    }

    #[test]
    fn test_set_then_get_is_identical() {
        let (_, storage) = store();
        let value = 2.0 / 3.0;
        storage.set("k", value, Duration::from_secs(1)).unwrap();
        assert_eq!(storage.get("k").unwrap(), value);

        let fields = [("level", 1.25), ("last_update", 1_700_000_000_000_001.0)];
        storage.hmset("h", &fields, Duration::from_secs(1)).unwrap();
        assert_eq!(
            storage.hmget("h", &["level", "last_update"]).unwrap(),
            vec![Some(1.25), Some(1_700_000_000_000_001.0)]
        );
    }

    #[test]
    fn test_set_refreshes_ttl() {
        let (clock, storage) = store();
        let ttl = Duration::from_millis(100);

        storage.set("k", 5.0, ttl).unwrap();
        clock.advance(Duration::from_millis(80));
        storage.set("k", 6.0, ttl).unwrap();
        clock.advance(Duration::from_millis(80));
        assert_eq!(storage.get("k").unwrap(), 6.0);

        clock.advance(Duration::from_millis(30));
        assert_eq!(storage.get("k").unwrap(), 0.0);
    }

    #[test]
    fn test_list_append_and_trim() {
        let (_, storage) = store();
        let ttl = Duration::from_secs(1);
        for ts in 1..=5 {
            storage.append_list("l", ts, ttl).unwrap();
        }
        assert_eq!(storage.get_list("l").unwrap(), vec![1, 2, 3, 4, 5]);

        storage.trim_list("l", 2).unwrap();
        assert_eq!(storage.get_list("l").unwrap(), vec![4, 5]);

        storage.trim_list("l", 0).unwrap();
        assert!(storage.get_list("l").unwrap().is_empty());
    }

    #[test]
    fn test_sorted_set_operations() {
        let (_, storage) = store();
        let ttl = Duration::from_secs(1);
        storage.zadd("z", 30.0, "c", ttl).unwrap();
        storage.zadd("z", 10.0, "a", ttl).unwrap();
        storage.zadd("z", 20.0, "b", ttl).unwrap();
        // Re-adding a member moves it instead of duplicating it.
        storage.zadd("z", 5.0, "c", ttl).unwrap();

        assert_eq!(storage.zcard("z").unwrap(), 3);
        assert_eq!(
            storage.zrange_by_score("z", f64::NEG_INFINITY, f64::INFINITY).unwrap(),
            vec!["c", "a", "b"]
        );

        assert_eq!(storage.zrem_range_by_score("z", f64::NEG_INFINITY, 10.0).unwrap(), 2);
        assert_eq!(storage.zrange_by_score("z", 0.0, 100.0).unwrap(), vec!["b"]);
    }

    #[test]
    fn test_wrong_shape_reads_empty_and_write_replaces() {
        let (_, storage) = store();
        let ttl = Duration::from_secs(1);
        storage.zadd("k", 1.0, "m", ttl).unwrap();
        assert_eq!(storage.get("k").unwrap(), 0.0);

        storage.set("k", 3.0, ttl).unwrap();
        assert_eq!(storage.zcard("k").unwrap(), 0);
        assert_eq!(storage.get("k").unwrap(), 3.0);
    }

    #[test]
    fn test_purge_expired() {
        let (clock, storage) = store();
        storage.set("short", 1.0, Duration::from_millis(10)).unwrap();
        storage.set("long", 1.0, Duration::from_secs(10)).unwrap();
        assert_eq!(storage.len(), 2);

        clock.advance(Duration::from_millis(20));
        assert_eq!(storage.purge_expired(), 1);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("long").unwrap(), 1.0);
    }

    #[test]
    fn test_expired_keys_are_reclaimed_after_idle_time() {
        let (clock, storage) = store();
        let ttl = Duration::from_millis(100);
        for i in 0..10_000 {
            storage.incr(&format!("fw:{}", i), ttl).unwrap();
        }
        assert_eq!(storage.len(), 10_000);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(storage.incr("fw:late", ttl).unwrap(), 1);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_expired_keys_are_reclaimed_as_count_grows() {
        let (clock, storage) = store();
        let ttl = Duration::from_millis(1);
        // Each key expires before the next is created; far less than one
        // sweep interval passes overall.
        for i in 0..2_000 {
            storage.set(&format!("k:{}", i), 1.0, ttl).unwrap();
            clock.advance(Duration::from_millis(2));
        }
        assert!(storage.len() < SWEEP_THRESHOLD, "len = {}", storage.len());
    }

    #[test]
    fn test_sweep_keeps_live_keys() {
        let (clock, storage) = store();
        storage.set("live", 7.0, Duration::from_secs(7200)).unwrap();
        storage.set("dead", 1.0, Duration::from_millis(5)).unwrap();

        clock.advance(Duration::from_secs(120));
        storage.get("other").unwrap();
        assert_eq!(storage.get("live").unwrap(), 7.0);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_concurrent_incr_is_serialized() {
        let (_, storage) = store();
        let ttl = Duration::from_secs(60);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        storage.incr("shared", ttl).unwrap();
                    }
                });
            }
        });

        assert_eq!(storage.get("shared").unwrap(), 2000.0);
        assert_eq!(storage.len(), 1);
    }
}

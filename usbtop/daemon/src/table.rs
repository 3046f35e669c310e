//! Concurrent per-endpoint byte accumulator
//!
//! Producers (perf readers, the kernel map poller) call [`AggregationTable::increment`]
//! from any task or thread; the collector drains it on its own timer.
//!
//! Keys are spread over sharded `RwLock<HashMap>`s. Adding to a known key
//! takes only the shard's read lock plus one atomic add, so producers never
//! wait on each other; the write lock is taken only to create or remove
//! entries. Every add happens while that read lock is held, which is what
//! lets [`AggregationTable::drain`] (atomic swap to zero) and
//! [`AggregationTable::prune`] (write lock) run concurrently without
//! losing bytes.

use std::{
    collections::{hash_map::DefaultHasher, hash_map::Entry, HashMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread,
};

use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::TransferKey;

/// Default number of lock shards
pub const DEFAULT_SHARDS: usize = 64;

/// What happens to a new key once the table is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Ignore the new key and count its bytes as rejected
    Reject,
    /// Evict the entry that was updated least recently
    LeastRecent,
}

/// Table sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Maximum number of keys (unbounded if None)
    pub max_entries: Option<usize>,
    /// Policy once `max_entries` is reached
    pub eviction: EvictionPolicy,
    /// Number of lock shards
    pub shards: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            eviction: EvictionPolicy::LeastRecent,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// Table health counters
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Keys currently tracked
    pub entries: usize,
    /// Increments dropped by the Reject policy
    pub rejected_increments: u64,
    /// Bytes dropped by the Reject policy
    pub rejected_bytes: u64,
    /// Keys removed by the LeastRecent policy
    pub evicted_keys: u64,
    /// Undrained bytes those keys still held
    pub evicted_bytes: u64,
}

struct Slot {
    bytes: AtomicU64,
    /// Update clock value of the last increment
    last_update: AtomicU64,
}

impl Slot {
    fn new(bytes: u64, stamp: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
            last_update: AtomicU64::new(stamp),
        }
    }

    #[inline]
    fn add(&self, bytes: u64, stamp: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
        self.last_update.fetch_max(stamp, Ordering::Relaxed);
    }
}

type Shard = RwLock<HashMap<TransferKey, Slot>>;

fn read(shard: &Shard) -> RwLockReadGuard<'_, HashMap<TransferKey, Slot>> {
    shard.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(shard: &Shard) -> RwLockWriteGuard<'_, HashMap<TransferKey, Slot>> {
    shard.write().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent map from [`TransferKey`] to a cumulative byte count
pub struct AggregationTable {
    shards: Vec<Shard>,
    config: TableConfig,
    len: AtomicUsize,
    /// Logical update clock, advanced by every increment; stamps entries
    /// for LRU eviction
    clock: AtomicU64,
    rejected_increments: AtomicU64,
    rejected_bytes: AtomicU64,
    evicted_keys: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl AggregationTable {
    pub fn new(config: TableConfig) -> Self {
        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(HashMap::new()));
        }

        Self {
            shards,
            config,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            rejected_increments: AtomicU64::new(0),
            rejected_bytes: AtomicU64::new(0),
            evicted_keys: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &TransferKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Add `amount` bytes to `key`, creating the entry at zero if needed
    ///
    /// Returns false only when the table is full and the key was rejected.
    /// A zero amount is a no-op and never creates an entry.
    pub fn increment(&self, key: TransferKey, amount: u64) -> bool {
        if amount == 0 {
            return true;
        }

        let shard = self.shard(&key);
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(slot) = read(shard).get(&key) {
            slot.add(amount, stamp);
            return true;
        }

        if !self.admit_new_key() {
            self.rejected_increments.fetch_add(1, Ordering::Relaxed);
            self.rejected_bytes.fetch_add(amount, Ordering::Relaxed);
            return false;
        }

        match write(shard).entry(key) {
            Entry::Occupied(entry) => {
                // Another producer created it first; give back our slot
                self.len.fetch_sub(1, Ordering::AcqRel);
                entry.get().add(amount, stamp);
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::new(amount, stamp));
            }
        }

        true
    }

    /// Reserve room for one more key, evicting if the policy allows
    ///
    /// Under LeastRecent this only returns once the key has room: lost
    /// races against other producers are retried, never turned into a
    /// rejection.
    fn admit_new_key(&self) -> bool {
        let Some(max) = self.config.max_entries else {
            self.len.fetch_add(1, Ordering::AcqRel);
            return true;
        };
        if max == 0 {
            return false;
        }

        loop {
            let current = self.len.load(Ordering::Acquire);
            if current < max {
                if self
                    .len
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            match self.config.eviction {
                EvictionPolicy::Reject => return false,
                EvictionPolicy::LeastRecent => {
                    if !self.evict_least_recent() {
                        // Every slot is reserved by a producer that has not
                        // inserted yet
                        thread::yield_now();
                    }
                }
            }
        }
    }

    /// Remove the least recently updated key
    ///
    /// Scans every shard, so admitting a new key into a full table costs
    /// O(max_entries); updates to known keys never get here.
    ///
    /// Returns false if there was nothing to evict.
    fn evict_least_recent(&self) -> bool {
        let mut oldest: Option<(usize, TransferKey, u64)> = None;

        for (idx, shard) in self.shards.iter().enumerate() {
            for (key, slot) in read(shard).iter() {
                let stamp = slot.last_update.load(Ordering::Relaxed);
                if oldest.map_or(true, |(_, _, seen)| stamp < seen) {
                    oldest = Some((idx, *key, stamp));
                }
            }
        }

        let Some((idx, key, stamp)) = oldest else {
            return false;
        };

        let mut guard = write(&self.shards[idx]);
        let still_oldest = guard
            .get(&key)
            .is_some_and(|slot| slot.last_update.load(Ordering::Relaxed) == stamp);
        // If it was touched or removed meanwhile the caller simply retries
        if still_oldest {
            if let Some(slot) = guard.remove(&key) {
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.evicted_keys.fetch_add(1, Ordering::Relaxed);
                self.evicted_bytes
                    .fetch_add(slot.bytes.into_inner(), Ordering::Relaxed);
                debug!("Evicted {} from aggregation table", key);
            }
        }

        true
    }

    /// Current value for `key`
    pub fn get(&self, key: &TransferKey) -> Option<u64> {
        read(self.shard(key))
            .get(key)
            .map(|slot| slot.bytes.load(Ordering::Acquire))
    }

    /// Iterate over (key, bytes) pairs
    ///
    /// Lazy: each shard is copied under its read lock only when the
    /// iterator reaches it. Every value is one the key actually held, but
    /// values of different keys may come from different instants.
    pub fn snapshot(&self) -> impl Iterator<Item = (TransferKey, u64)> + '_ {
        self.shards.iter().flat_map(|shard| {
            read(shard)
                .iter()
                .map(|(key, slot)| (*key, slot.bytes.load(Ordering::Acquire)))
                .collect::<Vec<_>>()
        })
    }

    /// Zero every counter and return the non-zero values it held
    ///
    /// Each counter is swapped to zero atomically, so a concurrent
    /// increment is either part of the returned value or stays in the
    /// table for the next drain. Keys stay in the table.
    pub fn drain(&self) -> Vec<(TransferKey, u64)> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            for (key, slot) in read(shard).iter() {
                let bytes = slot.bytes.swap(0, Ordering::AcqRel);
                if bytes > 0 {
                    drained.push((*key, bytes));
                }
            }
        }
        drained
    }

    /// Zero every counter, discarding the values
    pub fn reset(&self) {
        for shard in &self.shards {
            for slot in read(shard).values() {
                slot.bytes.store(0, Ordering::Release);
            }
        }
    }

    /// Remove keys matching `should_remove` whose counter is zero
    ///
    /// Keys still holding undrained bytes are kept, so pruning never
    /// discards traffic. Returns the number of keys removed.
    pub fn prune<F>(&self, mut should_remove: F) -> usize
    where
        F: FnMut(&TransferKey) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = write(shard);
            let before = guard.len();
            guard.retain(|key, slot| !(*slot.bytes.get_mut() == 0 && should_remove(key)));
            removed += before - guard.len();
        }

        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::AcqRel);
        }
        removed
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            entries: self.len(),
            rejected_increments: self.rejected_increments.load(Ordering::Relaxed),
            rejected_bytes: self.rejected_bytes.load(Ordering::Relaxed),
            evicted_keys: self.evicted_keys.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Default for AggregationTable {
    fn default() -> Self {
        Self::new(TableConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferType;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    fn bulk_in(device: u32) -> TransferKey {
        TransferKey::new(1, device, 0x1234, 0x5678, 0x81, TransferType::Bulk)
    }

    fn capped(max: usize, eviction: EvictionPolicy) -> AggregationTable {
        AggregationTable::new(TableConfig {
            max_entries: Some(max),
            eviction,
            shards: 4,
        })
    }

    #[test]
    fn test_increment_accumulates() {
        let table = AggregationTable::default();
        let key = bulk_in(5);

        assert!(table.increment(key, 64));
        assert_eq!(table.get(&key), Some(64));
        assert!(table.increment(key, 64));
        assert_eq!(table.get(&key), Some(128));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_zero_increment_creates_nothing() {
        let table = AggregationTable::default();
        table.increment(bulk_in(5), 0);

        assert!(table.is_empty());
        assert_eq!(table.get(&bulk_in(5)), None);
    }

    #[test]
    fn test_concurrent_increments_same_key() {
        let table = AggregationTable::default();
        let key = bulk_in(5);
        let threads = 8;
        let per_thread = 10_000;

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    for _ in 0..per_thread {
                        table.increment(key, 1);
                    }
                });
            }
        });

        assert_eq!(table.get(&key), Some(threads * per_thread));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_snapshot_returns_exact_sums() {
        let table = AggregationTable::default();
        let mut expected = HashMap::new();

        for device in 1..=20u32 {
            for amount in [512u64, 64, 8] {
                table.increment(bulk_in(device), amount * device as u64);
                *expected.entry(bulk_in(device)).or_insert(0u64) += amount * device as u64;
            }
        }

        let snapshot: HashMap<_, _> = table.snapshot().collect();
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn test_drain_returns_and_zeroes() {
        let table = AggregationTable::default();
        table.increment(bulk_in(1), 100);
        table.increment(bulk_in(2), 200);

        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![(bulk_in(1), 100), (bulk_in(2), 200)]);

        // Keys survive with zeroed counters and are not reported again
        assert_eq!(table.get(&bulk_in(1)), Some(0));
        assert!(table.drain().is_empty());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_drain_racing_increments_loses_nothing() {
        let table = AggregationTable::default();
        let key = bulk_in(7);
        let producers = 4u64;
        let per_producer = 50_000u64;
        let done = AtomicBool::new(false);

        let drained_total = thread::scope(|s| {
            let consumer = s.spawn(|| {
                let mut total = 0u64;
                while !done.load(Ordering::Acquire) {
                    total += table.drain().iter().map(|(_, bytes)| bytes).sum::<u64>();
                }
                total
            });

            let handles: Vec<_> = (0..producers)
                .map(|_| {
                    s.spawn(|| {
                        for _ in 0..per_producer {
                            table.increment(key, 1);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            done.store(true, Ordering::Release);

            consumer.join().unwrap()
        });

        let remainder: u64 = table.drain().iter().map(|(_, bytes)| bytes).sum();
        assert_eq!(drained_total + remainder, producers * per_producer);
    }

    #[test]
    fn test_snapshot_during_increments_sees_held_values() {
        let table = AggregationTable::default();
        let key = bulk_in(9);
        let producers = 4u64;
        let per_producer = 20_000u64;
        let done = AtomicBool::new(false);

        let observed = thread::scope(|s| {
            let consumer = s.spawn(|| {
                let mut observed = Vec::new();
                while !done.load(Ordering::Acquire) {
                    if let Some((_, bytes)) = table.snapshot().find(|(k, _)| *k == key) {
                        observed.push(bytes);
                    }
                }
                observed
            });

            let handles: Vec<_> = (0..producers)
                .map(|_| {
                    s.spawn(|| {
                        for _ in 0..per_producer {
                            table.increment(key, 1);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            done.store(true, Ordering::Release);

            consumer.join().unwrap()
        });

        let total = producers * per_producer;
        assert_eq!(table.get(&key), Some(total));
        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(observed.iter().all(|&bytes| bytes <= total));
    }

    #[test]
    fn test_reset_racing_increments() {
        let table = AggregationTable::default();
        let key = bulk_in(4);
        let producers = 4u64;
        let per_producer = 20_000u64;
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    table.reset();
                }
            });

            let handles: Vec<_> = (0..producers)
                .map(|_| {
                    s.spawn(|| {
                        for _ in 0..per_producer {
                            table.increment(key, 1);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            done.store(true, Ordering::Release);
        });

        let after_race = table.get(&key).unwrap_or(0);
        assert!(after_race <= producers * per_producer);

        // The table keeps working once the resets stop
        assert!(table.increment(key, 5));
        assert_eq!(table.get(&key), Some(after_race + 5));
    }

    #[test]
    fn test_reset_clears_counters() {
        let table = AggregationTable::default();
        table.increment(bulk_in(1), 10);
        table.reset();

        assert_eq!(table.get(&bulk_in(1)), Some(0));
        table.increment(bulk_in(1), 5);
        assert_eq!(table.get(&bulk_in(1)), Some(5));
    }

    #[test]
    fn test_reject_policy_caps_keys() {
        let table = capped(2, EvictionPolicy::Reject);

        assert!(table.increment(bulk_in(1), 10));
        assert!(table.increment(bulk_in(2), 10));
        assert!(!table.increment(bulk_in(3), 30));
        // Known keys still count
        assert!(table.increment(bulk_in(1), 10));

        assert_eq!(table.get(&bulk_in(1)), Some(20));
        assert_eq!(table.get(&bulk_in(3)), None);

        let stats = table.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.rejected_increments, 1);
        assert_eq!(stats.rejected_bytes, 30);
    }

    #[test]
    fn test_least_recent_policy_evicts_oldest() {
        let table = capped(2, EvictionPolicy::LeastRecent);

        table.increment(bulk_in(1), 10);
        table.increment(bulk_in(2), 10);
        table.drain();
        // Device 2 is touched after the drain, device 1 is not
        table.increment(bulk_in(2), 5);

        assert!(table.increment(bulk_in(3), 1));

        assert_eq!(table.get(&bulk_in(1)), None);
        assert_eq!(table.get(&bulk_in(2)), Some(5));
        assert_eq!(table.get(&bulk_in(3)), Some(1));

        let stats = table.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evicted_keys, 1);
        assert_eq!(stats.evicted_bytes, 0);
    }

    #[test]
    fn test_least_recent_follows_updates_between_drains() {
        let table = capped(2, EvictionPolicy::LeastRecent);

        table.increment(bulk_in(1), 10);
        table.increment(bulk_in(2), 10);
        table.increment(bulk_in(1), 10);

        assert!(table.increment(bulk_in(3), 1));

        assert_eq!(table.get(&bulk_in(1)), Some(20));
        assert_eq!(table.get(&bulk_in(2)), None);
        assert_eq!(table.get(&bulk_in(3)), Some(1));

        let stats = table.stats();
        assert_eq!(stats.evicted_keys, 1);
        assert_eq!(stats.evicted_bytes, 10);
    }

    #[test]
    fn test_least_recent_never_rejects_under_contention() {
        let table = capped(1, EvictionPolicy::LeastRecent);
        let threads = 8u32;
        let per_thread = 500u32;

        thread::scope(|s| {
            for t in 0..threads {
                let table = &table;
                s.spawn(move || {
                    for i in 0..per_thread {
                        assert!(table.increment(bulk_in(t * 1000 + i), 1));
                    }
                });
            }
        });

        let stats = table.stats();
        assert_eq!(stats.rejected_increments, 0);
        assert_eq!(stats.rejected_bytes, 0);
        assert_eq!(table.len(), 1);
        // Every distinct key was admitted once and all but one were evicted
        assert_eq!(stats.evicted_keys + table.len() as u64, (threads * per_thread) as u64);
    }

    #[test]
    fn test_capped_table_under_contention_stays_bounded() {
        let table = capped(16, EvictionPolicy::LeastRecent);

        thread::scope(|s| {
            for t in 0..4u32 {
                let table = &table;
                s.spawn(move || {
                    for device in 0..200u32 {
                        table.increment(bulk_in(t * 1000 + device), 1);
                    }
                });
            }
        });

        assert!(table.len() <= 16);
        assert_eq!(table.snapshot().count(), table.len());
    }

    #[test]
    fn test_prune_keeps_undrained_bytes() {
        let table = AggregationTable::default();
        table.increment(bulk_in(1), 10);
        table.increment(bulk_in(2), 10);
        table.drain();
        table.increment(bulk_in(2), 3);

        // Both match, but device 2 still holds bytes
        let removed = table.prune(|key| key.bus == 1);

        assert_eq!(removed, 1);
        assert_eq!(table.get(&bulk_in(1)), None);
        assert_eq!(table.get(&bulk_in(2)), Some(3));
        assert_eq!(table.len(), 1);
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use crate::time::{Duration, Instant};
use crate::{CacheKey, EntityKind, FetchedStats, StatsEntry};

/// A [`StatsEntry`] together with the sequence number of the write that produced it.
#[derive(Debug)]
struct StoredEntry {
    entry: StatsEntry,
    sequence: u64,
}

/// The synchronous key → [`StatsEntry`] map backing the cache.
///
/// No operation on the store suspends or performs I/O, and none of them can fail.
///
/// Entries are only ever removed by explicit invalidation. Staleness is decided when reading:
/// [`get`](Self::get) treats an entry older than the TTL as absent but leaves it in place until it
/// is superseded by a newer write.
///
/// Every write carries a sequence number. Fetches draw theirs when they start, and a result is
/// only written if no entry from a later-started fetch (or a later explicit [`set`](Self::set))
/// is already present. This keeps a slow, early fetch from overwriting newer data.
#[derive(Debug)]
pub struct StatsStore {
    ttl: Duration,
    entries: Mutex<FxHashMap<CacheKey, StoredEntry>>,
    sequence: AtomicU64,
}

impl StatsStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Default::default(),
            sequence: AtomicU64::new(1),
        }
    }

    /// The freshness window applied to every entry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // The map holds plain data and every critical section leaves it consistent, so a panic
    // elsewhere while holding the lock does not invalidate it.
    fn entries(&self) -> MutexGuard<'_, FxHashMap<CacheKey, StoredEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry for `key` if it is present and fresh.
    pub fn get(&self, key: &CacheKey) -> Option<StatsEntry> {
        let entries = self.entries();
        let stored = entries.get(key)?;
        stored
            .entry
            .is_fresh(self.ttl)
            .then(|| stored.entry.clone())
    }

    /// Whether a fresh entry exists for `key`.
    pub fn is_fresh(&self, key: &CacheKey) -> bool {
        self.entries()
            .get(key)
            .is_some_and(|stored| stored.entry.is_fresh(self.ttl))
    }

    /// Checks the freshness of all `keys` against a single snapshot of the store.
    ///
    /// The returned flags are in the same order as `keys`.
    pub fn partition<'a, I>(&self, keys: I) -> Vec<bool>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let entries = self.entries();
        keys.into_iter()
            .map(|key| {
                entries
                    .get(key)
                    .is_some_and(|stored| stored.entry.is_fresh(self.ttl))
            })
            .collect()
    }

    /// Writes an entry for `key`, stamped with the current time.
    ///
    /// This unconditionally replaces any prior entry, including ones written by fetches that are
    /// still running: their results will be discarded.
    pub fn set(&self, key: CacheKey, counts_by_category: BTreeMap<String, u64>, total: u64) {
        let sequence = self.next_sequence();
        let stats = FetchedStats::new(counts_by_category, total);
        self.write(key, sequence, stats);
    }

    /// Draws the sequence number for a write that is about to be started.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Writes the result of a fetch that drew `sequence` when it started.
    ///
    /// Returns `false` if the result was discarded because a newer write is already present.
    pub(crate) fn write(&self, key: CacheKey, sequence: u64, stats: FetchedStats) -> bool {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&key) {
            if existing.sequence > sequence {
                tracing::debug!(
                    key = %key,
                    sequence,
                    newer = existing.sequence,
                    "Discarding out-of-order fetch result",
                );
                return false;
            }
        }

        let entry = StatsEntry::from_fetched(stats, Instant::now());
        entries.insert(key, StoredEntry { entry, sequence });
        true
    }

    /// Removes the entry for `key`. Returns whether there was one.
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Removes all entries scoped to `owner`. Global entries are left alone.
    pub fn delete_by_owner(&self, owner: &str) -> usize {
        self.delete_where(|key| key.is_owned_by(owner))
    }

    /// Removes all entries for the given entity, across every scope.
    pub fn delete_by_entity(&self, kind: EntityKind, entity_id: &str) -> usize {
        self.delete_where(|key| key.refers_to(kind, entity_id))
    }

    /// Removes all entries.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let removed = entries.len();
        entries.clear();
        removed
    }

    fn delete_where<F: Fn(&CacheKey) -> bool>(&self, predicate: F) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        before - entries.len()
    }

    /// The number of entries held, including stale ones.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Partitioned index (spec §4.3, component C).
//!
//! Each partition owns an ordered map from [`Key`] to `Arc<Entry>` (ordering
//! comes from `Key`'s own `Ord`, which breaks ties on `(hash64, handle
//! bytes)` as spec §4.3 asks) plus an array of lock-free "most-recently
//! looked-up" hint slots. The partition lock is handed back to the caller
//! as a [`Latch`] so a single lookup-then-mutate sequence (miss → allocate
//! → insert) takes the lock exactly once: the guard object is returned to
//! the caller rather than re-acquired internally.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::entry::pool::EntryPool;
use crate::entry::{Entry, EntryId};
use crate::key::Key;

type Map = BTreeMap<Key, Arc<Entry>>;

/// Acquisition mode for [`Index::get_by_key_latched`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// Outcome of [`Index::set_latched`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Overwritten,
    Exists,
}

/// A held partition lock, returned by `get_by_key_latched` so the caller can
/// follow up with `set_latched`/`delete_latched` without a second lookup
/// (spec §4.3). Holds an owned (`Arc`-rooted) guard rather than a borrowed
/// one so it can outlive the call that produced it.
pub enum Latch {
    Shared { guard: ArcRwLockReadGuard<RawRwLock, Map>, partition: usize },
    Exclusive { guard: ArcRwLockWriteGuard<RawRwLock, Map>, partition: usize },
}

impl Latch {
    pub fn partition(&self) -> usize {
        match self {
            Latch::Shared { partition, .. } => *partition,
            Latch::Exclusive { partition, .. } => *partition,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, Latch::Exclusive { .. })
    }
}

struct Partition {
    entries: Arc<RwLock<Map>>,
    /// One lock-free hint per slot: `hash64 mod cache_slots` → an `EntryId`,
    /// `EntryId::NONE` when empty (spec §4.3 "updated lock-free via atomic
    /// pointer store" — we store an index rather than a pointer, matching
    /// the rest of this crate's no-`unsafe` intrusive-list convention).
    mru: Vec<AtomicU32>,
}

/// Shard-locked ordered map from backend key to cache entry (spec §4.3).
pub struct Index {
    partitions: Vec<Partition>,
    cache_slots: usize,
    pool: Arc<EntryPool>,
}

impl Index {
    pub fn new(n_partitions: usize, cache_slots: usize, pool: Arc<EntryPool>) -> Self {
        let n_partitions = n_partitions.max(1);
        let cache_slots = cache_slots.max(1);
        let partitions = (0..n_partitions)
            .map(|_| Partition {
                entries: Arc::new(RwLock::new(BTreeMap::new())),
                mru: (0..cache_slots).map(|_| AtomicU32::new(EntryId::NONE.0)).collect(),
            })
            .collect();
        Self { partitions, cache_slots, pool }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn mru_slot(&self, key: &Key) -> usize {
        (key.hash64() % self.cache_slots as u64) as usize
    }

    fn acquire(lock: &Arc<RwLock<Map>>, partition: usize, mode: LatchMode) -> Latch {
        match mode {
            LatchMode::Shared => Latch::Shared { guard: lock.read_arc(), partition },
            LatchMode::Exclusive => Latch::Exclusive { guard: lock.write_arc(), partition },
        }
    }

    fn lookup_in_latch(latch: &Latch, key: &Key) -> Option<Arc<Entry>> {
        match latch {
            Latch::Shared { guard, .. } => guard.get(key).cloned(),
            Latch::Exclusive { guard, .. } => guard.get(key).cloned(),
        }
    }

    /// spec §4.3 `get_by_key_latched`: consult the MRU hint lock-free, then
    /// fall back to the ordered map under the acquired latch.
    pub fn get_by_key_latched(&self, key: &Key, mode: LatchMode) -> (Option<Arc<Entry>>, Latch) {
        let partition_idx = key.partition_index(self.partitions.len());
        let partition = &self.partitions[partition_idx];
        let slot_idx = self.mru_slot(key);

        let hinted = EntryId(partition.mru[slot_idx].load(Ordering::Acquire));
        if hinted != EntryId::NONE {
            if let Some(entry) = self.pool.resolve(hinted) {
                if entry.key().as_ref() == Some(key) {
                    let latch = Self::acquire(&partition.entries, partition_idx, mode);
                    return (Some(entry), latch);
                }
            }
        }

        let latch = Self::acquire(&partition.entries, partition_idx, mode);
        let found = Self::lookup_in_latch(&latch, key);
        if let Some(entry) = &found {
            partition.mru[slot_idx].store(entry.id.0, Ordering::Release);
        }
        (found, latch)
    }

    /// spec §4.3 `set_latched`: insert or replace under an already-held
    /// exclusive latch, update the MRU slot, release the latch.
    ///
    /// Panics if `latch` is not exclusive or belongs to a different
    /// partition than `key` hashes to — both indicate a caller bug, not a
    /// recoverable runtime condition.
    pub fn set_latched(&self, latch: Latch, key: Key, entry: Arc<Entry>, overwrite: bool) -> SetOutcome {
        let partition_idx = key.partition_index(self.partitions.len());
        assert_eq!(latch.partition(), partition_idx, "latch/key partition mismatch");

        let mut guard = match latch {
            Latch::Exclusive { guard, .. } => guard,
            Latch::Shared { .. } => panic!("set_latched requires an exclusive latch"),
        };

        let outcome = if guard.contains_key(&key) {
            if !overwrite {
                return SetOutcome::Exists;
            }
            guard.insert(key.clone(), entry.clone());
            SetOutcome::Overwritten
        } else {
            guard.insert(key.clone(), entry.clone());
            SetOutcome::Inserted
        };

        let slot_idx = self.mru_slot(&key);
        self.partitions[partition_idx].mru[slot_idx].store(entry.id.0, Ordering::Release);
        outcome
    }

    /// spec §4.3 `delete_latched`: unlink `entry` from the ordered map and
    /// conservatively clear the MRU slot if it was pointing at `entry`.
    /// Keeps the latch held (returning it) unless `release` is set.
    pub fn delete_latched(&self, latch: Latch, entry: &Arc<Entry>, release: bool) -> Option<Latch> {
        let partition_idx = latch.partition();
        let mut guard = match latch {
            Latch::Exclusive { guard, .. } => guard,
            Latch::Shared { .. } => panic!("delete_latched requires an exclusive latch"),
        };

        if let Some(key) = entry.key() {
            guard.remove(&key);
            let slot_idx = self.mru_slot(&key);
            let partition = &self.partitions[partition_idx];
            // Conservative: clear unconditionally rather than re-checking
            // the stored id, since the entry being removed is exactly the
            // case a stale hint must not keep pointing at.
            let _ = partition.mru[slot_idx].compare_exchange(
                entry.id.0,
                EntryId::NONE.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }

        if release {
            None
        } else {
            Some(Latch::Exclusive { guard, partition: partition_idx })
        }
    }

    /// spec §4.3 `for_each`: visit every entry in every partition, holding
    /// each partition's lock in shared mode only for the duration of its
    /// own iteration.
    pub fn for_each(&self, mut cb: impl FnMut(&Key, &Arc<Entry>)) {
        for partition in &self.partitions {
            let guard = partition.entries.read();
            for (key, entry) in guard.iter() {
                cb(key, entry);
            }
        }
    }
}

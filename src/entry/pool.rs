//! Entry pool (spec §4.2, component B).
//!
//! "Entries are recycled from a pool." In this implementation the pool is a
//! growable slab of [`Entry`] slots (each permanently owning its three
//! rw-locks for the process lifetime — Rust drops locks as part of dropping
//! the `Entry`, so "destroy on free" means returning the slot to the free
//! queue, not literally tearing the lock down) plus a lock-free free-list of
//! vacant [`EntryId`]s, using a `crossbeam_queue::SegQueue` rather than an
//! async channel since allocation here is a fast synchronous path that gets
//! nothing from backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::RwLock;

use crate::backend::FileType;
use crate::entry::{Entry, EntryId, Variant};
use crate::key::Key;

/// Recycling pool for [`Entry`] records.
pub struct EntryPool {
    slots: RwLock<Vec<Arc<Entry>>>,
    free: SegQueue<EntryId>,
    /// Soft capacity (spec §6 `entries_hwmark`-adjacent sizing); exceeding it
    /// does not fail allocation outright but signals the caller ([`crate::ops`])
    /// that a `reap()` attempt is warranted first.
    capacity: usize,
    lanes: usize,
    live: AtomicUsize,
}

impl EntryPool {
    pub fn new(capacity: usize, lanes: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: SegQueue::new(),
            capacity,
            lanes: lanes.max(1),
            live: AtomicUsize::new(0),
        }
    }

    /// Number of entries currently allocated (occupied slots).
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Whether the pool is at or above its soft high-water capacity.
    pub fn at_capacity(&self) -> bool {
        self.live_count() >= self.capacity
    }

    /// Allocate (or recycle) a slot for a new entry. Returns `None` only if
    /// the pool is at capacity and has no vacant slot to recycle; the caller
    /// (spec §4.4 `get()`) is expected to run `reap()` first in that case.
    pub fn alloc(&self, key: Key, file_type: FileType, variant: Variant) -> Option<Arc<Entry>> {
        if let Some(id) = self.free.pop() {
            let entry = self.slots.read()[id.0 as usize].clone();
            entry.reset_for(key, file_type, variant);
            self.live.fetch_add(1, Ordering::SeqCst);
            return Some(entry);
        }

        if self.at_capacity() {
            return None;
        }

        let mut slots = self.slots.write();
        let id = EntryId(slots.len() as u32);
        let lane = (id.0 as usize) % self.lanes;
        let entry = Arc::new(Entry::blank(id, lane));
        entry.reset_for(key, file_type, variant);
        slots.push(entry.clone());
        drop(slots);
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(entry)
    }

    /// Resolve a stable [`EntryId`] back to its entry, e.g. while walking an
    /// LRU lane's intrusive list (spec §4.4).
    pub fn resolve(&self, id: EntryId) -> Option<Arc<Entry>> {
        if id == EntryId::NONE {
            return None;
        }
        self.slots.read().get(id.0 as usize).cloned()
    }

    /// Re-home an entry that [`crate::lru::LruEngine::reap`] pulled out of
    /// the index and lane queues, without the free-queue round trip `alloc`
    /// would otherwise take (spec §4.4: "removed from the index, marked
    /// CONDEMNED, returned for reuse").
    pub fn reuse(&self, entry: &Arc<Entry>, key: Key, file_type: FileType, variant: Variant) -> Arc<Entry> {
        entry.reset_for(key, file_type, variant);
        entry.clone()
    }

    /// Return a slot to the free list once its last reference has dropped
    /// (spec §4.4 `unref`: "free the record"). The `Entry` itself is not
    /// deallocated; its fields are blanked so the allocation can be reused.
    pub fn free(&self, entry: &Arc<Entry>) {
        entry.clear_key();
        entry.clear_handle();
        self.free.push(entry.id);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

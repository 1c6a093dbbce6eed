//! LRU queues and the reference protocol (spec §4.4, component D).
//!
//! Each lane owns four intrusive lists (`L1`, `L2`, `pinned`, `cleanup`)
//! built from the `prev`/`next` [`EntryId`] fields already living on
//! [`Entry`] — the lane's [`parking_lot::Mutex`] is the only thing that
//! makes mutating those fields safe: an index-based link with an external
//! lock, rather than raw pointers or `unsafe`.

pub mod reclaimer;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::entry::pool::EntryPool;
use crate::entry::{DescriptorStatus, Entry, EntryId, QueueId, Variant};
use crate::error::CacheError;
use crate::index::{Index, LatchMode};

/// Distinguishes a real caller reference from the reclaimer's short-lived
/// scan reference (spec §4.4: "scan refs must not be used to open a
/// descriptor").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefKind {
    Initial,
    Scan,
}

#[derive(Debug, Copy, Clone, Default)]
struct ListHead {
    head: EntryId,
    tail: EntryId,
}

#[derive(Default)]
struct Lists {
    l1: ListHead,
    l2: ListHead,
    pinned: ListHead,
    cleanup: ListHead,
}

struct Lane {
    state: Mutex<Lists>,
    pool: Arc<EntryPool>,
}

impl Lane {
    fn list_mut(lists: &mut Lists, q: QueueId) -> &mut ListHead {
        match q {
            QueueId::L1 => &mut lists.l1,
            QueueId::L2 => &mut lists.l2,
            QueueId::Pinned => &mut lists.pinned,
            QueueId::Cleanup => &mut lists.cleanup,
            QueueId::Detached => unreachable!("Detached entries are not linked into any list"),
        }
    }

    /// Remove `entry` from whichever list it currently sits in (`from`),
    /// re-pointing its neighbors. No-op if `entry` is `Detached`.
    fn unlink_locked(&self, lists: &mut Lists, entry: &Entry, from: QueueId) {
        if from == QueueId::Detached {
            return;
        }
        let prev = entry.prev();
        let next = entry.next();

        if prev != EntryId::NONE {
            if let Some(p) = self.pool.resolve(prev) {
                p.set_next(next);
            }
        }
        if next != EntryId::NONE {
            if let Some(n) = self.pool.resolve(next) {
                n.set_prev(prev);
            }
        }

        let list = Self::list_mut(lists, from);
        if list.head == entry.id {
            list.head = next;
        }
        if list.tail == entry.id {
            list.tail = prev;
        }

        entry.set_prev(EntryId::NONE);
        entry.set_next(EntryId::NONE);
    }

    /// Insert `entry` at the MRU end (tail) of `into`.
    fn push_back_locked(&self, lists: &mut Lists, entry: &Entry, into: QueueId) {
        let list = Self::list_mut(lists, into);
        entry.set_prev(list.tail);
        entry.set_next(EntryId::NONE);
        if list.tail != EntryId::NONE {
            if let Some(t) = self.pool.resolve(list.tail) {
                t.set_next(entry.id);
            }
        } else {
            list.head = entry.id;
        }
        list.tail = entry.id;
        entry.set_qid(into);
    }

    /// Insert `entry` at the LRU end (head) of `into` — used for the `L2 →
    /// L1` promotion, which lands at the cold end rather than the hot one
    /// (spec §4.4's table: "Move to LRU of L1 (promotion)").
    fn push_front_locked(&self, lists: &mut Lists, entry: &Entry, into: QueueId) {
        let list = Self::list_mut(lists, into);
        entry.set_next(list.head);
        entry.set_prev(EntryId::NONE);
        if list.head != EntryId::NONE {
            if let Some(h) = self.pool.resolve(list.head) {
                h.set_prev(entry.id);
            }
        } else {
            list.tail = entry.id;
        }
        list.head = entry.id;
        entry.set_qid(into);
    }

    fn move_locked(&self, lists: &mut Lists, entry: &Entry, into: QueueId, to_mru: bool) {
        let from = entry.qid();
        self.unlink_locked(lists, entry, from);
        if to_mru {
            self.push_back_locked(lists, entry, into);
        } else {
            self.push_front_locked(lists, entry, into);
        }
    }

    /// Peek the LRU-end (head) entry of `queue` without removing it.
    fn peek_lru(&self, queue: QueueId) -> Option<EntryId> {
        let lists = self.state.lock();
        let head = match queue {
            QueueId::L1 => lists.l1.head,
            QueueId::L2 => lists.l2.head,
            QueueId::Pinned => lists.pinned.head,
            QueueId::Cleanup => lists.cleanup.head,
            QueueId::Detached => EntryId::NONE,
        };
        if head == EntryId::NONE {
            None
        } else {
            Some(head)
        }
    }
}

/// The reference protocol plus the four-queue-per-lane LRU (spec §4.4).
pub struct LruEngine {
    lanes: Vec<Lane>,
    pool: Arc<EntryPool>,
}

impl LruEngine {
    pub fn new(n_lanes: usize, pool: Arc<EntryPool>) -> Self {
        let n_lanes = n_lanes.max(1);
        let lanes = (0..n_lanes)
            .map(|_| Lane { state: Mutex::new(Lists::default()), pool: pool.clone() })
            .collect();
        Self { lanes, pool }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// spec §4.4 `ref(entry, kind)`.
    pub fn ref_entry(&self, entry: &Arc<Entry>, kind: RefKind) -> Result<(), CacheError> {
        let lane = &self.lanes[entry.lane];
        let mut lists = lane.state.lock();

        if entry.qid() == QueueId::Cleanup {
            return Err(CacheError::Dead);
        }

        entry.refcnt_atomic().fetch_add(1, Ordering::SeqCst);

        match kind {
            RefKind::Initial => match entry.qid() {
                QueueId::L1 => lane.move_locked(&mut lists, entry, QueueId::L1, true),
                QueueId::L2 => lane.move_locked(&mut lists, entry, QueueId::L1, false),
                QueueId::Pinned => {}
                QueueId::Detached => lane.push_back_locked(&mut lists, entry, QueueId::L1),
                QueueId::Cleanup => unreachable!("checked above"),
            },
            RefKind::Scan => {
                // Scan-resistance: only an L2→L2 MRU touch is allowed, L1 is
                // left alone and L2→L1 promotion never happens on this path.
                if entry.qid() == QueueId::L2 {
                    lane.move_locked(&mut lists, entry, QueueId::L2, true);
                }
            }
        }

        Ok(())
    }

    /// spec §4.4 `unref(entry)`.
    pub fn unref(&self, entry: &Arc<Entry>) {
        let before = entry.refcnt_atomic().fetch_sub(1, Ordering::SeqCst);
        if before != 1 {
            return; // still reachable (>= the sentinel) or someone else will finalize
        }

        let lane = &self.lanes[entry.lane];
        let mut lists = lane.state.lock();
        if entry.refcnt() != 0 {
            // Raced with a concurrent ref() between our fetch_sub and taking
            // the lane lock; the entry is alive again, abandon teardown.
            return;
        }
        lane.unlink_locked(&mut lists, entry, entry.qid());
        entry.mark_condemned();
        drop(lists);

        // External state is not torn down here: the shutdown-only lock-free
        // path (`Entry::destroy_state_unlocked`, driven by `Cache::shutdown`)
        // shares no code with this live path. A freed slot's external state
        // is reset lazily by `reset_for` the next time the pool hands it
        // back out, which is sufficient since nothing reads it in between.
        self.pool.free(entry);
    }

    /// spec §4.4 `kill(entry)`: idempotent, unlinks from the index, parks on
    /// the cleanup queue, then drops the sentinel reference that the index
    /// held — which is what actually drives `unref` to zero and frees the
    /// entry once every caller-held reference is also gone.
    pub fn kill(&self, entry: &Arc<Entry>, index: &Index) {
        if !entry.try_mark_killed() {
            return;
        }

        if let Some(key) = entry.key() {
            let (_found, latch) = index.get_by_key_latched(&key, LatchMode::Exclusive);
            index.delete_latched(latch, entry, true);
        }

        let lane = &self.lanes[entry.lane];
        {
            let mut lists = lane.state.lock();
            lane.unlink_locked(&mut lists, entry, entry.qid());
            lane.push_back_locked(&mut lists, entry, QueueId::Cleanup);
        }

        self.unref(entry);
    }

    /// spec §4.4 pin protocol, `inc_pin(entry)`.
    pub fn inc_pin(&self, entry: &Arc<Entry>) -> Result<(), CacheError> {
        let lane = &self.lanes[entry.lane];
        let mut lists = lane.state.lock();
        if entry.qid() == QueueId::Cleanup {
            return Err(CacheError::Dead);
        }
        if entry.pin_refcnt() == 0 {
            lane.unlink_locked(&mut lists, entry, entry.qid());
            lane.push_back_locked(&mut lists, entry, QueueId::Pinned);
        }
        entry.pin_refcnt_atomic().fetch_add(1, Ordering::SeqCst);
        drop(lists);
        entry.refcnt_atomic().fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// spec §4.4 pin protocol, `dec_pin(entry, close_descriptor?)`. Closing
    /// the backend descriptor is the caller's job under `content_lock`
    /// (component G); this only restores LRU placement and releases the
    /// reference `inc_pin` took.
    pub fn dec_pin(&self, entry: &Arc<Entry>) {
        let lane = &self.lanes[entry.lane];
        {
            let mut lists = lane.state.lock();
            let before = entry.pin_refcnt_atomic().fetch_sub(1, Ordering::SeqCst);
            if before == 1 && entry.qid() == QueueId::Pinned {
                lane.unlink_locked(&mut lists, entry, QueueId::Pinned);
                lane.push_back_locked(&mut lists, entry, QueueId::L1);
            }
        }
        self.unref(entry);
    }

    /// spec §4.4 "Reclaiming entries (not just descriptors)": scan L2 then
    /// L1 of each lane for a quiet entry (no outside references beyond the
    /// reclaimer's own momentary scan ref) and reclaim it for reuse.
    pub fn reap(&self, index: &Index) -> Option<Arc<Entry>> {
        for lane in &self.lanes {
            for queue in [QueueId::L2, QueueId::L1] {
                if let Some(id) = lane.peek_lru(queue) {
                    if let Some(entry) = self.pool.resolve(id) {
                        if self.try_reap(&entry, index) {
                            return Some(entry);
                        }
                    }
                }
            }
        }
        None
    }

    /// spec §4.4 reclaimer pass, per-lane step: walk up to `limit` entries
    /// from the LRU end of `L1`, closing any open backend descriptor and
    /// demoting to `L2` (scan-resistant). Returns `(scanned, closed)`.
    pub async fn reclaim_lane_descriptors(
        &self,
        lane_idx: usize,
        limit: u32,
        backend: &dyn Backend,
        open_fds: &std::sync::atomic::AtomicU64,
    ) -> (u32, u32) {
        let mut scanned = 0u32;
        let mut closed = 0u32;

        for _ in 0..limit {
            let candidate = {
                let lane = &self.lanes[lane_idx];
                let lists = lane.state.lock();
                let head = lists.l1.head;
                if head == EntryId::NONE {
                    break;
                }
                self.pool.resolve(head)
            };
            let entry = match candidate {
                Some(e) => e,
                None => break,
            };
            scanned += 1;

            if entry.is_condemned() || entry.is_killed() || entry.pin_refcnt() > 0 || entry.refcnt() > 2 {
                // Not a candidate right now; requeue to L2 so the walk makes
                // progress instead of spinning on the same head forever.
                let lane = &self.lanes[lane_idx];
                let mut lists = lane.state.lock();
                lane.move_locked(&mut lists, &entry, QueueId::L2, true);
                continue;
            }

            if self.ref_entry(&entry, RefKind::Scan).is_err() {
                continue;
            }

            {
                let mut content = entry.content_lock.write().await;
                if let Variant::RegularFile { descriptor, .. } = &mut content.variant {
                    if descriptor.is_open() {
                        if let Some(key) = entry.key() {
                            let _ = backend.close(key.handle_bytes()).await;
                        }
                        *descriptor = DescriptorStatus::Closed;
                        open_fds.fetch_sub(1, Ordering::SeqCst);
                        closed += 1;
                    }
                }
            }

            {
                let lane = &self.lanes[lane_idx];
                let mut lists = lane.state.lock();
                lane.move_locked(&mut lists, &entry, QueueId::L2, true);
            }

            self.unref(&entry);
        }

        (scanned, closed)
    }

    fn try_reap(&self, entry: &Arc<Entry>, index: &Index) -> bool {
        if self.ref_entry(entry, RefKind::Scan).is_err() {
            return false;
        }
        // sentinel (1) + this scan ref (1): nobody else is holding it.
        if entry.refcnt() != 2 {
            self.unref(entry);
            return false;
        }

        let key = match entry.key() {
            Some(k) => k,
            None => {
                self.unref(entry);
                return false;
            }
        };

        let (found, latch) = index.get_by_key_latched(&key, LatchMode::Exclusive);
        if found.as_ref().map(|e| e.id) != Some(entry.id) {
            index.delete_latched(latch, entry, true);
            self.unref(entry);
            return false;
        }
        index.delete_latched(latch, entry, true);

        let lane = &self.lanes[entry.lane];
        {
            let mut lists = lane.state.lock();
            lane.unlink_locked(&mut lists, entry, entry.qid());
        }
        entry.mark_condemned();
        entry.clear_handle();
        // Both references (sentinel + scan) are spoken for by the caller's
        // imminent `reuse()`, which stomps refcnt back to 1 itself; drop the
        // bookkeeping here without running teardown or returning the slot
        // to the free list, since the caller is about to repopulate it in
        // place.
        entry.refcnt_atomic().store(0, Ordering::SeqCst);
        true
    }
}

pub use reclaimer::{adaptive_sleep, Reclaimer};

//! Cache entry record (spec §3 "Cache entry", component B/E).
//!
//! An [`Entry`] is the cache's record for one backend object. Its three
//! read-write locks (`attr_lock`, `content_lock`, `state_lock`) and its
//! refcount/pin bookkeeping are described in spec §3–§5; this module only
//! defines the record shape. The reference protocol itself
//! (`ref`/`unref`/`kill`/`inc_pin`/`dec_pin`) lives in [`crate::lru`], which
//! is the only code allowed to touch `refcnt`, `pin_refcnt`, `lane`, `qid`,
//! and the intrusive list links.

pub mod pool;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock as AsyncRwLock;

use crate::backend::FileAttr;
pub use crate::backend::FileType;
use crate::dirent::DirTree;
use crate::key::Key;

bitflags! {
    /// The flag word attached to the attribute lock (spec §3: "A flag word
    /// with at least the bits: TRUST_ATTRS, TRUST_CONTENT, DIR_POPULATED").
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TrustFlags: u8 {
        const TRUST_ATTRS    = 1 << 0;
        const TRUST_CONTENT  = 1 << 1;
        const DIR_POPULATED  = 1 << 2;
    }
}

/// Identifies an [`Entry`]'s slot in [`pool::EntryPool`]. Stable for as long
/// as the slot is occupied; reused once the entry is freed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u32);

impl EntryId {
    /// Sentinel meaning "no link" in the intrusive LRU list (spec §4.4).
    pub const NONE: EntryId = EntryId(u32::MAX);

    fn to_atomic_repr(self) -> u32 {
        self.0
    }

    fn from_atomic_repr(v: u32) -> Self {
        EntryId(v)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        EntryId::NONE
    }
}

/// The four places an entry's LRU placement may point at (spec §4.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueId {
    L1 = 0,
    L2 = 1,
    Pinned = 2,
    Cleanup = 3,
    /// Transient: the entry is a fresh allocation not yet placed on any
    /// queue, or has just been unlinked and is about to be freed.
    Detached = 4,
}

impl QueueId {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueueId::L1,
            1 => QueueId::L2,
            2 => QueueId::Pinned,
            3 => QueueId::Cleanup,
            _ => QueueId::Detached,
        }
    }
}

/// Cached attributes plus their trust state (spec §3, protected by `attr_lock`).
#[derive(Debug, Clone)]
pub struct AttrState {
    pub attrs: Option<FileAttr>,
    pub expiry: Option<Instant>,
    pub trust: TrustFlags,
}

impl Default for AttrState {
    fn default() -> Self {
        Self { attrs: None, expiry: None, trust: TrustFlags::empty() }
    }
}

/// Backend descriptor status for a regular file (spec §3 "Regular file").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DescriptorStatus {
    #[default]
    Closed,
    Read,
    Write,
    ReadWrite,
}

impl DescriptorStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, DescriptorStatus::Closed)
    }

    /// True if a descriptor opened as `self` already satisfies a request for `wanted`.
    pub fn satisfies(self, wanted: DescriptorStatus) -> bool {
        match (self, wanted) {
            (DescriptorStatus::ReadWrite, _) => true,
            (a, b) => a == b,
        }
    }
}

/// Per-type substructure living behind `content_lock` (spec §3 "Per-type variant data").
#[derive(Debug)]
pub enum Variant {
    RegularFile {
        descriptor: DescriptorStatus,
        open_count: u32,
        deny_read: u32,
        deny_write: u32,
    },
    Directory {
        tree: DirTree,
        active_children: u32,
        parent_key: Option<Key>,
        /// Per-directory in-creation counter (spec §14 supplement); suppresses
        /// other threads' negative-cache trust on a concurrent `create`.
        creating: AtomicU32,
        junction: bool,
    },
    Symlink {
        target: Option<String>,
    },
    Other,
}

impl Variant {
    pub fn new_for(file_type: FileType) -> Self {
        match file_type {
            FileType::RegularFile => {
                Variant::RegularFile {
                    descriptor: DescriptorStatus::Closed,
                    open_count: 0,
                    deny_read: 0,
                    deny_write: 0,
                }
            }
            FileType::Directory => Variant::Directory {
                tree: DirTree::new(),
                active_children: 0,
                parent_key: None,
                creating: AtomicU32::new(0),
                junction: false,
            },
            FileType::Symlink => Variant::Symlink { target: None },
            _ => Variant::Other,
        }
    }
}

/// External state the state/locking collaborator owns (share reservations,
/// byte-range locks, delegations, session tracking). Out of scope per spec
/// §1; the cache only stores enough to drive the two-phase teardown of
/// spec §9's Design Notes and to answer "is this entry pinned".
#[derive(Debug, Default)]
pub struct ExternalState {
    pub shares: u32,
    pub locks: u32,
    pub layouts: u32,
}

/// Content behind `content_lock` (spec §3).
#[derive(Debug)]
pub struct ContentState {
    pub variant: Variant,
}

/// The cache's record for one backend object (spec §3).
pub struct Entry {
    pub id: EntryId,
    key: SyncRwLock<Option<Key>>,
    file_type: SyncRwLock<FileType>,
    /// Whether the backend handle behind this entry is still resolvable.
    /// Cleared when the entry is killed (spec §3: "or none if the entry is
    /// being torn down").
    handle_alive: std::sync::atomic::AtomicBool,

    pub attr_lock: AsyncRwLock<AttrState>,
    pub content_lock: AsyncRwLock<ContentState>,
    pub state_lock: AsyncRwLock<ExternalState>,

    /// Sentinel bit included: 1 while reachable from the index, plus one per
    /// outstanding caller reference (spec §4.4).
    refcnt: AtomicU64,
    pin_refcnt: AtomicU32,

    /// Fixed at creation: `addr_of(entry) mod L`, approximated here by the
    /// slot id modulo lane count since entries never move slots.
    pub lane: usize,
    qid: AtomicU8,
    prev: AtomicU32,
    next: AtomicU32,

    killed: std::sync::atomic::AtomicBool,
    condemned: std::sync::atomic::AtomicBool,
}

impl Entry {
    pub(crate) fn blank(id: EntryId, lane: usize) -> Self {
        Self {
            id,
            key: SyncRwLock::new(None),
            file_type: SyncRwLock::new(FileType::Unknown),
            handle_alive: std::sync::atomic::AtomicBool::new(false),
            attr_lock: AsyncRwLock::new(AttrState::default()),
            content_lock: AsyncRwLock::new(ContentState { variant: Variant::Other }),
            state_lock: AsyncRwLock::new(ExternalState::default()),
            refcnt: AtomicU64::new(0),
            pin_refcnt: AtomicU32::new(0),
            lane,
            qid: AtomicU8::new(QueueId::Detached as u8),
            prev: AtomicU32::new(EntryId::NONE.to_atomic_repr()),
            next: AtomicU32::new(EntryId::NONE.to_atomic_repr()),
            killed: std::sync::atomic::AtomicBool::new(false),
            condemned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Re-home a recycled blank entry onto a new key/type, with `refcnt`
    /// carrying the sentinel reference (spec §3 invariant 2). Called only by
    /// [`pool::EntryPool::alloc`] before the entry is published into the index.
    pub(crate) fn reset_for(&self, key: Key, file_type: FileType, variant: Variant) {
        *self.key.write() = Some(key);
        *self.file_type.write() = file_type;
        self.handle_alive.store(true, Ordering::SeqCst);
        self.refcnt.store(1, Ordering::SeqCst);
        self.pin_refcnt.store(0, Ordering::SeqCst);
        self.qid.store(QueueId::Detached as u8, Ordering::SeqCst);
        self.prev.store(EntryId::NONE.to_atomic_repr(), Ordering::SeqCst);
        self.next.store(EntryId::NONE.to_atomic_repr(), Ordering::SeqCst);
        self.killed.store(false, Ordering::SeqCst);
        self.condemned.store(false, Ordering::SeqCst);

        // Safe to `try_write` unconditionally: a slot being reset is either
        // brand new or was just popped off the free queue, so nothing else
        // can be holding or waiting on these locks yet.
        *self.attr_lock.try_write().expect("freshly reset entry has no contenders") =
            AttrState::default();
        self.content_lock.try_write().expect("freshly reset entry has no contenders").variant =
            variant;
        *self.state_lock.try_write().expect("freshly reset entry has no contenders") =
            ExternalState::default();
    }

    pub fn key(&self) -> Option<Key> {
        self.key.read().clone()
    }

    pub fn file_type(&self) -> FileType {
        *self.file_type.read()
    }

    pub fn handle_alive(&self) -> bool {
        self.handle_alive.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_handle(&self) {
        self.handle_alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn clear_key(&self) {
        *self.key.write() = None;
    }

    pub fn refcnt(&self) -> u64 {
        self.refcnt.load(Ordering::SeqCst)
    }

    pub(crate) fn refcnt_atomic(&self) -> &AtomicU64 {
        &self.refcnt
    }

    pub fn pin_refcnt(&self) -> u32 {
        self.pin_refcnt.load(Ordering::SeqCst)
    }

    pub(crate) fn pin_refcnt_atomic(&self) -> &AtomicU32 {
        &self.pin_refcnt
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Atomically transition `killed` from false to true. Returns whether
    /// *this* call performed the transition, so [`crate::lru::LruEngine::kill`]
    /// can stay idempotent under concurrent callers (spec §4.4: "Idempotent").
    pub(crate) fn try_mark_killed(&self) -> bool {
        self.killed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Two-phase external-state teardown run once `refcnt` has reached zero
    /// and no contender can observe `state_lock` anymore (spec §14
    /// supplement: layouts and byte-range locks release before share
    /// reservations, as separate, non-fallthrough steps).
    pub(crate) fn destroy_state_unlocked(&self) {
        let mut state = self
            .state_lock
            .try_write()
            .expect("entry reaching refcnt 0 has no remaining contenders");
        self.release_layouts_and_locks(&mut state);
        self.release_shares(&mut state);
    }

    fn release_layouts_and_locks(&self, state: &mut ExternalState) {
        state.layouts = 0;
        state.locks = 0;
    }

    fn release_shares(&self, state: &mut ExternalState) {
        state.shares = 0;
    }

    pub fn is_condemned(&self) -> bool {
        self.condemned.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_condemned(&self) {
        self.condemned.store(true, Ordering::SeqCst);
    }

    pub fn qid(&self) -> QueueId {
        QueueId::from_u8(self.qid.load(Ordering::SeqCst))
    }

    pub(crate) fn set_qid(&self, qid: QueueId) {
        self.qid.store(qid as u8, Ordering::SeqCst);
    }

    pub(crate) fn prev(&self) -> EntryId {
        EntryId::from_atomic_repr(self.prev.load(Ordering::SeqCst))
    }

    pub(crate) fn set_prev(&self, id: EntryId) {
        self.prev.store(id.to_atomic_repr(), Ordering::SeqCst);
    }

    pub(crate) fn next(&self) -> EntryId {
        EntryId::from_atomic_repr(self.next.load(Ordering::SeqCst))
    }

    pub(crate) fn set_next(&self, id: EntryId) {
        self.next.store(id.to_atomic_repr(), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("file_type", &self.file_type())
            .field("refcnt", &self.refcnt())
            .field("pin_refcnt", &self.pin_refcnt())
            .field("qid", &self.qid())
            .field("killed", &self.is_killed())
            .finish()
    }
}

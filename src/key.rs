//! Key & Hash (spec §4.1, component A).
//!
//! A [`Key`] is an opaque backend handle plus the identifier of the backend
//! that issued it, together with a pre-computed 64-bit hash. Keys are cloned
//! on store (never aliased to caller buffers, per spec §3 "Invariants").

use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher13};

/// Identifies which [`crate::backend::Backend`] issued a handle.
///
/// A single [`crate::cache::Cache`] may front more than one backend (e.g. one
/// per NFS export); the pair `(BackendId, handle bytes)` is what spec §3
/// calls the entry key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u32);

/// Fixed, process-wide hash seed. The hash only needs to be stable for the
/// lifetime of one cache instance (spec §4.1: "the hash is seeded and
/// order-independent"), not across restarts or machines.
const SEED_K0: u64 = 0x5A6D_6F6E_745F_6B30;
const SEED_K1: u64 = 0x4361_6368_655F_6B31;

/// Opaque backend handle plus the backend that issued it, with its hash
/// pre-computed at construction time (spec §4.1).
#[derive(Debug, Clone)]
pub struct Key {
    backend_id: BackendId,
    handle: Box<[u8]>,
    hash64: u64,
}

impl Key {
    /// Build a new key, computing its hash once (spec §4.1 `hash`).
    pub fn new(backend_id: BackendId, handle_bytes: &[u8]) -> Self {
        let hash64 = Self::compute_hash(backend_id, handle_bytes);
        Self { backend_id, handle: handle_bytes.into(), hash64 }
    }

    fn compute_hash(backend_id: BackendId, handle_bytes: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(SEED_K0, SEED_K1);
        hasher.write_u32(backend_id.0);
        hasher.write(handle_bytes);
        hasher.finish128().h1
    }

    /// Deep copy of `self` (spec §4.1 `dup`); entries never alias caller
    /// buffers, so cloning is always a full allocation.
    pub fn dup(&self) -> Key {
        self.clone()
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn handle_bytes(&self) -> &[u8] {
        &self.handle
    }

    /// Pre-computed 64-bit hash (spec §4.1).
    pub fn hash64(&self) -> u64 {
        self.hash64
    }

    /// `hash64 mod n_partitions`; the partition is determined solely by the
    /// hash (spec §4.1).
    pub fn partition_index(&self, n_partitions: usize) -> usize {
        (self.hash64 % n_partitions as u64) as usize
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.backend_id == other.backend_id && self.handle == other.handle
    }
}

impl Eq for Key {}

/// Ties in the partition's ordered map are broken by `(hash64, handle bytes)`
/// byte compare (spec §4.3), with `backend_id` as a tertiary key so two
/// backends may reuse numerically identical handle bytes without colliding.
impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash64
            .cmp(&other.hash64)
            .then_with(|| self.handle.cmp(&other.handle))
            .then_with(|| self.backend_id.cmp(&other.backend_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_handles_on_same_backend_are_equal_keys() {
        let a = Key::new(BackendId(1), b"handle-a");
        let b = Key::new(BackendId(1), b"handle-a");
        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
    }

    #[test]
    fn same_bytes_on_different_backends_are_distinct() {
        let a = Key::new(BackendId(1), b"handle-a");
        let b = Key::new(BackendId(2), b"handle-a");
        assert_ne!(a, b);
    }

    #[test]
    fn dup_produces_an_independent_owned_copy() {
        let original = Key::new(BackendId(7), b"h");
        let copy = original.dup();
        assert_eq!(original, copy);
        assert_eq!(original.hash64(), copy.hash64());
        // The two don't alias the same allocation.
        assert_ne!(
            original.handle_bytes().as_ptr(),
            copy.handle_bytes().as_ptr()
        );
    }

    #[test]
    fn partition_index_is_a_pure_function_of_the_hash() {
        let key = Key::new(BackendId(3), b"some-handle-bytes");
        let a = key.partition_index(11);
        let b = key.partition_index(11);
        assert_eq!(a, b);
        assert!(a < 11);
    }

    #[test]
    fn ordering_is_consistent_with_equality() {
        let a = Key::new(BackendId(1), b"aaa");
        let b = Key::new(BackendId(1), b"aaa");
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }
}

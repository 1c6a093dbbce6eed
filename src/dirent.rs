//! Directory substructure (spec §4.6, component F).
//!
//! A directory owns two ordered maps, `names` (live children) and `cookies`
//! (deleted children, kept so a previously issued cookie still resolves to
//! "gone, here's the next one"). Both are keyed by the same 64-bit
//! pseudo-cookie space (`hk.k`), with collisions resolved by quadratic
//! probing and a linear fallback (spec §4.6).
//!
//! This module has no locking of its own: callers hold the owning
//! [`crate::entry::Entry`]'s `content_lock` for the duration of any mutation
//! or read, per spec §3 invariant 8.

use std::collections::BTreeMap;
use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher13};

use crate::error::CacheError;
use crate::key::Key;

/// Cookie values below this are reserved (spec §4.6): 0 means "from the
/// beginning", 1 and 2 are never issued so protocol dot/dotdot encodings
/// never collide with a real cookie.
pub const FIRST_COOKIE: u64 = 3;

/// Soft cap on the number of deleted records retained in `cookies` (spec
/// §14 supplement, matching the original's `cih_fhcache` cookie-tree bound);
/// exceeding it recycles the smallest-cookie deleted record. This is a
/// memory bound only, never a correctness requirement.
pub const DELETED_CAP: usize = 65_535;

const DIR_SEED_K0: u64 = 0x4449_5245_4E54_5F30;
const DIR_SEED_K1: u64 = 0x4449_5245_4E54_5F31;

fn name_hash(name: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(DIR_SEED_K0, DIR_SEED_K1);
    hasher.write(name.as_bytes());
    let h = hasher.finish128().h1;
    h.max(FIRST_COOKIE)
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DirentFlags: u8 {
        const DELETED = 1 << 0;
    }
}

/// One child reference (spec §3 "Directory-entry record").
#[derive(Debug, Clone)]
pub struct DirentRecord {
    pub name: String,
    pub flags: DirentFlags,
    /// A key copy, not a pointer: resolving to a live entry always goes
    /// back through the partitioned index (spec §9 Design Notes, "Weak
    /// child pointers in dirents").
    pub child_key: Key,
    pub cookie: u64,
    pub probe_depth: u32,
}

/// Two ordered maps over the same cookie space (spec §4.6).
#[derive(Debug, Default)]
pub struct DirTree {
    names: BTreeMap<u64, DirentRecord>,
    cookies: BTreeMap<u64, DirentRecord>,
    pub collisions: u32,
}

/// Candidate cookie slots tried during insertion: the name's hash, then
/// quadratic steps, then a linear fallback (spec §4.6).
fn probe_sequence(name: &str) -> impl Iterator<Item = u64> {
    let base = name_hash(name);
    let quadratic = (0u64..16).map(move |i| base.wrapping_add(i * i));
    let linear = (1u64..=4096).map(move |i| base.wrapping_add(256 + i));
    quadratic.chain(linear).map(|k| k.max(FIRST_COOKIE))
}

impl DirTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn occupied(&self, k: u64) -> bool {
        self.names.contains_key(&k) || self.cookies.contains_key(&k)
    }

    /// Find the live record for `name`, if any (spec §4.6 probing).
    pub fn lookup_live(&self, name: &str) -> Option<&DirentRecord> {
        for k in probe_sequence(name) {
            if let Some(rec) = self.names.get(&k) {
                if rec.name == name {
                    return Some(rec);
                }
                continue; // different name landed on the same slot: collision, keep probing
            }
            if let Some(rec) = self.cookies.get(&k) {
                if rec.name == name {
                    return None; // deleted, not live; a reinsertion would recycle this exact slot
                }
                continue;
            }
            return None; // genuinely never used: this name was never inserted
        }
        None
    }

    /// Insert a live record for `name` pointing at `child_key`. Recycles a
    /// previously deleted slot for the same name if one exists (spec §4.6
    /// "On reinsertion of the same name, a previously deleted slot may be
    /// recycled."). Fails with `CacheError::Exists` if `name` is already live.
    pub fn insert_live(&mut self, name: &str, child_key: Key) -> Result<u64, CacheError> {
        if self.lookup_live(name).is_some() {
            return Err(CacheError::Exists);
        }

        // Recycle a deleted slot for this exact name, if present.
        if let Some(k) = self.find_deleted_slot(name) {
            let mut rec = self.cookies.remove(&k).expect("slot presence just checked");
            rec.flags.remove(DirentFlags::DELETED);
            rec.child_key = child_key;
            self.names.insert(k, rec);
            return Ok(k);
        }

        let mut depth = 0u32;
        for k in probe_sequence(name) {
            if !self.occupied(k) {
                self.collisions = self.collisions.max(depth);
                self.names.insert(
                    k,
                    DirentRecord {
                        name: name.to_owned(),
                        flags: DirentFlags::empty(),
                        child_key,
                        cookie: k,
                        probe_depth: depth,
                    },
                );
                return Ok(k);
            }
            depth += 1;
        }
        Err(CacheError::Inconsistent("directory cookie space exhausted"))
    }

    fn find_deleted_slot(&self, name: &str) -> Option<u64> {
        for k in probe_sequence(name) {
            if let Some(rec) = self.cookies.get(&k) {
                if rec.name == name {
                    return Some(k);
                }
                continue;
            }
            if !self.names.contains_key(&k) {
                return None;
            }
        }
        None
    }

    /// Mark `name` deleted, moving its record from `names` to `cookies`
    /// (spec §4.6). No-op (returns `false`) if `name` was not live.
    pub fn delete(&mut self, name: &str) -> bool {
        let cookie = match self.lookup_live(name) {
            Some(rec) => rec.cookie,
            None => return false,
        };
        let mut rec = self.names.remove(&cookie).expect("cookie resolved from lookup_live");
        rec.flags.insert(DirentFlags::DELETED);
        self.cookies.insert(cookie, rec);
        self.enforce_deleted_cap();
        true
    }

    fn enforce_deleted_cap(&mut self) {
        while self.cookies.len() > DELETED_CAP {
            if let Some((&smallest, _)) = self.cookies.iter().next() {
                self.cookies.remove(&smallest);
            } else {
                break;
            }
        }
    }

    /// Rename `old` to `new` in place (spec §4.6 "Rename"). If `new` already
    /// exists, the caller must have already decided to overwrite or fail;
    /// this method always fails with `Exists` if `new` is live, leaving
    /// `old` undisturbed — collision handling is the caller's job (it may
    /// invalidate/evict the clobbered child first, then retry).
    pub fn rename(&mut self, old: &str, new: &str) -> Result<u64, CacheError> {
        let old_cookie = self.lookup_live(old).ok_or(CacheError::NotFound)?.cookie;
        if self.lookup_live(new).is_some() {
            return Err(CacheError::Exists);
        }

        let mut rec = self.names.remove(&old_cookie).expect("old_cookie just resolved");
        rec.flags.insert(DirentFlags::DELETED);
        let tombstone = rec.clone();
        self.cookies.insert(old_cookie, tombstone);

        rec.name = new.to_owned();
        rec.flags.remove(DirentFlags::DELETED);
        match self.insert_live(new, rec.child_key.clone()) {
            Ok(new_cookie) => {
                self.enforce_deleted_cap();
                Ok(new_cookie)
            }
            Err(e) => {
                // Undelete `old` on failure (spec §4.6: "on a hash collision
                // during insert, undelete the old and fail").
                let mut restored = self.cookies.remove(&old_cookie).expect("just inserted above");
                restored.flags.remove(DirentFlags::DELETED);
                self.names.insert(old_cookie, restored);
                Err(e)
            }
        }
    }

    /// Resolve a readdir start cookie to the first live node at or after it
    /// (spec §4.6's "supremum" rule and §8's deleted-cookie testable
    /// property). `0` means "from the beginning".
    pub fn resume_from(&self, cookie: u64) -> impl Iterator<Item = &DirentRecord> {
        let start = if cookie == 0 { 0 } else { cookie };
        self.names.range(start..).map(|(_, rec)| rec)
    }

    pub fn get_live_by_cookie(&self, cookie: u64) -> Option<&DirentRecord> {
        self.names.get(&cookie)
    }

    pub fn is_deleted_cookie(&self, cookie: u64) -> bool {
        self.cookies.contains_key(&cookie)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &DirentRecord> {
        self.names.values()
    }
}

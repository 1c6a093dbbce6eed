//! The pluggable backend file-system abstraction (spec §1, §6).
//!
//! This is the "external collaborator" the cache delegates durable
//! operations to, named in the cache's own vocabulary: the cache does not
//! know or care whether the backend is serving NFSv3, 9P, or a local mirror
//! filesystem (spec §1 is explicit that wire protocols are out of scope).
//!
//! The cache does make one permission decision itself: whether the caller
//! presenting a [`Credential`] may perform the operation at all. That check
//! is delegated to [`Backend::access`] rather than implemented against the
//! cached [`FileAttr`] directly, since mode bits alone don't capture ACLs or
//! backend-specific authorization (spec.md:202, spec.md:209; grounded on
//! `cache_inode_access()` in the original `cache_inode_lookup.c`/
//! `cache_inode_setattr.c`, which call into the FSAL rather than evaluating
//! permission bits inline).

use async_trait::async_trait;

use crate::error::BackendError;
use crate::key::BackendId;

pub type BackendResult<T> = Result<T, BackendError>;

/// The object type tag the backend reports for a handle (spec §3).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    Socket,
    Fifo,
    CharDev,
    BlockDev,
    Unknown,
}

/// Major/minor device pair, relevant for [`FileType::CharDev`]/[`FileType::BlockDev`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

/// Opaque ACL blob; the cache never interprets it, only stores and frees it
/// (spec §4.7 `setattr`: "release old ACL reference").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl(pub Vec<u8>);

/// Full attribute set the backend reports for a handle (spec §3 "Cached attributes").
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub file_type: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub device: Option<DeviceId>,
    pub fsid: u64,
    pub fileid: u64,
    pub change: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub acl: Acl,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SetTime {
    #[default]
    DontChange,
    ServerCurrent,
    ClientProvided(Timestamp),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreateArg {
    Unchecked,
    Guarded { verifier: [u8; 8] },
    Exclusive { verifier: [u8; 8] },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpecialNode {
    Socket,
    Fifo,
    CharDev(DeviceId),
    BlockDev(DeviceId),
}

/// Open mode requested of / reported by the backend descriptor (spec §3
/// "Regular file: backend descriptor status (R/W/RW/closed)").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenFlags {
    Read,
    Write,
    ReadWrite,
}

bitflags::bitflags! {
    /// Bitmask of things `invalidate`/`close` may request (spec §4.7).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CloseFlags: u8 {
        const REALLY_CLOSE = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Access bits a caller may request of [`Backend::access`] (spec.md:202,
    /// spec.md:209: "permission check" ahead of `lookup`/`setattr`).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AccessMask: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// The identity a caller presents for a permission check (spec.md:202,
/// spec.md:209). Passed explicitly as an argument rather than held as
/// ambient/thread-local state: cache operations run concurrently across many
/// async tasks with no single implicit "current user" to consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credential {
    /// The superuser identity, which every backend's `access` should treat
    /// as bypassing mode-bit checks.
    pub fn root() -> Self {
        Self { uid: 0, gid: 0, groups: Vec::new() }
    }
}

/// A single name yielded by [`Backend::readdir`]'s callback.
pub struct ReaddirEntry<'a> {
    pub name: &'a str,
    pub cookie: u64,
}

/// The pluggable backend a [`crate::cache::Cache`] delegates to (spec §6).
///
/// `Handle` is the backend's own in-process representation of an open
/// object; the cache stores only a weak reference to it (spec §3) and the
/// opaque `key_bytes` used to recreate it via [`Backend::handle_to_key`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// This backend's identity, used to namespace keys across backends.
    fn backend_id(&self) -> BackendId;

    async fn create_handle(&self, key_bytes: &[u8]) -> BackendResult<()>;
    async fn lookup(&self, parent_key: &[u8], name: &str) -> BackendResult<Vec<u8>>;

    /// Permission check (spec.md:202 `lookup`, spec.md:209 `setattr`): does
    /// `cred` hold every bit set in `mask` against the object named by
    /// `key_bytes`? Returns `BackendError::AccessDenied` /
    /// `BackendError::PermissionDenied` on failure rather than a bare bool,
    /// so the backend can distinguish the two the way spec.md:281 does.
    async fn access(&self, key_bytes: &[u8], cred: &Credential, mask: AccessMask) -> BackendResult<()>;

    async fn readdir(
    async fn readdir(
        &self,
        dir_key: &[u8],
        start: u64,
        cb: &mut (dyn FnMut(ReaddirEntry<'_>) -> bool + Send),
    ) -> BackendResult<()>;

    async fn open(&self, key_bytes: &[u8], flags: OpenFlags) -> BackendResult<()>;
    async fn reopen(&self, key_bytes: &[u8], flags: OpenFlags) -> BackendResult<()>;
    async fn close(&self, key_bytes: &[u8]) -> BackendResult<()>;
    async fn status(&self, key_bytes: &[u8]) -> BackendResult<Option<OpenFlags>>;

    async fn read(&self, key_bytes: &[u8], off: u64, len: u32) -> BackendResult<(Vec<u8>, bool)>;
    async fn write(
        &self,
        key_bytes: &[u8],
        off: u64,
        bytes: &[u8],
        sync: bool,
    ) -> BackendResult<(u32, bool)>;
    async fn commit(&self, key_bytes: &[u8], off: u64, len: u32) -> BackendResult<()>;

    async fn getattrs(&self, key_bytes: &[u8]) -> BackendResult<FileAttr>;
    async fn setattrs(&self, key_bytes: &[u8], attr: SetAttr) -> BackendResult<FileAttr>;

    async fn create(
        &self,
        parent_key: &[u8],
        name: &str,
        arg: CreateArg,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)>;
    async fn mkdir(
        &self,
        parent_key: &[u8],
        name: &str,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)>;
    async fn symlink(
        &self,
        parent_key: &[u8],
        name: &str,
        target: &str,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)>;
    async fn mknode(
        &self,
        parent_key: &[u8],
        name: &str,
        node: SpecialNode,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)>;

    async fn link(&self, key_bytes: &[u8], dir_key: &[u8], name: &str) -> BackendResult<()>;
    async fn unlink(&self, dir_key: &[u8], name: &str) -> BackendResult<()>;
    async fn rename(
        &self,
        dir_key: &[u8],
        old_name: &str,
        new_dir_key: &[u8],
        new_name: &str,
    ) -> BackendResult<()>;

    async fn readlink(&self, key_bytes: &[u8], refresh: bool) -> BackendResult<String>;

    /// Recover the opaque handle bytes this cache uses as a key, from the
    /// backend's live handle. Used on creation of a new entry.
    async fn handle_to_key(&self, key_bytes: &[u8]) -> BackendResult<Vec<u8>>;

    /// Release any backend-side resources the handle holds. Called once,
    /// when an [`crate::entry::Entry`] is finally freed.
    async fn release(&self, key_bytes: &[u8]);
}

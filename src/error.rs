//! Error taxonomy for the cache (spec §7) and the backend it delegates to.
//!
//! Two enums exist on purpose: [`BackendError`] is what a [`crate::backend::Backend`]
//! implementation returns, and [`CacheError`] is what the cache's high-level
//! operations return after translating a backend error exactly once at the
//! call site (never re-translated further up the stack).

use std::fmt;

use crate::key::BackendId;

/// Errors a [`crate::backend::Backend`] implementation may report.
///
/// Named for what each variant means to a cache client rather than for any
/// particular wire protocol's status codes, even though the set overlaps
/// heavily with NFSv3's (spec §7).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackendError {
    NotFound,
    Exists,
    NotADirectory,
    IsADirectory,
    BadType,
    NotSymlink,
    AccessDenied,
    PermissionDenied,
    Stale,
    NoSpace,
    Quota,
    ReadOnly,
    Io,
    FileTooBig,
    NameTooLong,
    BadCookie,
    BadHandle,
    NotSupported,
    Delay,
    NotEmpty,
    CrossDevice,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for BackendError {}

/// Errors returned by every cache operation in [`crate::ops`] (spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Backend says the object does not exist.
    NotFound,
    /// Name collision on create/rename.
    Exists,
    NotADirectory,
    IsADirectory,
    BadType,
    NotSymlink,
    AccessDenied,
    PermissionDenied,
    /// The handle backing this entry is no longer valid. The entry has
    /// already been killed by the time this error is observed by a caller.
    Stale { backend_id: BackendId },
    NoSpace,
    Quota,
    ReadOnly,
    Io,
    FileTooBig,
    NameTooLong,
    BadCookie,
    BadHandle,
    NotSupported,
    /// Transient back-pressure; the caller should retry later.
    Delay,
    NotEmpty,
    CrossDevice,
    /// A state/lock collaborator refused the operation (e.g. share reservation).
    ShareDenied,
    /// The entry was killed and is no longer reachable via the index.
    Killed,
    /// The entry is on the cleanup queue; no new reference may be granted.
    Dead,
    /// Conflicting in-progress state transition on the same entry.
    StateConflict { held_by: &'static str },
    /// Entry allocation failed (pool exhausted and reclaim made no progress).
    MallocError,
    /// Cache package initialization failed (see [`crate::config::CacheConfig::validate`]).
    InitFailed(&'static str),
    /// An invariant in §3 was violated; this should never happen.
    Inconsistent(&'static str),
    /// The partitioned index's internal map reported an error it cannot recover from.
    HashSetError,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Stale { backend_id } => {
                write!(f, "stale handle (backend {backend_id:?})")
            }
            CacheError::StateConflict { held_by } => {
                write!(f, "state conflict, held by {held_by}")
            }
            CacheError::InitFailed(msg) => write!(f, "cache init failed: {msg}"),
            CacheError::Inconsistent(msg) => write!(f, "internal invariant violated: {msg}"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl std::error::Error for CacheError {}

impl CacheError {
    /// Translate a backend error observed while operating on `backend_id`.
    ///
    /// This is the single translation point spec §7 requires ("backend
    /// errors are translated once at the call site"); `Stale` is the only
    /// variant callers must additionally act on by calling
    /// [`crate::entry::Entry::kill`].
    pub fn from_backend(err: BackendError, backend_id: BackendId) -> Self {
        match err {
            BackendError::NotFound => CacheError::NotFound,
            BackendError::Exists => CacheError::Exists,
            BackendError::NotADirectory => CacheError::NotADirectory,
            BackendError::IsADirectory => CacheError::IsADirectory,
            BackendError::BadType => CacheError::BadType,
            BackendError::NotSymlink => CacheError::NotSymlink,
            BackendError::AccessDenied => CacheError::AccessDenied,
            BackendError::PermissionDenied => CacheError::PermissionDenied,
            BackendError::Stale => CacheError::Stale { backend_id },
            BackendError::NoSpace => CacheError::NoSpace,
            BackendError::Quota => CacheError::Quota,
            BackendError::ReadOnly => CacheError::ReadOnly,
            BackendError::Io => CacheError::Io,
            BackendError::FileTooBig => CacheError::FileTooBig,
            BackendError::NameTooLong => CacheError::NameTooLong,
            BackendError::BadCookie => CacheError::BadCookie,
            BackendError::BadHandle => CacheError::BadHandle,
            BackendError::NotSupported => CacheError::NotSupported,
            BackendError::Delay => CacheError::Delay,
            BackendError::NotEmpty => CacheError::NotEmpty,
            BackendError::CrossDevice => CacheError::CrossDevice,
        }
    }

    /// True for the handful of variants spec §7 says should log at `debug`
    /// rather than a louder level (not-found and access failures are routine).
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            CacheError::NotFound | CacheError::AccessDenied | CacheError::PermissionDenied
        )
    }
}

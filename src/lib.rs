//! A metadata and file-descriptor cache for user-space file servers.
//!
//! Sits in front of a pluggable [`backend::Backend`] (the file-system
//! implementation proper — local disk, a network protocol, whatever) and
//! caches attributes, directory contents, and open descriptors behind a
//! partitioned index and a scan-resistant LRU. Wire protocols and the actual
//! byte-range/share locking state machines are out of scope; this crate only
//! owns the cache. Permission decisions are delegated to the backend via
//! [`backend::Backend::access`], called from [`cache::Cache::lookup`] and
//! [`cache::Cache::setattr`] with a caller-supplied [`backend::Credential`] —
//! this crate enforces that the check happens, not the policy itself.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dirent;
pub mod entry;
pub mod error;
pub mod index;
pub mod key;
pub mod lru;
pub mod ops;

pub use backend::{Backend, BackendResult};
pub use cache::Cache;
pub use config::CacheConfig;
pub use entry::Entry;
pub use error::{BackendError, CacheError};
pub use key::{BackendId, Key};

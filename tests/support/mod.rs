//! Shared test fixture: an in-memory [`Backend`] double plus a small
//! directory-tree builder, backed by an in-memory node table instead of
//! real files (spec §15).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use mamont_cache::backend::{
    AccessMask, Acl, Backend, BackendResult, Credential, CreateArg, DeviceId, FileAttr, FileType,
    OpenFlags, ReaddirEntry, SetAttr, SetTime, SpecialNode, Timestamp,
};
use mamont_cache::cache::Cache;
use mamont_cache::config::CacheConfig;
use mamont_cache::error::BackendError;
use mamont_cache::key::BackendId;

pub const ROOT_ID: u64 = 1;

#[derive(Clone)]
enum Content {
    File(Vec<u8>),
    Dir(HashMap<String, u64>),
    Symlink(String),
}

struct Node {
    file_type: FileType,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    change: u64,
    mtime_secs: i64,
    content: Content,
}

impl Node {
    fn dir() -> Self {
        Self {
            file_type: FileType::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            nlink: 2,
            change: 0,
            mtime_secs: 0,
            content: Content::Dir(HashMap::new()),
        }
    }

    fn file(bytes: Vec<u8>) -> Self {
        Self {
            file_type: FileType::RegularFile,
            mode: 0o644,
            uid: 0,
            gid: 0,
            nlink: 1,
            change: 0,
            mtime_secs: 0,
            content: Content::File(bytes),
        }
    }

    fn symlink(target: String) -> Self {
        Self {
            file_type: FileType::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
            nlink: 1,
            change: 0,
            mtime_secs: 0,
            content: Content::Symlink(target),
        }
    }

    fn attr(&self, id: u64) -> FileAttr {
        let size = match &self.content {
            Content::File(bytes) => bytes.len() as u64,
            Content::Symlink(target) => target.len() as u64,
            Content::Dir(_) => 0,
        };
        FileAttr {
            file_type: self.file_type,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size,
            nlink: self.nlink,
            device: None,
            fsid: 0,
            fileid: id,
            change: self.change,
            atime: Timestamp { seconds: 0, nanos: 0 },
            mtime: Timestamp { seconds: self.mtime_secs, nanos: 0 },
            ctime: Timestamp { seconds: 0, nanos: 0 },
            acl: Acl::default(),
        }
    }
}

fn encode(id: u64) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

fn decode(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// An in-memory file tree, standing in for a real backend (spec §15).
pub struct MemBackend {
    nodes: Mutex<HashMap<u64, Node>>,
    next_id: AtomicU64,
    backend_id: BackendId,
}

impl MemBackend {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, Node::dir());
        Self { nodes: Mutex::new(nodes), next_id: AtomicU64::new(ROOT_ID + 1), backend_id: BackendId(0) }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn child_of(&self, parent: u64, name: &str) -> Option<u64> {
        let nodes = self.nodes.lock().unwrap();
        match &nodes.get(&parent)?.content {
            Content::Dir(children) => children.get(name).copied(),
            _ => None,
        }
    }

    /// Test helper: create a file directly under `parent`, bypassing the cache.
    pub fn seed_file(&self, parent: u64, name: &str, bytes: &[u8]) -> u64 {
        let id = self.alloc_id();
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(id, Node::file(bytes.to_vec()));
        if let Content::Dir(children) = &mut nodes.get_mut(&parent).unwrap().content {
            children.insert(name.to_owned(), id);
        }
        id
    }

    /// Test helper: create a directory directly under `parent`, bypassing the cache.
    pub fn seed_dir(&self, parent: u64, name: &str) -> u64 {
        let id = self.alloc_id();
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(id, Node::dir());
        if let Content::Dir(children) = &mut nodes.get_mut(&parent).unwrap().content {
            children.insert(name.to_owned(), id);
        }
        id
    }
}

fn apply_set_time(secs: &mut i64, set: &SetTime) {
    match set {
        SetTime::DontChange => {}
        SetTime::ServerCurrent => *secs += 1,
        SetTime::ClientProvided(ts) => *secs = ts.seconds,
    }
}

#[async_trait]
impl Backend for MemBackend {
    fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    async fn create_handle(&self, key_bytes: &[u8]) -> BackendResult<()> {
        let id = decode(key_bytes);
        if self.nodes.lock().unwrap().contains_key(&id) {
            Ok(())
        } else {
            Err(BackendError::Stale)
        }
    }

    async fn lookup(&self, parent_key: &[u8], name: &str) -> BackendResult<Vec<u8>> {
        let parent = decode(parent_key);
        self.child_of(parent, name).map(encode).ok_or(BackendError::NotFound)
    }

    async fn access(&self, key_bytes: &[u8], cred: &Credential, mask: AccessMask) -> BackendResult<()> {
        let id = decode(key_bytes);
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&id).ok_or(BackendError::Stale)?;

        if cred.uid == 0 {
            return Ok(());
        }

        let mode = node.mode;
        let bits = if cred.uid == node.uid {
            (mode >> 6) & 0o7
        } else if cred.gid == node.gid || cred.groups.contains(&node.gid) {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        };

        let needed = (mask.contains(AccessMask::READ) as u32 * 0o4)
            | (mask.contains(AccessMask::WRITE) as u32 * 0o2)
            | (mask.contains(AccessMask::EXECUTE) as u32 * 0o1);

        if bits & needed == needed {
            Ok(())
        } else {
            Err(BackendError::AccessDenied)
        }
    }

    async fn readdir(
        &self,
        dir_key: &[u8],
        _start: u64,
        cb: &mut (dyn FnMut(ReaddirEntry<'_>) -> bool + Send),
    ) -> BackendResult<()> {
        let parent = decode(dir_key);
        let nodes = self.nodes.lock().unwrap();
        let children = match &nodes.get(&parent).ok_or(BackendError::Stale)?.content {
            Content::Dir(children) => children.clone(),
            _ => return Err(BackendError::NotADirectory),
        };
        drop(nodes);
        let mut names: Vec<&String> = children.keys().collect();
        names.sort();
        for (i, name) in names.into_iter().enumerate() {
            if !cb(ReaddirEntry { name, cookie: i as u64 + 3 }) {
                break;
            }
        }
        Ok(())
    }

    async fn open(&self, key_bytes: &[u8], _flags: OpenFlags) -> BackendResult<()> {
        let id = decode(key_bytes);
        if self.nodes.lock().unwrap().contains_key(&id) {
            Ok(())
        } else {
            Err(BackendError::Stale)
        }
    }

    async fn reopen(&self, key_bytes: &[u8], flags: OpenFlags) -> BackendResult<()> {
        self.open(key_bytes, flags).await
    }

    async fn close(&self, _key_bytes: &[u8]) -> BackendResult<()> {
        Ok(())
    }

    async fn status(&self, _key_bytes: &[u8]) -> BackendResult<Option<OpenFlags>> {
        Ok(None)
    }

    async fn read(&self, key_bytes: &[u8], off: u64, len: u32) -> BackendResult<(Vec<u8>, bool)> {
        let id = decode(key_bytes);
        let nodes = self.nodes.lock().unwrap();
        let bytes = match &nodes.get(&id).ok_or(BackendError::Stale)?.content {
            Content::File(bytes) => bytes,
            _ => return Err(BackendError::IsADirectory),
        };
        let off = off as usize;
        if off >= bytes.len() {
            return Ok((Vec::new(), true));
        }
        let end = (off + len as usize).min(bytes.len());
        Ok((bytes[off..end].to_vec(), end >= bytes.len()))
    }

    async fn write(&self, key_bytes: &[u8], off: u64, bytes: &[u8], sync: bool) -> BackendResult<(u32, bool)> {
        let id = decode(key_bytes);
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&id).ok_or(BackendError::Stale)?;
        let content = match &mut node.content {
            Content::File(content) => content,
            _ => return Err(BackendError::IsADirectory),
        };
        let off = off as usize;
        if content.len() < off + bytes.len() {
            content.resize(off + bytes.len(), 0);
        }
        content[off..off + bytes.len()].copy_from_slice(bytes);
        node.change += 1;
        Ok((bytes.len() as u32, sync))
    }

    async fn commit(&self, _key_bytes: &[u8], _off: u64, _len: u32) -> BackendResult<()> {
        Ok(())
    }

    async fn getattrs(&self, key_bytes: &[u8]) -> BackendResult<FileAttr> {
        let id = decode(key_bytes);
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&id).ok_or(BackendError::Stale)?;
        Ok(node.attr(id))
    }

    async fn setattrs(&self, key_bytes: &[u8], attr: SetAttr) -> BackendResult<FileAttr> {
        let id = decode(key_bytes);
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&id).ok_or(BackendError::Stale)?;
        if let Some(mode) = attr.mode {
            node.mode = mode;
        }
        if let Some(uid) = attr.uid {
            node.uid = uid;
        }
        if let Some(gid) = attr.gid {
            node.gid = gid;
        }
        if let Some(size) = attr.size {
            if let Content::File(bytes) = &mut node.content {
                bytes.resize(size as usize, 0);
            }
        }
        apply_set_time(&mut node.mtime_secs, &attr.mtime);
        node.change += 1;
        Ok(node.attr(id))
    }

    async fn create(
        &self,
        parent_key: &[u8],
        name: &str,
        _arg: CreateArg,
        _attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)> {
        let parent = decode(parent_key);
        if self.child_of(parent, name).is_some() {
            return Err(BackendError::Exists);
        }
        let id = self.alloc_id();
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(id, Node::file(Vec::new()));
        if let Content::Dir(children) = &mut nodes.get_mut(&parent).ok_or(BackendError::Stale)?.content {
            children.insert(name.to_owned(), id);
        }
        let attr = nodes.get(&id).unwrap().attr(id);
        Ok((encode(id), attr))
    }

    async fn mkdir(&self, parent_key: &[u8], name: &str, _attr: SetAttr) -> BackendResult<(Vec<u8>, FileAttr)> {
        let parent = decode(parent_key);
        if self.child_of(parent, name).is_some() {
            return Err(BackendError::Exists);
        }
        let id = self.alloc_id();
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(id, Node::dir());
        if let Content::Dir(children) = &mut nodes.get_mut(&parent).ok_or(BackendError::Stale)?.content {
            children.insert(name.to_owned(), id);
        }
        let attr = nodes.get(&id).unwrap().attr(id);
        Ok((encode(id), attr))
    }

    async fn symlink(
        &self,
        parent_key: &[u8],
        name: &str,
        target: &str,
        _attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)> {
        let parent = decode(parent_key);
        if self.child_of(parent, name).is_some() {
            return Err(BackendError::Exists);
        }
        let id = self.alloc_id();
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(id, Node::symlink(target.to_owned()));
        if let Content::Dir(children) = &mut nodes.get_mut(&parent).ok_or(BackendError::Stale)?.content {
            children.insert(name.to_owned(), id);
        }
        let attr = nodes.get(&id).unwrap().attr(id);
        Ok((encode(id), attr))
    }

    async fn mknode(
        &self,
        parent_key: &[u8],
        name: &str,
        node: SpecialNode,
        _attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)> {
        let parent = decode(parent_key);
        if self.child_of(parent, name).is_some() {
            return Err(BackendError::Exists);
        }
        let id = self.alloc_id();
        let file_type = match node {
            SpecialNode::Socket => FileType::Socket,
            SpecialNode::Fifo => FileType::Fifo,
            SpecialNode::CharDev(_) => FileType::CharDev,
            SpecialNode::BlockDev(_) => FileType::BlockDev,
        };
        let device = match node {
            SpecialNode::CharDev(d) | SpecialNode::BlockDev(d) => Some(d),
            _ => None,
        };
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(
            id,
            Node { file_type, mode: 0o644, uid: 0, gid: 0, nlink: 1, change: 0, mtime_secs: 0, content: Content::File(Vec::new()) },
        );
        if let Content::Dir(children) = &mut nodes.get_mut(&parent).ok_or(BackendError::Stale)?.content {
            children.insert(name.to_owned(), id);
        }
        let mut attr = nodes.get(&id).unwrap().attr(id);
        attr.device = device;
        Ok((encode(id), attr))
    }

    async fn link(&self, key_bytes: &[u8], dir_key: &[u8], name: &str) -> BackendResult<()> {
        let id = decode(key_bytes);
        let dir = decode(dir_key);
        let mut nodes = self.nodes.lock().unwrap();
        if let Content::Dir(children) = &nodes.get(&dir).ok_or(BackendError::Stale)?.content {
            if children.contains_key(name) {
                return Err(BackendError::Exists);
            }
        }
        if let Content::Dir(children) = &mut nodes.get_mut(&dir).unwrap().content {
            children.insert(name.to_owned(), id);
        }
        nodes.get_mut(&id).ok_or(BackendError::Stale)?.nlink += 1;
        Ok(())
    }

    async fn unlink(&self, dir_key: &[u8], name: &str) -> BackendResult<()> {
        let dir = decode(dir_key);
        let mut nodes = self.nodes.lock().unwrap();
        let removed = match &mut nodes.get_mut(&dir).ok_or(BackendError::Stale)?.content {
            Content::Dir(children) => children.remove(name).ok_or(BackendError::NotFound)?,
            _ => return Err(BackendError::NotADirectory),
        };
        if let Some(node) = nodes.get_mut(&removed) {
            node.nlink = node.nlink.saturating_sub(1);
        }
        Ok(())
    }

    async fn rename(&self, dir_key: &[u8], old_name: &str, new_dir_key: &[u8], new_name: &str) -> BackendResult<()> {
        let dir = decode(dir_key);
        let new_dir = decode(new_dir_key);
        let mut nodes = self.nodes.lock().unwrap();

        let moved = match &mut nodes.get_mut(&dir).ok_or(BackendError::Stale)?.content {
            Content::Dir(children) => children.remove(old_name).ok_or(BackendError::NotFound)?,
            _ => return Err(BackendError::NotADirectory),
        };
        match &mut nodes.get_mut(&new_dir).ok_or(BackendError::Stale)?.content {
            Content::Dir(children) => {
                children.insert(new_name.to_owned(), moved);
            }
            _ => return Err(BackendError::NotADirectory),
        }
        Ok(())
    }

    async fn readlink(&self, key_bytes: &[u8], _refresh: bool) -> BackendResult<String> {
        let id = decode(key_bytes);
        let nodes = self.nodes.lock().unwrap();
        match &nodes.get(&id).ok_or(BackendError::Stale)?.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(BackendError::NotSymlink),
        }
    }

    async fn handle_to_key(&self, key_bytes: &[u8]) -> BackendResult<Vec<u8>> {
        Ok(key_bytes.to_vec())
    }

    async fn release(&self, _key_bytes: &[u8]) {}
}

/// Build a `Cache` over a fresh [`MemBackend`], with a config sized for
/// small, fast tests rather than production watermarks.
pub fn test_cache() -> (std::sync::Arc<Cache>, std::sync::Arc<MemBackend>) {
    let backend = std::sync::Arc::new(MemBackend::new());
    let config = CacheConfig {
        nparts: 3,
        cache_entry_count: 8,
        entries_hwmark: 64,
        lanes: 2,
        lru_run_interval_secs: 3600,
        ..CacheConfig::default()
    };
    let cache = Cache::new(config, 1024, backend.clone()).expect("cache construction");
    (std::sync::Arc::new(cache), backend)
}

/// Build a `Cache` over a [`NoReopenBackend`] wrapping a fresh [`MemBackend`],
/// for exercising the reopen-unsupported fallback.
pub fn test_cache_no_reopen() -> (std::sync::Arc<Cache>, std::sync::Arc<MemBackend>) {
    let mem = std::sync::Arc::new(MemBackend::new());
    let backend: std::sync::Arc<dyn Backend> = std::sync::Arc::new(NoReopenBackend::new(mem.clone()));
    let config = CacheConfig {
        nparts: 3,
        cache_entry_count: 8,
        entries_hwmark: 64,
        lanes: 2,
        lru_run_interval_secs: 3600,
        ..CacheConfig::default()
    };
    let cache = Cache::new(config, 1024, backend).expect("cache construction");
    (std::sync::Arc::new(cache), mem)
}

pub fn root_key() -> mamont_cache::key::Key {
    mamont_cache::key::Key::new(BackendId(0), &encode(ROOT_ID))
}

/// The superuser credential, which `MemBackend::access` always lets through.
pub fn root_cred() -> Credential {
    Credential::root()
}

/// Wraps a [`MemBackend`] and reports `reopen` as unsupported, so callers can
/// exercise the close-then-open promotion fallback (spec.md:303) without
/// changing [`MemBackend`]'s own always-succeeds behavior used by every
/// other test.
pub struct NoReopenBackend {
    inner: std::sync::Arc<MemBackend>,
}

impl NoReopenBackend {
    pub fn new(inner: std::sync::Arc<MemBackend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for NoReopenBackend {
    fn backend_id(&self) -> BackendId {
        self.inner.backend_id()
    }

    async fn create_handle(&self, key_bytes: &[u8]) -> BackendResult<()> {
        self.inner.create_handle(key_bytes).await
    }

    async fn lookup(&self, parent_key: &[u8], name: &str) -> BackendResult<Vec<u8>> {
        self.inner.lookup(parent_key, name).await
    }

    async fn access(&self, key_bytes: &[u8], cred: &Credential, mask: AccessMask) -> BackendResult<()> {
        self.inner.access(key_bytes, cred, mask).await
    }

    async fn readdir(
        &self,
        dir_key: &[u8],
        start: u64,
        cb: &mut (dyn FnMut(ReaddirEntry<'_>) -> bool + Send),
    ) -> BackendResult<()> {
        self.inner.readdir(dir_key, start, cb).await
    }

    async fn open(&self, key_bytes: &[u8], flags: OpenFlags) -> BackendResult<()> {
        self.inner.open(key_bytes, flags).await
    }

    async fn reopen(&self, _key_bytes: &[u8], _flags: OpenFlags) -> BackendResult<()> {
        Err(BackendError::NotSupported)
    }

    async fn close(&self, key_bytes: &[u8]) -> BackendResult<()> {
        self.inner.close(key_bytes).await
    }

    async fn status(&self, key_bytes: &[u8]) -> BackendResult<Option<OpenFlags>> {
        self.inner.status(key_bytes).await
    }

    async fn read(&self, key_bytes: &[u8], off: u64, len: u32) -> BackendResult<(Vec<u8>, bool)> {
        self.inner.read(key_bytes, off, len).await
    }

    async fn write(&self, key_bytes: &[u8], off: u64, bytes: &[u8], sync: bool) -> BackendResult<(u32, bool)> {
        self.inner.write(key_bytes, off, bytes, sync).await
    }

    async fn commit(&self, key_bytes: &[u8], off: u64, len: u32) -> BackendResult<()> {
        self.inner.commit(key_bytes, off, len).await
    }

    async fn getattrs(&self, key_bytes: &[u8]) -> BackendResult<FileAttr> {
        self.inner.getattrs(key_bytes).await
    }

    async fn setattrs(&self, key_bytes: &[u8], attr: SetAttr) -> BackendResult<FileAttr> {
        self.inner.setattrs(key_bytes, attr).await
    }

    async fn create(
        &self,
        parent_key: &[u8],
        name: &str,
        arg: CreateArg,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)> {
        self.inner.create(parent_key, name, arg, attr).await
    }

    async fn mkdir(&self, parent_key: &[u8], name: &str, attr: SetAttr) -> BackendResult<(Vec<u8>, FileAttr)> {
        self.inner.mkdir(parent_key, name, attr).await
    }

    async fn symlink(
        &self,
        parent_key: &[u8],
        name: &str,
        target: &str,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)> {
        self.inner.symlink(parent_key, name, target, attr).await
    }

    async fn mknode(
        &self,
        parent_key: &[u8],
        name: &str,
        node: SpecialNode,
        attr: SetAttr,
    ) -> BackendResult<(Vec<u8>, FileAttr)> {
        self.inner.mknode(parent_key, name, node, attr).await
    }

    async fn link(&self, key_bytes: &[u8], dir_key: &[u8], name: &str) -> BackendResult<()> {
        self.inner.link(key_bytes, dir_key, name).await
    }

    async fn unlink(&self, dir_key: &[u8], name: &str) -> BackendResult<()> {
        self.inner.unlink(dir_key, name).await
    }

    async fn rename(&self, dir_key: &[u8], old_name: &str, new_dir_key: &[u8], new_name: &str) -> BackendResult<()> {
        self.inner.rename(dir_key, old_name, new_dir_key, new_name).await
    }

    async fn readlink(&self, key_bytes: &[u8], refresh: bool) -> BackendResult<String> {
        self.inner.readlink(key_bytes, refresh).await
    }

    async fn handle_to_key(&self, key_bytes: &[u8]) -> BackendResult<Vec<u8>> {
        self.inner.handle_to_key(key_bytes).await
    }

    async fn release(&self, key_bytes: &[u8]) {
        self.inner.release(key_bytes).await
    }
}

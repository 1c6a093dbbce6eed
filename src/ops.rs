//! High-level operations (spec §4.7, component G), built on A–F.
//!
//! Every public method here takes a `+1` reference on any entry it returns
//! (spec §6: "ownership of returned entries is transferred with a `+1`
//! reference; callers release by calling `put`"). Backend errors are
//! translated to [`CacheError`] exactly once, at the call site that
//! observed them (spec §7), via [`Cache::map_backend_err`], which also
//! triggers `kill` on a stale handle.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{
    AccessMask, BackendError, CloseFlags, CreateArg, Credential, FileAttr, FileType, OpenFlags,
    ReaddirEntry, SetAttr, SpecialNode,
};
use crate::cache::Cache;
use crate::dirent::DirTree;
use crate::entry::{AttrState, DescriptorStatus, Entry, TrustFlags, Variant};
use crate::error::CacheError;
use crate::index::{LatchMode, SetOutcome};
use crate::key::{BackendId, Key};
use crate::lru::RefKind;

impl Cache {
    /// Translate a backend error observed on `backend_id`, killing `entry`
    /// first if the error means the handle has gone stale (spec §4.5
    /// "Kill policy": "The backend's 'stale handle' error at any operation
    /// triggers `kill(entry)`").
    fn map_backend_err(&self, entry: Option<&Arc<Entry>>, err: BackendError, backend_id: BackendId) -> CacheError {
        if err == BackendError::Stale {
            if let Some(entry) = entry {
                self.lru.kill(entry, &self.index);
            }
        }
        CacheError::from_backend(err, backend_id)
    }

    fn attrs_fresh(attrs: &AttrState) -> bool {
        attrs.trust.contains(TrustFlags::TRUST_ATTRS)
            && attrs.expiry.map(|deadline| Instant::now() < deadline).unwrap_or(false)
    }

    fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.config.expire_time_attr_secs)
    }

    /// "lock shared, check trust, upgrade to exclusive if needed, re-check"
    /// (spec §9 Design Notes), folded into one helper so every caller gets
    /// the same pattern instead of re-deriving it.
    async fn refresh_attrs_if_untrusted(&self, entry: &Arc<Entry>) -> Result<(), CacheError> {
        {
            let attrs = entry.attr_lock.read().await;
            if Self::attrs_fresh(&attrs) {
                return Ok(());
            }
        }

        let mut attrs = entry.attr_lock.write().await;
        if Self::attrs_fresh(&attrs) {
            return Ok(());
        }

        let key = entry.key().ok_or(CacheError::Killed)?;
        let old_mtime = attrs.attrs.as_ref().map(|a| (a.mtime.seconds, a.mtime.nanos));

        match self.backend.getattrs(key.handle_bytes()).await {
            Ok(fresh) => {
                let new_mtime = (fresh.mtime.seconds, fresh.mtime.nanos);
                let is_dir = fresh.file_type == FileType::Directory;
                attrs.attrs = Some(fresh);
                attrs.expiry = Some(Instant::now() + self.attr_ttl());
                attrs.trust.insert(TrustFlags::TRUST_ATTRS);
                drop(attrs);

                if is_dir && old_mtime.map(|old| old < new_mtime).unwrap_or(true) {
                    let mut content = entry.content_lock.write().await;
                    if let Variant::Directory { tree, .. } = &mut content.variant {
                        *tree = DirTree::new();
                    }
                    let mut attrs = entry.attr_lock.write().await;
                    attrs.trust.remove(TrustFlags::TRUST_CONTENT | TrustFlags::DIR_POPULATED);
                }
                Ok(())
            }
            Err(e) => {
                let backend_id = key.backend_id();
                drop(attrs);
                Err(self.map_backend_err(Some(entry), e, backend_id))
            }
        }
    }

    /// spec §4.7 `get(key) -> entry` / `get_by_key(key, flags) -> entry`.
    /// `cached_only` surfaces `NotFound` on a miss instead of consulting the
    /// backend.
    pub async fn get_by_key(&self, key: Key, cached_only: bool) -> Result<Arc<Entry>, CacheError> {
        let (found, latch) = self.index.get_by_key_latched(&key, LatchMode::Shared);
        drop(latch);

        if let Some(entry) = found {
            self.lru.ref_entry(&entry, RefKind::Initial).map_err(|_| CacheError::Dead)?;
            if let Err(e) = self.refresh_attrs_if_untrusted(&entry).await {
                self.put(&entry);
                return Err(e);
            }
            return Ok(entry);
        }

        if cached_only {
            return Err(CacheError::NotFound);
        }

        let backend_id = key.backend_id();
        self.backend
            .create_handle(key.handle_bytes())
            .await
            .map_err(|e| self.map_backend_err(None, e, backend_id))?;
        let attr = self
            .backend
            .getattrs(key.handle_bytes())
            .await
            .map_err(|e| self.map_backend_err(None, e, backend_id))?;
        self.insert_new_entry(key, attr).await
    }

    pub async fn get(&self, key: Key) -> Result<Arc<Entry>, CacheError> {
        self.get_by_key(key, false).await
    }

    /// spec §4.7 `get_protected(getter, source_lock) -> entry`: the caller
    /// has already resolved a weak key reference while holding whatever
    /// lock protects it (e.g. a directory's `content_lock`); this safely
    /// turns that key into a counted reference by re-resolving through the
    /// index rather than trusting a raw pointer (spec §9 Design Notes,
    /// "Weak child pointers in dirents").
    pub async fn get_protected(&self, key: Key) -> Result<Arc<Entry>, CacheError> {
        let (found, latch) = self.index.get_by_key_latched(&key, LatchMode::Shared);
        drop(latch);
        let entry = found.ok_or(CacheError::NotFound)?;
        self.lru.ref_entry(&entry, RefKind::Initial).map_err(|_| CacheError::Dead)?;
        if let Err(e) = self.refresh_attrs_if_untrusted(&entry).await {
            self.put(&entry);
            return Err(e);
        }
        Ok(entry)
    }

    /// Release the reference `get`/`lookup`/etc. handed out (spec §6:
    /// "callers release by calling `put`").
    pub fn put(&self, entry: &Arc<Entry>) {
        self.lru.unref(entry);
    }

    async fn insert_new_entry(&self, key: Key, attr: FileAttr) -> Result<Arc<Entry>, CacheError> {
        let file_type = attr.file_type;
        let variant = Variant::new_for(file_type);

        let entry = if self.pool.at_capacity() || self.reclaimer.entry_hwmark_exceeded(self.pool.live_count()) {
            match self.lru.reap(&self.index) {
                Some(reaped) => self.pool.reuse(&reaped, key.clone(), file_type, variant),
                None => self.pool.alloc(key.clone(), file_type, variant).ok_or(CacheError::MallocError)?,
            }
        } else {
            self.pool.alloc(key.clone(), file_type, variant).ok_or(CacheError::MallocError)?
        };

        {
            let mut attrs = entry.attr_lock.write().await;
            attrs.attrs = Some(attr);
            attrs.expiry = Some(Instant::now() + self.attr_ttl());
            attrs.trust = TrustFlags::TRUST_ATTRS;
        }

        let (_, latch) = self.index.get_by_key_latched(&key, LatchMode::Exclusive);
        match self.index.set_latched(latch, key.clone(), entry.clone(), false) {
            SetOutcome::Inserted => {
                self.lru.ref_entry(&entry, RefKind::Initial).map_err(|_| CacheError::Dead)?;
                Ok(entry)
            }
            SetOutcome::Exists => {
                // Lost a race with a concurrent insert of the same key:
                // drop our allocation's assumed sentinel and hand back the
                // entry that actually won.
                self.lru.unref(&entry);
                let (found, latch) = self.index.get_by_key_latched(&key, LatchMode::Shared);
                drop(latch);
                let winner = found.ok_or(CacheError::Inconsistent("racing insert vanished"))?;
                self.lru.ref_entry(&winner, RefKind::Initial).map_err(|_| CacheError::Dead)?;
                Ok(winner)
            }
            SetOutcome::Overwritten => unreachable!("set_latched called with overwrite=false"),
        }
    }

    /// spec §4.7 `lookup(parent, name) -> entry`. Permission check (spec.md:202:
    /// "permission check (execute on parent)") runs before anything else,
    /// including the cached-dirent fast path, so a cache hit cannot bypass it.
    pub async fn lookup(&self, parent: &Arc<Entry>, name: &str, cred: &Credential) -> Result<Arc<Entry>, CacheError> {
        let parent_key_for_access = parent.key().ok_or(CacheError::Killed)?;
        self.backend
            .access(parent_key_for_access.handle_bytes(), cred, AccessMask::EXECUTE)
            .await
            .map_err(|e| self.map_backend_err(Some(parent), e, parent_key_for_access.backend_id()))?;

        let (cached_key, trust_complete) = {
            let content = parent.content_lock.read().await;
            let tree = match &content.variant {
                Variant::Directory { tree, .. } => tree,
                _ => return Err(CacheError::NotADirectory),
            };
            let attrs = parent.attr_lock.read().await;
            let trust_complete = attrs.trust.contains(TrustFlags::TRUST_CONTENT | TrustFlags::DIR_POPULATED);
            (tree.lookup_live(name).map(|rec| rec.child_key.clone()), trust_complete)
        };

        if let Some(key) = cached_key {
            return self.get_protected(key).await;
        }
        if trust_complete {
            return Err(CacheError::NotFound);
        }

        let parent_key = parent.key().ok_or(CacheError::Killed)?;
        let child_bytes = self
            .backend
            .lookup(parent_key.handle_bytes(), name)
            .await
            .map_err(|e| self.map_backend_err(Some(parent), e, parent_key.backend_id()))?;
        let child_key = Key::new(parent_key.backend_id(), &child_bytes);
        let attr = self
            .backend
            .getattrs(child_key.handle_bytes())
            .await
            .map_err(|e| self.map_backend_err(None, e, child_key.backend_id()))?;
        let child = self.insert_new_entry(child_key.clone(), attr).await?;

        let mut content = parent.content_lock.write().await;
        if let Variant::Directory { tree, .. } = &mut content.variant {
            let _ = tree.insert_live(name, child_key);
        }
        Ok(child)
    }

    /// spec §4.7 `lookupp(entry) -> parent`.
    pub async fn lookupp(&self, entry: &Arc<Entry>) -> Result<Arc<Entry>, CacheError> {
        let parent_key = {
            let content = entry.content_lock.read().await;
            match &content.variant {
                Variant::Directory { parent_key, junction, .. } => {
                    if *junction || parent_key.is_none() {
                        None
                    } else {
                        parent_key.clone()
                    }
                }
                _ => return Err(CacheError::NotADirectory),
            }
        };

        match parent_key {
            Some(key) => self.get_protected(key).await,
            None => {
                // Export root or junction: resolves to itself.
                self.lru.ref_entry(entry, RefKind::Initial).map_err(|_| CacheError::Dead)?;
                Ok(entry.clone())
            }
        }
    }

    async fn bump_creating(parent: &Entry, delta: i64) -> Result<(), CacheError> {
        let content = parent.content_lock.read().await;
        match &content.variant {
            Variant::Directory { creating, .. } => {
                if delta >= 0 {
                    creating.fetch_add(delta as u32, Ordering::SeqCst);
                } else {
                    creating.fetch_sub((-delta) as u32, Ordering::SeqCst);
                }
                Ok(())
            }
            _ => Err(CacheError::NotADirectory),
        }
    }

    async fn finish_create(
        &self,
        parent: &Arc<Entry>,
        name: &str,
        key_bytes: Vec<u8>,
        attr: FileAttr,
    ) -> Result<Arc<Entry>, CacheError> {
        let parent_key = parent.key().ok_or(CacheError::Killed)?;
        let child_key = Key::new(parent_key.backend_id(), &key_bytes);
        let child = self.insert_new_entry(child_key.clone(), attr).await?;

        {
            let mut content = parent.content_lock.write().await;
            if let Variant::Directory { tree, .. } = &mut content.variant {
                tree.insert_live(name, child_key)?;
            }
        }

        // Force a refresh so the parent's link count / mtime catch up.
        {
            let mut attrs = parent.attr_lock.write().await;
            attrs.trust.remove(TrustFlags::TRUST_ATTRS);
        }
        let _ = self.refresh_attrs_if_untrusted(parent).await;

        Ok(child)
    }

    /// spec §4.7 `create(parent, name, type, mode, create_arg) -> entry`,
    /// split into one method per backend creation call (mirrors the four
    /// distinct `Backend` methods) sharing the in-creation counter and
    /// install logic.
    pub async fn create_file(
        &self,
        parent: &Arc<Entry>,
        name: &str,
        arg: CreateArg,
        attr: SetAttr,
    ) -> Result<Arc<Entry>, CacheError> {
        Self::bump_creating(parent, 1).await?;
        let parent_key = parent.key().ok_or(CacheError::Killed)?;
        let result = self
            .backend
            .create(parent_key.handle_bytes(), name, arg, attr)
            .await
            .map_err(|e| self.map_backend_err(None, e, parent_key.backend_id()));
        let outcome = match result {
            Ok((key_bytes, attr)) => self.finish_create(parent, name, key_bytes, attr).await,
            Err(e) => Err(e),
        };
        let _ = Self::bump_creating(parent, -1).await;
        outcome
    }

    pub async fn mkdir(&self, parent: &Arc<Entry>, name: &str, attr: SetAttr) -> Result<Arc<Entry>, CacheError> {
        Self::bump_creating(parent, 1).await?;
        let parent_key = parent.key().ok_or(CacheError::Killed)?;
        let result = self
            .backend
            .mkdir(parent_key.handle_bytes(), name, attr)
            .await
            .map_err(|e| self.map_backend_err(None, e, parent_key.backend_id()));
        let outcome = match result {
            Ok((key_bytes, attr)) => self.finish_create(parent, name, key_bytes, attr).await,
            Err(e) => Err(e),
        };
        let _ = Self::bump_creating(parent, -1).await;
        outcome
    }

    pub async fn symlink(
        &self,
        parent: &Arc<Entry>,
        name: &str,
        target: &str,
        attr: SetAttr,
    ) -> Result<Arc<Entry>, CacheError> {
        Self::bump_creating(parent, 1).await?;
        let parent_key = parent.key().ok_or(CacheError::Killed)?;
        let result = self
            .backend
            .symlink(parent_key.handle_bytes(), name, target, attr)
            .await
            .map_err(|e| self.map_backend_err(None, e, parent_key.backend_id()));
        let outcome = match result {
            Ok((key_bytes, attr)) => self.finish_create(parent, name, key_bytes, attr).await,
            Err(e) => Err(e),
        };
        let _ = Self::bump_creating(parent, -1).await;
        outcome
    }

    pub async fn mknode(
        &self,
        parent: &Arc<Entry>,
        name: &str,
        node: SpecialNode,
        attr: SetAttr,
    ) -> Result<Arc<Entry>, CacheError> {
        Self::bump_creating(parent, 1).await?;
        let parent_key = parent.key().ok_or(CacheError::Killed)?;
        let result = self
            .backend
            .mknode(parent_key.handle_bytes(), name, node, attr)
            .await
            .map_err(|e| self.map_backend_err(None, e, parent_key.backend_id()));
        let outcome = match result {
            Ok((key_bytes, attr)) => self.finish_create(parent, name, key_bytes, attr).await,
            Err(e) => Err(e),
        };
        let _ = Self::bump_creating(parent, -1).await;
        outcome
    }

    /// spec §4.7 `link`.
    pub async fn link(&self, entry: &Arc<Entry>, dir: &Arc<Entry>, name: &str) -> Result<(), CacheError> {
        let entry_key = entry.key().ok_or(CacheError::Killed)?;
        let dir_key = dir.key().ok_or(CacheError::Killed)?;

        self.backend
            .link(entry_key.handle_bytes(), dir_key.handle_bytes(), name)
            .await
            .map_err(|e| self.map_backend_err(Some(entry), e, entry_key.backend_id()))?;

        {
            let mut content = dir.content_lock.write().await;
            if let Variant::Directory { tree, .. } = &mut content.variant {
                tree.insert_live(name, entry_key)?;
            }
        }
        {
            let mut attrs = entry.attr_lock.write().await;
            attrs.trust.remove(TrustFlags::TRUST_ATTRS);
        }
        let _ = self.refresh_attrs_if_untrusted(entry).await;
        Ok(())
    }

    /// spec §4.7 `unlink`. Forces `close` on the target first if it is open
    /// (spec §9's platform note on silly-rename avoidance; see
    /// `DESIGN.md` for the decision to keep it unconditional here).
    pub async fn unlink(&self, dir: &Arc<Entry>, name: &str) -> Result<(), CacheError> {
        let dir_key = dir.key().ok_or(CacheError::Killed)?;

        let victim_key = {
            let content = dir.content_lock.read().await;
            match &content.variant {
                Variant::Directory { tree, .. } => tree.lookup_live(name).map(|r| r.child_key.clone()),
                _ => return Err(CacheError::NotADirectory),
            }
        };

        if let Some(key) = &victim_key {
            if let Ok(victim) = self.get_protected(key.clone()).await {
                self.close_if_open(&victim).await;
                self.put(&victim);
            }
        }

        self.backend
            .unlink(dir_key.handle_bytes(), name)
            .await
            .map_err(|e| self.map_backend_err(Some(dir), e, dir_key.backend_id()))?;

        {
            let mut content = dir.content_lock.write().await;
            if let Variant::Directory { tree, .. } = &mut content.variant {
                tree.delete(name);
            }
        }
        Ok(())
    }

    async fn close_if_open(&self, entry: &Arc<Entry>) {
        let mut content = entry.content_lock.write().await;
        if let Variant::RegularFile { descriptor, .. } = &mut content.variant {
            if descriptor.is_open() {
                if let Some(key) = entry.key() {
                    let _ = self.backend.close(key.handle_bytes()).await;
                }
                *descriptor = DescriptorStatus::Closed;
                self.reclaimer.note_descriptor_closed();
            }
        }
    }

    /// spec §4.7 `rename`.
    pub async fn rename(
        &self,
        old_dir: &Arc<Entry>,
        old_name: &str,
        new_dir: &Arc<Entry>,
        new_name: &str,
    ) -> Result<(), CacheError> {
        let old_dir_key = old_dir.key().ok_or(CacheError::Killed)?;
        let new_dir_key = new_dir.key().ok_or(CacheError::Killed)?;

        let clobbered_key = {
            let content = new_dir.content_lock.read().await;
            match &content.variant {
                Variant::Directory { tree, .. } => tree.lookup_live(new_name).map(|r| r.child_key.clone()),
                _ => return Err(CacheError::NotADirectory),
            }
        };
        if let Some(key) = clobbered_key {
            if let Ok(victim) = self.get_protected(key).await {
                self.lru.kill(&victim, &self.index);
                self.put(&victim);
            }
        }

        self.backend
            .rename(old_dir_key.handle_bytes(), old_name, new_dir_key.handle_bytes(), new_name)
            .await
            .map_err(|e| self.map_backend_err(Some(old_dir), e, old_dir_key.backend_id()))?;

        if Arc::ptr_eq(old_dir, new_dir) {
            let mut content = old_dir.content_lock.write().await;
            if let Variant::Directory { tree, .. } = &mut content.variant {
                tree.rename(old_name, new_name)?;
            }
        } else {
            let moved_key = {
                let mut content = old_dir.content_lock.write().await;
                match &mut content.variant {
                    Variant::Directory { tree, .. } => {
                        let key = tree.lookup_live(old_name).map(|r| r.child_key.clone());
                        tree.delete(old_name);
                        key
                    }
                    _ => None,
                }
            };
            if let Some(key) = moved_key {
                let mut content = new_dir.content_lock.write().await;
                if let Variant::Directory { tree, .. } = &mut content.variant {
                    tree.insert_live(new_name, key)?;
                }
            }
        }

        for dir in [old_dir, new_dir] {
            let mut attrs = dir.attr_lock.write().await;
            attrs.trust.remove(TrustFlags::TRUST_ATTRS);
        }
        Ok(())
    }

    /// spec §4.7 `readlink(entry) -> bytes`.
    pub async fn readlink(&self, entry: &Arc<Entry>) -> Result<String, CacheError> {
        {
            let content = entry.content_lock.read().await;
            match &content.variant {
                Variant::Symlink { target: Some(target) } => {
                    let attrs = entry.attr_lock.read().await;
                    if attrs.trust.contains(TrustFlags::TRUST_CONTENT) {
                        return Ok(target.clone());
                    }
                }
                Variant::Symlink { target: None } => {}
                _ => return Err(CacheError::NotSymlink),
            }
        }

        let mut content = entry.content_lock.write().await;
        let key = entry.key().ok_or(CacheError::Killed)?;
        let target = self
            .backend
            .readlink(key.handle_bytes(), true)
            .await
            .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;

        if let Variant::Symlink { target: slot } = &mut content.variant {
            *slot = Some(target.clone());
        }
        drop(content);
        let mut attrs = entry.attr_lock.write().await;
        attrs.trust.insert(TrustFlags::TRUST_CONTENT);
        Ok(target)
    }

    /// spec §4.7 `readdir(dir, start_cookie, cb) -> (nbfound, eod)`.
    ///
    /// Populates the directory from the backend first if it is not already
    /// trusted, then walks live dirents from `start_cookie`, resolving each
    /// child through [`Self::get_protected`] rather than holding
    /// `content_lock` across the callback (spec §4.6 "Enumeration may drop
    /// and re-acquire the parent's `content_lock` between yielded entries").
    pub async fn readdir(
        &self,
        dir: &Arc<Entry>,
        start_cookie: u64,
        mut cb: impl FnMut(&str, &Arc<Entry>, u64) -> bool,
    ) -> Result<(u64, bool), CacheError> {
        if start_cookie == 1 || start_cookie == 2 {
            return Err(CacheError::BadCookie);
        }

        self.populate_if_needed(dir).await?;

        let mut found = 0u64;
        let mut eod = true;
        let mut skipped_stale = false;
        let mut cursor = start_cookie;

        loop {
            let batch: Vec<(String, Key, u64)> = {
                let content = dir.content_lock.read().await;
                let tree = match &content.variant {
                    Variant::Directory { tree, .. } => tree,
                    _ => return Err(CacheError::NotADirectory),
                };
                tree.resume_from(cursor)
                    .map(|rec| (rec.name.clone(), rec.child_key.clone(), rec.cookie))
                    .collect()
            };

            if batch.is_empty() {
                break;
            }

            for (name, key, cookie) in batch {
                cursor = cookie.wrapping_add(1);
                let child = match self.get_protected(key).await {
                    Ok(c) => c,
                    Err(_) => {
                        skipped_stale = true;
                        continue;
                    }
                };
                let keep_going = cb(&name, &child, cookie);
                self.put(&child);
                found += 1;
                if !keep_going {
                    eod = false;
                    break;
                }
            }
            if !eod {
                break;
            }
        }

        if skipped_stale {
            let mut attrs = dir.attr_lock.write().await;
            attrs.trust.remove(TrustFlags::TRUST_CONTENT | TrustFlags::DIR_POPULATED);
        }

        Ok((found, eod))
    }

    async fn populate_if_needed(&self, dir: &Arc<Entry>) -> Result<(), CacheError> {
        {
            let attrs = dir.attr_lock.read().await;
            if attrs.trust.contains(TrustFlags::TRUST_CONTENT | TrustFlags::DIR_POPULATED) {
                return Ok(());
            }
        }

        let key = dir.key().ok_or(CacheError::Killed)?;
        let mut entries: Vec<(String, u64)> = Vec::new();
        let mut truncated = false;
        {
            let mut cb = |e: ReaddirEntry<'_>| -> bool {
                entries.push((e.name.to_owned(), e.cookie));
                true
            };
            let result = self.backend.readdir(key.handle_bytes(), 0, &mut cb).await;
            if let Err(e) = result {
                if self.config.retry_readdir {
                    return Err(self.map_backend_err(Some(dir), e, key.backend_id()));
                }
                truncated = true;
            }
        }

        for (name, _cookie) in &entries {
            let child_bytes = match self.backend.lookup(key.handle_bytes(), name).await {
                Ok(b) => b,
                Err(_) => {
                    // Recoverable: log and continue (spec §4.6 "Population").
                    tracing::debug!(name = %name, "readdir population skipped a name");
                    truncated = true;
                    continue;
                }
            };
            let child_key = Key::new(key.backend_id(), &child_bytes);
            let attr = match self.backend.getattrs(child_key.handle_bytes()).await {
                Ok(a) => a,
                Err(_) => {
                    truncated = true;
                    continue;
                }
            };
            let _child = self.insert_new_entry(child_key.clone(), attr).await?;

            let mut content = dir.content_lock.write().await;
            if let Variant::Directory { tree, .. } = &mut content.variant {
                let _ = tree.insert_live(name, child_key);
            }
        }

        if !truncated {
            let mut attrs = dir.attr_lock.write().await;
            attrs.trust.insert(TrustFlags::TRUST_CONTENT | TrustFlags::DIR_POPULATED);
        }
        Ok(())
    }

    /// spec §4.7 `open(entry, flags)`.
    pub async fn open(&self, entry: &Arc<Entry>, flags: OpenFlags) -> Result<(), CacheError> {
        let key = entry.key().ok_or(CacheError::Killed)?;
        let mut content = entry.content_lock.write().await;
        let (descriptor, open_count) = match &mut content.variant {
            Variant::RegularFile { descriptor, open_count, .. } => (descriptor, open_count),
            _ => return Err(CacheError::BadType),
        };

        if descriptor.is_open() && descriptor.satisfies(status_for(flags)) {
            *open_count += 1;
            return Ok(());
        }

        if descriptor.is_open() {
            // Promote the descriptor (spec.md:303). If the backend can't
            // reopen in place, fall back to close-then-open.
            match self.backend.reopen(key.handle_bytes(), flags).await {
                Ok(()) => {}
                Err(BackendError::NotSupported) => {
                    self.backend
                        .close(key.handle_bytes())
                        .await
                        .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;
                    self.backend
                        .open(key.handle_bytes(), flags)
                        .await
                        .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;
                }
                Err(e) => return Err(self.map_backend_err(Some(entry), e, key.backend_id())),
            }
        } else {
            self.backend
                .open(key.handle_bytes(), flags)
                .await
                .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;
            self.reclaimer.note_descriptor_opened();
        }
        *descriptor = status_for(flags);
        *open_count += 1;
        Ok(())
    }

    /// spec §4.7 `close(entry, flags)`. A no-op, not an error, on an entry
    /// that is not really open.
    pub async fn close(&self, entry: &Arc<Entry>, flags: CloseFlags) -> Result<(), CacheError> {
        let mut content = entry.content_lock.write().await;
        let (descriptor, open_count) = match &mut content.variant {
            Variant::RegularFile { descriptor, open_count, .. } => (descriptor, open_count),
            _ => return Ok(()),
        };
        if !descriptor.is_open() {
            return Ok(());
        }
        if *open_count > 0 {
            *open_count -= 1;
        }

        let should_really_close = flags.contains(CloseFlags::REALLY_CLOSE)
            || (*open_count == 0 && entry.pin_refcnt() == 0);
        if !should_really_close {
            return Ok(());
        }

        if let Some(key) = entry.key() {
            self.backend
                .close(key.handle_bytes())
                .await
                .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;
        }
        *descriptor = DescriptorStatus::Closed;
        self.reclaimer.note_descriptor_closed();
        Ok(())
    }

    /// spec §4.7 `rdwr(entry, dir, offset, len, buf, sync?) -> bytes_moved`.
    pub async fn read(&self, entry: &Arc<Entry>, offset: u64, len: u32) -> Result<(Vec<u8>, bool), CacheError> {
        self.open(entry, OpenFlags::Read).await?;
        let key = entry.key().ok_or(CacheError::Killed)?;
        let result = self
            .backend
            .read(key.handle_bytes(), offset, len)
            .await
            .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()));
        let _ = self.close(entry, CloseFlags::empty()).await;
        result
    }

    pub async fn write(
        &self,
        entry: &Arc<Entry>,
        offset: u64,
        bytes: &[u8],
        sync: bool,
    ) -> Result<(u32, bool), CacheError> {
        self.open(entry, OpenFlags::Write).await?;
        let key = entry.key().ok_or(CacheError::Killed)?;
        let result = self
            .backend
            .write(key.handle_bytes(), offset, bytes, sync)
            .await
            .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()));

        if result.is_ok() {
            let mut attrs = entry.attr_lock.write().await;
            attrs.trust.remove(TrustFlags::TRUST_ATTRS);
        }
        let _ = self.close(entry, CloseFlags::empty()).await;
        result
    }

    pub async fn commit(&self, entry: &Arc<Entry>, offset: u64, len: u32) -> Result<(), CacheError> {
        let key = entry.key().ok_or(CacheError::Killed)?;
        self.backend
            .commit(key.handle_bytes(), offset, len)
            .await
            .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))
    }

    /// spec §4.7 `setattr(entry, attrs, is_open_write) -> attrs_out`.
    /// `is_open_write` skips the permission check: a caller that already
    /// holds the entry open for write has already cleared access control on
    /// the way in, and NFSv3-style clients rely on being able to shrink a
    /// file they opened for write even if their credential's mode bits
    /// would otherwise deny a bare `setattr` (spec.md:209).
    pub async fn setattr(
        &self,
        entry: &Arc<Entry>,
        set_attr: SetAttr,
        cred: &Credential,
        is_open_write: bool,
    ) -> Result<FileAttr, CacheError> {
        let key = entry.key().ok_or(CacheError::Killed)?;
        if !is_open_write {
            self.backend
                .access(key.handle_bytes(), cred, AccessMask::WRITE)
                .await
                .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;
        }
        let fresh = self
            .backend
            .setattrs(key.handle_bytes(), set_attr)
            .await
            .map_err(|e| self.map_backend_err(Some(entry), e, key.backend_id()))?;

        let mut attrs = entry.attr_lock.write().await;
        let old_change = attrs.attrs.as_ref().map(|a| a.change);
        let mut fresh = fresh;
        if Some(fresh.change) == old_change {
            fresh.change = fresh.change.wrapping_add(1);
        }
        let out = fresh.clone();
        attrs.attrs = Some(fresh);
        attrs.expiry = Some(Instant::now() + self.attr_ttl());
        attrs.trust.insert(TrustFlags::TRUST_ATTRS);
        Ok(out)
    }

    /// spec §4.7 `invalidate(entry, which)`.
    pub async fn invalidate(&self, entry: &Arc<Entry>, attrs: bool, content: bool, close_descriptor: bool) {
        if attrs {
            let mut a = entry.attr_lock.write().await;
            a.trust.remove(TrustFlags::TRUST_ATTRS);
        }
        if content {
            let mut a = entry.attr_lock.write().await;
            a.trust.remove(TrustFlags::TRUST_CONTENT | TrustFlags::DIR_POPULATED);
        }
        if close_descriptor {
            self.close_if_open(entry).await;
        }
    }
}

fn status_for(flags: OpenFlags) -> DescriptorStatus {
    match flags {
        OpenFlags::Read => DescriptorStatus::Read,
        OpenFlags::Write => DescriptorStatus::Write,
        OpenFlags::ReadWrite => DescriptorStatus::ReadWrite,
    }
}

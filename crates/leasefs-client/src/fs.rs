//! The filesystem service.
//!
//! [`LeaseFs`] owns the caches and answers one filesystem call per method.
//! Every call maps the caller's credentials to a virtual identity, takes the
//! tracker monitors of the inodes it changes and checks access through the
//! capability of the directory involved. Files use the capability of their
//! parent directory.
//!
//! # Sync and Async Mutations
//!
//! Namespace mutations either wait for the remote (`*_is_sync` in
//! [`ClientConfig`]) or are queued for the background flusher. Hard-link
//! changes and `O_EXCL` creates always wait.

use crate::attr::{DirEntry, EntryAttr, FileAttr, FileKind, SetAttrRequest};
use crate::caps::{Capability, CapabilityCache};
use crate::config::ClientConfig;
use crate::data::{AttachOutcome, DataCache, DataContext};
use crate::error::{FsError, FsResult};
use crate::handles::{DirHandle, Handles, OpenFile};
use crate::kernel::{KernelNotifier, NoopNotifier};
use crate::md::{MetadataCache, MetadataRecord, RecordState, Removal};
use crate::tracker::InodeTracker;
use crate::vmap::InodeMap;
use bytes::Bytes;
use leasefs_common::{ClientStats, ClientStatsSnapshot, ExponentialBackoff};
use leasefs_core::types::mode_is_dir;
use leasefs_core::{
    AccessMask, FileLock, IdentityProvider, LockKind, RemoteAuthorizer, RemoteError,
    RemoteNamespace, RemoteStorage, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, Timespec,
    TransportCredentials, VirtualIdentity,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Setting this attribute drops the caller's capability on the inode.
pub const DROP_CAP_XATTR: &str = "system.leasefs.dropcap";

/// Setting this attribute drops every cached capability (sudoers only).
pub const DROP_ALL_CAPS_XATTR: &str = "system.leasefs.dropallcap";

/// The remote services a mount talks to.
#[derive(Clone)]
pub struct Remotes {
    /// Namespace service.
    pub namespace: Arc<dyn RemoteNamespace>,
    /// Authorization service.
    pub authorizer: Arc<dyn RemoteAuthorizer>,
    /// Byte-stream storage.
    pub storage: Arc<dyn RemoteStorage>,
    /// Remote id of the mount root.
    pub root: u64,
}

impl fmt::Debug for Remotes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remotes")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Reply to `open` and `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// File handle.
    pub fh: u64,
    /// The kernel may keep its data cache.
    pub keep_cache: bool,
}

/// The client filesystem.
pub struct LeaseFs {
    config: ClientConfig,
    identities: Arc<dyn IdentityProvider>,
    namespace: Arc<dyn RemoteNamespace>,
    notifier: Arc<dyn KernelNotifier>,
    tracker: InodeTracker,
    vmap: Arc<InodeMap>,
    md: MetadataCache,
    caps: CapabilityCache,
    data: DataCache,
    handles: Handles,
    stats: Arc<ClientStats>,
}

impl fmt::Debug for LeaseFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseFs")
            .field("records", &self.md.len())
            .field("caps", &self.caps.len())
            .field("contexts", &self.data.len())
            .field("open_files", &self.handles.file_count())
            .field("open_dirs", &self.handles.dir_count())
            .finish_non_exhaustive()
    }
}

impl LeaseFs {
    /// Mounts the remote root described by `remotes`.
    ///
    /// Fails if the configuration is invalid or the root cannot be fetched.
    pub fn new(
        config: ClientConfig,
        identities: Arc<dyn IdentityProvider>,
        remotes: Remotes,
    ) -> FsResult<Self> {
        config.validate().map_err(|e| {
            warn!(error = %e, "rejecting client configuration");
            FsError::InvalidArgument("client configuration")
        })?;
        let root = remotes.namespace.get_entry(remotes.root)?;
        if !root.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let stats = Arc::new(ClientStats::new());
        let vmap = Arc::new(InodeMap::new(remotes.root));
        let md = MetadataCache::new(
            &config,
            Arc::clone(&remotes.namespace),
            Arc::clone(&vmap),
            Arc::clone(&stats),
            &root,
        )?;
        let caps = CapabilityCache::new(
            remotes.authorizer,
            config.lease_time,
            config.denied_cap_ttl,
            stats.cap_cache_stats(),
        );
        let data = DataCache::new(
            remotes.storage,
            Arc::clone(&stats),
            config.read_ahead.clone(),
            config.write_back_threshold,
        );
        info!(root = remotes.root, "leasefs client mounted");
        Ok(Self {
            config,
            identities,
            namespace: remotes.namespace,
            notifier: Arc::new(NoopNotifier),
            tracker: InodeTracker::new(),
            vmap,
            md,
            caps,
            data,
            handles: Handles::new(),
            stats,
        })
    }

    /// Sends kernel cache invalidations to `notifier`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn KernelNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The metadata cache.
    pub fn metadata(&self) -> &MetadataCache {
        &self.md
    }

    /// The capability cache.
    pub fn capabilities(&self) -> &CapabilityCache {
        &self.caps
    }

    /// The data cache.
    pub fn data(&self) -> &DataCache {
        &self.data
    }

    /// Remote id bound to the local `ino`, zero while a create is queued.
    pub fn remote_ino(&self, ino: u64) -> Option<u64> {
        self.vmap.remote(ino)
    }

    /// Counters of this mount.
    pub fn stats(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops the flush worker after it ran the queued mutations.
    pub fn shutdown(&self) {
        info!(
            queued = self.md.queue_depth(),
            open_files = self.handles.file_count(),
            "leasefs client shutting down"
        );
        self.md.shutdown();
        self.tracker.cleanup_unused();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn metadata_op<T>(&self, op: &'static str, f: impl FnOnce() -> FsResult<T>) -> FsResult<T> {
        self.stats.record_metadata_op();
        self.finish(op, f())
    }

    fn data_op<T>(&self, op: &'static str, f: impl FnOnce() -> FsResult<T>) -> FsResult<T> {
        self.stats.record_op();
        self.finish(op, f())
    }

    fn finish<T>(&self, op: &'static str, result: FsResult<T>) -> FsResult<T> {
        if let Err(e) = &result {
            self.stats.record_error();
            let category = e.category();
            if category.class().is_deterministic() {
                debug!(op, error = %e, category = category.name(), errno = e.to_errno(), "operation failed");
            } else {
                warn!(op, error = %e, category = category.name(), "operation failed on remote");
            }
        }
        result
    }

    fn identity(&self, creds: &TransportCredentials) -> FsResult<Arc<VirtualIdentity>> {
        Ok(self.identities.map(creds)?)
    }

    fn check_name(&self, name: &str) -> FsResult<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::InvalidArgument("name"));
        }
        if name.len() > self.config.max_name_len {
            return Err(FsError::NameTooLong);
        }
        Ok(())
    }

    fn entry(&self, rec: &MetadataRecord) -> EntryAttr {
        EntryAttr {
            attr: rec.attr(),
            ttl: self.config.attr_ttl,
        }
    }

    /// Capability of `id` on the directory `dir` granting `mask`.
    fn dir_cap(
        &self,
        id: &VirtualIdentity,
        dir: &MetadataRecord,
        mask: AccessMask,
        for_listing: bool,
    ) -> FsResult<Arc<Capability>> {
        if !dir.lock().is_dir() {
            return Err(FsError::NotDirectory);
        }
        let remote = dir.remote_ino();
        let mut cap = self.caps.acquire(id, dir.ino(), remote, mask, for_listing);
        if cap.error().is_some() && remote == 0 {
            // No implied capability cached and the directory is still queued.
            self.md.wait_flush(dir)?;
            cap = self
                .caps
                .acquire(id, dir.ino(), dir.remote_ino(), mask, for_listing);
        }
        cap.check()?;
        Ok(cap)
    }

    /// Capability covering `rec`: its own for a directory, else its parent's.
    fn cap_for(
        &self,
        id: &VirtualIdentity,
        rec: &MetadataRecord,
        mask: AccessMask,
    ) -> FsResult<Arc<Capability>> {
        let (is_dir, parent) = {
            let s = rec.lock();
            (s.is_dir(), s.parent)
        };
        if is_dir {
            return self.dir_cap(id, rec, mask, false);
        }
        let prec = self.md.get(parent)?;
        self.dir_cap(id, &prec, mask, false)
    }

    /// Ino of the directory whose capability covers `rec`.
    fn cap_scope(rec: &MetadataRecord) -> u64 {
        let s = rec.lock();
        if s.is_dir() { rec.ino() } else { s.parent }
    }

    /// Creates `name` in `parent` and takes one kernel reference on it.
    #[allow(clippy::too_many_arguments)]
    fn make_node(
        &self,
        id: &VirtualIdentity,
        parent: u64,
        name: &str,
        mode: u32,
        target: Option<&str>,
        sync: bool,
        reserve: u64,
    ) -> FsResult<(Arc<MetadataRecord>, Arc<Capability>)> {
        self.check_name(name)?;
        let prec = self.md.get(parent)?;
        let pcap = self.dir_cap(
            id,
            &prec,
            AccessMask::W_OK | AccessMask::X_OK | AccessMask::DIR,
            false,
        )?;
        if prec.lock().has_pending_delete(name) {
            debug!(parent, name, "waiting for pending delete of the same name");
            self.md.wait_deleted(&prec, name)?;
        }
        match self.md.resolve(parent, name) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        if !pcap.has_quota(reserve) || !pcap.book_inode() {
            debug!(
                parent,
                name,
                volume = pcap.volume_quota(),
                inodes = pcap.inode_quota(),
                "quota exhausted"
            );
            return Err(FsError::QuotaExceeded);
        }

        let mut state = RecordState::new_local(parent, name, mode, pcap.uid(), pcap.gid());
        if let Some(target) = target {
            state.size = target.len() as u64;
            state.symlink_target = Some(target.to_string());
        }
        let ino = self.md.insert(state);
        let added = self.md.record(ino).ok_or(FsError::NotFound).and_then(|rec| {
            if sync {
                self.md.add_sync(&prec, &rec, pcap.authid())?;
            } else {
                self.md.add(&prec, &rec, pcap.authid())?;
            }
            Ok(rec)
        });
        let rec = match added {
            Ok(rec) => rec,
            Err(e) => {
                pcap.free_inode();
                return Err(e);
            }
        };
        if mode_is_dir(mode) {
            self.caps
                .imply(&pcap, Uuid::new_v4().to_string(), mode, ino);
            prec.lock().nlink += 1;
        }
        self.md.reference(&rec);
        debug!(parent, name, ino, sync, "node created");
        Ok((rec, pcap))
    }

    fn open_handle(
        &self,
        id: Arc<VirtualIdentity>,
        rec: Arc<MetadataRecord>,
        cap: Arc<Capability>,
        writable: bool,
        truncate: bool,
    ) -> FsResult<Opened> {
        let ctx = self.data.get(&rec);
        let cookie = rec.lock().cookie;
        let outcome = ctx.attach(cookie, writable);
        if outcome == AttachOutcome::Expired {
            self.notifier.invalidate_inode(rec.ino());
        }
        if truncate
            && writable
            && let Err(e) = ctx.truncate(&cap, 0)
        {
            if let Err(e) = ctx.detach(writable) {
                warn!(ino = rec.ino(), error = %e, "detach after failed truncate");
            }
            return Err(e);
        }
        let keep_cache = self.config.keep_data_cache && outcome != AttachOutcome::Expired && !truncate;
        let ino = rec.ino();
        let fh = self
            .handles
            .open_file(OpenFile::new(rec, ctx, id, cap, writable));
        self.stats.record_file_open();
        debug!(ino, fh, writable, keep_cache, "file opened");
        Ok(Opened { fh, keep_cache })
    }

    fn handle(&self, ino: u64, fh: u64) -> FsResult<Arc<OpenFile>> {
        let handle = self.handles.file(fh)?;
        if handle.ino != ino {
            return Err(FsError::BadHandle(fh));
        }
        Ok(handle)
    }

    /// Renews the capability of `handle` once it expired.
    fn handle_cap(&self, handle: &OpenFile) -> FsResult<Arc<Capability>> {
        let cap = handle.cap();
        if !cap.is_expired() {
            return Ok(cap);
        }
        let cap = self.cap_for(&handle.identity, &handle.record, AccessMask::W_OK)?;
        handle.set_cap(Arc::clone(&cap));
        debug!(ino = handle.ino, "handle capability renewed");
        Ok(cap)
    }

    /// Books the size change of `handle`, pushes its staged data and queues
    /// the attribute update.
    fn push_data(&self, handle: &OpenFile) -> FsResult<()> {
        let cap = self.handle_cap(handle)?;
        handle.data.account(&cap)?;
        if handle.record.remote_ino() == 0 {
            self.md.wait_flush(&handle.record)?;
        }
        if let Err(e) = handle.data.flush() {
            return Err(self.push_failed(&handle.data, handle.ino, &cap, e));
        }
        self.md.update(&handle.record, cap.authid())
    }

    /// Invalidates `ino` after a failed data push and returns the volume
    /// booked for the dropped growth.
    fn push_failed(&self, data: &DataContext, ino: u64, cap: &Capability, e: FsError) -> FsError {
        self.notifier.invalidate_inode(ino);
        if let Err(err) = data.account(cap) {
            warn!(ino, error = %err, "settling quota after failed push");
        }
        e
    }

    /// Remote id of `rec` for lock calls, waiting for a queued create.
    fn lock_target(&self, rec: &MetadataRecord) -> FsResult<u64> {
        if rec.remote_ino() == 0 {
            self.md.wait_flush(rec)?;
        }
        Ok(rec.remote_ino())
    }

    fn unlock_owner(&self, remote: u64, owner: u64) {
        let all = FileLock {
            kind: LockKind::Unlock,
            start: 0,
            len: 0,
            pid: 0,
        };
        if let Err(e) = self.namespace.set_lock(remote, owner, &all) {
            warn!(remote, owner, error = %e, "releasing byte-range locks failed");
        }
    }

    /// Evicts `rec` once the kernel no longer references it.
    fn evict_if_unused(&self, rec: &Arc<MetadataRecord>) {
        if self.md.evict(rec) {
            self.tracker.forget(rec.ino());
            self.caps.forget(rec.ino());
            self.data.release(rec.ino());
        }
    }

    /// Drops the data of a deleted record unless a handle still reads it.
    fn drop_data(&self, rec: &Arc<MetadataRecord>) {
        if self.handles.files_of(rec.ino()).is_empty() {
            self.data.discard(rec.ino());
        }
        self.evict_if_unused(rec);
    }

    // ========================================================================
    // Names and Attributes
    // ========================================================================

    /// Resolves `name` in `parent`.
    pub fn lookup(&self, creds: &TransportCredentials, parent: u64, name: &str) -> FsResult<EntryAttr> {
        trace!(parent, name, "lookup");
        self.metadata_op("lookup", || {
            if name.len() > self.config.max_name_len {
                return Err(FsError::NameTooLong);
            }
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(parent, false);
            let prec = self.md.get(parent)?;
            self.dir_cap(&id, &prec, AccessMask::X_OK, false)?;
            let rec = self.md.lookup(parent, name)?;
            Ok(self.entry(&rec))
        })
    }

    /// Attributes of `ino`.
    pub fn getattr(&self, creds: &TransportCredentials, ino: u64) -> FsResult<FileAttr> {
        trace!(ino, "getattr");
        self.metadata_op("getattr", || {
            self.identity(creds)?;
            let rec = self.md.get(ino)?;
            let mut attr = rec.attr();
            if let Some(ctx) = self.data.lookup(ino)
                && ctx.is_dirty()
            {
                attr.size = ctx.size();
            }
            Ok(attr)
        })
    }

    /// Drops `nlookup` kernel references of `ino`.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.stats.record_metadata_op();
        trace!(ino, nlookup, "forget");
        if self.md.forget(ino, nlookup) {
            self.tracker.forget(ino);
            self.caps.forget(ino);
            self.data.release(ino);
        }
    }

    /// Changes mode, owner, size or times of `ino`.
    pub fn setattr(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: Option<u64>,
        req: &SetAttrRequest,
    ) -> FsResult<FileAttr> {
        trace!(ino, ?fh, ?req, "setattr");
        self.metadata_op("setattr", || {
            let id = self.identity(creds)?;
            if let Some(fh) = fh {
                self.handle(ino, fh)?;
            }
            let _monitor = self.tracker.monitor(ino, true);
            let rec = self.md.get(ino)?;

            let mut mask = AccessMask::NONE;
            if req.mode.is_some() {
                mask |= AccessMask::M_OK;
            }
            if req.changes_owner() {
                mask |= AccessMask::C_OK;
            }
            if req.size.is_some() {
                mask |= AccessMask::W_OK;
            }
            let cap = self.cap_for(&id, &rec, mask)?;
            if req.changes_times() && !cap.allows(AccessMask::W_OK) && !cap.allows(AccessMask::SU_OK) {
                return Err(FsError::AccessDenied);
            }

            if let Some(size) = req.size {
                if rec.lock().is_dir() {
                    return Err(FsError::IsDirectory);
                }
                if rec.remote_ino() == 0 {
                    self.md.wait_flush(&rec)?;
                }
                let ctx = self.data.get(&rec);
                let cookie = rec.lock().cookie;
                ctx.attach(cookie, true);
                let truncated = ctx.truncate(&cap, size);
                let detached = ctx.detach(true);
                truncated?;
                if let Err(e) = detached {
                    return Err(self.push_failed(&ctx, ino, &cap, e));
                }
            }

            {
                let mut s = rec.lock();
                if let Some(mode) = req.mode {
                    s.mode = (s.mode & S_IFMT) | (mode & 0o7777);
                }
                if let Some(uid) = req.uid {
                    s.uid = uid;
                }
                if let Some(gid) = req.gid {
                    s.gid = gid;
                }
                if let Some(atime) = req.atime {
                    s.atime = atime;
                }
                if let Some(mtime) = req.mtime {
                    s.mtime = mtime;
                }
                s.ctime = Timespec::now();
            }
            self.md.update(&rec, cap.authid())?;
            Ok(rec.attr())
        })
    }

    // ========================================================================
    // Namespace Mutations
    // ========================================================================

    /// Creates the directory `name` in `parent`.
    pub fn mkdir(
        &self,
        creds: &TransportCredentials,
        parent: u64,
        name: &str,
        mode: u32,
    ) -> FsResult<EntryAttr> {
        trace!(parent, name, mode, "mkdir");
        self.metadata_op("mkdir", || {
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(parent, true);
            let (rec, _) = self.make_node(
                &id,
                parent,
                name,
                S_IFDIR | (mode & 0o7777),
                None,
                self.config.mkdir_is_sync,
                0,
            )?;
            Ok(self.entry(&rec))
        })
    }

    /// Creates the node `name` in `parent`; regular file unless `mode`
    /// carries another type.
    pub fn mknod(
        &self,
        creds: &TransportCredentials,
        parent: u64,
        name: &str,
        mode: u32,
    ) -> FsResult<EntryAttr> {
        trace!(parent, name, mode, "mknod");
        self.metadata_op("mknod", || {
            let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
            if mode_is_dir(mode) {
                return Err(FsError::InvalidArgument("mknod of a directory"));
            }
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(parent, true);
            let (rec, _) = self.make_node(
                &id,
                parent,
                name,
                mode,
                None,
                self.config.create_is_sync,
                self.config.open_quota_reserve,
            )?;
            Ok(self.entry(&rec))
        })
    }

    /// Creates and opens the regular file `name` in `parent`.
    pub fn create(
        &self,
        creds: &TransportCredentials,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
    ) -> FsResult<(EntryAttr, Opened)> {
        trace!(parent, name, mode, flags, "create");
        self.metadata_op("create", || {
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(parent, true);
            let sync = self.config.create_is_sync || flags & libc::O_EXCL != 0;
            let (rec, pcap) = self.make_node(
                &id,
                parent,
                name,
                S_IFREG | (mode & 0o7777),
                None,
                sync,
                self.config.open_quota_reserve,
            )?;
            let entry = self.entry(&rec);
            let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
            let opened = self.open_handle(id, rec, pcap, writable, false)?;
            Ok((entry, opened))
        })
    }

    /// Creates the symlink `name` in `parent` pointing at `target`.
    pub fn symlink(
        &self,
        creds: &TransportCredentials,
        parent: u64,
        name: &str,
        target: &str,
    ) -> FsResult<EntryAttr> {
        trace!(parent, name, target, "symlink");
        self.metadata_op("symlink", || {
            if target.is_empty() {
                return Err(FsError::InvalidArgument("empty symlink target"));
            }
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(parent, true);
            let (rec, _) = self.make_node(
                &id,
                parent,
                name,
                S_IFLNK | 0o777,
                Some(target),
                self.config.symlink_is_sync,
                0,
            )?;
            Ok(self.entry(&rec))
        })
    }

    /// Target of the symlink `ino`.
    pub fn readlink(&self, creds: &TransportCredentials, ino: u64) -> FsResult<String> {
        trace!(ino, "readlink");
        self.metadata_op("readlink", || {
            self.identity(creds)?;
            let rec = self.md.get(ino)?;
            let s = rec.lock();
            if !s.is_symlink() {
                return Err(FsError::InvalidArgument("not a symlink"));
            }
            s.symlink_target
                .clone()
                .ok_or(FsError::InvalidArgument("symlink without target"))
        })
    }

    /// Adds `new_name` in `new_parent` as a hard link to `ino`.
    pub fn link(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        new_parent: u64,
        new_name: &str,
    ) -> FsResult<EntryAttr> {
        trace!(ino, new_parent, new_name, "link");
        self.metadata_op("link", || {
            self.check_name(new_name)?;
            let id = self.identity(creds)?;
            let _monitors = self.tracker.monitor_pair(new_parent, ino);
            let rec = self.md.get(ino)?;
            let (is_dir, parent) = {
                let s = rec.lock();
                (s.is_dir(), s.parent)
            };
            if is_dir {
                return Err(FsError::NotPermitted);
            }
            if parent != new_parent {
                return Err(FsError::CrossDevice);
            }
            let prec = self.md.get(new_parent)?;
            let pcap = self.dir_cap(&id, &prec, AccessMask::W_OK | AccessMask::X_OK, false)?;
            if prec.lock().has_pending_delete(new_name) {
                self.md.wait_deleted(&prec, new_name)?;
            }
            match self.md.resolve(new_parent, new_name) {
                Ok(_) => return Err(FsError::AlreadyExists),
                Err(FsError::NotFound) => {}
                Err(e) => return Err(e),
            }
            self.md.add_link(&prec, new_name, &rec, pcap.authid())?;
            self.md.reference(&rec);
            self.notifier.invalidate_inode(ino);
            Ok(self.entry(&rec))
        })
    }

    /// Removes the non-directory `name` from `parent`.
    pub fn unlink(&self, creds: &TransportCredentials, parent: u64, name: &str) -> FsResult<()> {
        trace!(parent, name, "unlink");
        self.metadata_op("unlink", || {
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(parent, true);
            let prec = self.md.get(parent)?;
            let pcap = self.dir_cap(&id, &prec, AccessMask::W_OK | AccessMask::D_OK, false)?;
            if self.md.resolve(parent, name)?.lock().is_dir() {
                return Err(FsError::IsDirectory);
            }

            let (removal, rec) =
                self.md
                    .remove(parent, name, pcap.authid(), self.config.rmdir_is_sync)?;
            self.notifier.invalidate_entry(parent, name);
            match removal {
                Removal::Alias | Removal::Promoted => {
                    self.notifier.invalidate_inode(rec.ino());
                }
                Removal::Deleted => {
                    let size = rec.lock().size;
                    pcap.free_volume(size);
                    pcap.free_inode();
                    self.drop_data(&rec);
                }
            }
            Ok(())
        })
    }

    /// Removes the empty directory `name` from `parent`.
    pub fn rmdir(&self, creds: &TransportCredentials, parent: u64, name: &str) -> FsResult<()> {
        trace!(parent, name, "rmdir");
        self.metadata_op("rmdir", || {
            let id = self.identity(creds)?;
            let child = self.md.resolve(parent, name)?;
            let _monitors = self.tracker.monitor_pair(parent, child.ino());
            let prec = self.md.get(parent)?;
            let pcap = self.dir_cap(&id, &prec, AccessMask::W_OK | AccessMask::D_OK, false)?;

            let rec = self.md.resolve(parent, name)?;
            if rec.ino() != child.ino() {
                // Replaced while waiting for the monitors.
                return Err(FsError::NotFound);
            }
            if !rec.lock().is_dir() {
                return Err(FsError::NotDirectory);
            }
            self.md.load_listing(&rec)?;
            if !rec.lock().children.is_empty() {
                return Err(FsError::NotEmpty);
            }

            let (_, rec) = self
                .md
                .remove(parent, name, pcap.authid(), self.config.rmdir_is_sync)?;
            pcap.free_inode();
            {
                let mut p = prec.lock();
                p.nlink = p.nlink.saturating_sub(1);
            }
            self.notifier.invalidate_entry(parent, name);
            self.caps.forget(rec.ino());
            self.evict_if_unused(&rec);
            Ok(())
        })
    }

    /// Moves `name` in `parent` to `new_name` in `new_parent`.
    pub fn rename(
        &self,
        creds: &TransportCredentials,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> FsResult<()> {
        trace!(parent, name, new_parent, new_name, "rename");
        self.metadata_op("rename", || {
            self.check_name(new_name)?;
            let id = self.identity(creds)?;
            let _monitors = self.tracker.monitor_pair(parent, new_parent);
            let sprec = self.md.get(parent)?;
            let dprec = self.md.get(new_parent)?;
            let scap = self.dir_cap(&id, &sprec, AccessMask::W_OK | AccessMask::D_OK, false)?;
            let dcap = self.dir_cap(&id, &dprec, AccessMask::W_OK, false)?;

            let rec = self.md.resolve(parent, name)?;
            if rec.lock().pending() > 0 {
                self.md.wait_flush(&rec)?;
            }
            if dprec.lock().has_pending_delete(new_name) {
                self.md.wait_deleted(&dprec, new_name)?;
            }

            let replaced = self.md.mv(
                parent,
                name,
                new_parent,
                new_name,
                scap.authid(),
                self.config.rename_is_sync,
            )?;

            if rec.lock().is_dir() && parent != new_parent {
                {
                    let mut p = sprec.lock();
                    p.nlink = p.nlink.saturating_sub(1);
                }
                dprec.lock().nlink += 1;
            }
            self.notifier.invalidate_entry(parent, name);
            if let Some(old) = replaced {
                self.notifier.invalidate_entry(new_parent, new_name);
                if old.is_deleted() {
                    let (size, is_dir) = {
                        let s = old.lock();
                        (s.size, s.is_dir())
                    };
                    if is_dir {
                        let mut p = dprec.lock();
                        p.nlink = p.nlink.saturating_sub(1);
                    } else {
                        dcap.free_volume(size);
                    }
                    dcap.free_inode();
                    self.drop_data(&old);
                } else {
                    self.notifier.invalidate_inode(old.ino());
                }
            }
            Ok(())
        })
    }

    // ========================================================================
    // File I/O
    // ========================================================================

    /// Opens the file `ino`.
    pub fn open(&self, creds: &TransportCredentials, ino: u64, flags: i32) -> FsResult<Opened> {
        trace!(ino, flags, "open");
        self.data_op("open", || {
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(ino, false);
            let rec = self.md.get(ino)?;
            if rec.lock().is_dir() {
                return Err(FsError::IsDirectory);
            }
            if rec.is_deleted() {
                return Err(FsError::NotFound);
            }
            let access = flags & libc::O_ACCMODE;
            let writable = access != libc::O_RDONLY;
            let mut mask = AccessMask::NONE;
            if access != libc::O_WRONLY {
                mask |= AccessMask::R_OK;
            }
            if writable {
                mask |= AccessMask::W_OK;
            }
            let cap = self.cap_for(&id, &rec, mask)?;
            if writable && !cap.has_quota(self.config.open_quota_reserve) {
                return Err(FsError::QuotaExceeded);
            }
            let truncate = writable && flags & libc::O_TRUNC != 0;
            self.open_handle(id, rec, cap, writable, truncate)
        })
    }

    /// Reads up to `size` bytes of `ino` at `offset`.
    pub fn read(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FsResult<Bytes> {
        trace!(ino, fh, offset, size, "read");
        self.data_op("read", || {
            self.identity(creds)?;
            let handle = self.handle(ino, fh)?;
            handle.data.pread(offset, size as usize)
        })
    }

    /// Writes `data` to `ino` at `offset`; returns the bytes written.
    pub fn write(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> FsResult<u32> {
        trace!(ino, fh, offset, len = data.len(), "write");
        self.data_op("write", || {
            self.identity(creds)?;
            let handle = self.handle(ino, fh)?;
            if !handle.writable {
                return Err(FsError::BadHandle(fh));
            }
            let cap = self.handle_cap(&handle)?;
            if handle.data.pwrite(&cap, offset, data)? {
                debug!(ino, fh, "write-back threshold reached");
                self.push_data(&handle)?;
            }
            Ok(u32::try_from(data.len()).unwrap_or(u32::MAX))
        })
    }

    /// Pushes the data staged through `fh` and drops the byte-range locks
    /// of `lock_owner`.
    pub fn flush(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        lock_owner: u64,
    ) -> FsResult<()> {
        trace!(ino, fh, lock_owner, "flush");
        self.data_op("flush", || {
            self.identity(creds)?;
            let handle = self.handle(ino, fh)?;
            let pushed = if handle.writable {
                self.push_data(&handle)
            } else {
                Ok(())
            };
            if handle.take_lock_owner(lock_owner) {
                let remote = handle.record.remote_ino();
                if remote != 0 {
                    self.unlock_owner(remote, lock_owner);
                }
            }
            pushed
        })
    }

    /// Pushes staged data and commits the stream and attributes of `ino`.
    pub fn fsync(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        datasync: bool,
    ) -> FsResult<()> {
        trace!(ino, fh, datasync, "fsync");
        self.data_op("fsync", || {
            self.identity(creds)?;
            let handle = self.handle(ino, fh)?;
            if !handle.writable {
                return Ok(());
            }
            self.push_data(&handle)?;
            if let Err(e) = handle.data.sync() {
                return Err(self.push_failed(&handle.data, ino, &handle.cap(), e));
            }
            if datasync {
                return Ok(());
            }
            let cap = handle.cap();
            self.md.update_sync(&handle.record, cap.authid())?;
            self.md.wait_flush(&handle.record)
        })
    }

    /// Closes `fh`; the last handle of an inode pushes its staged data.
    pub fn release(&self, creds: &TransportCredentials, ino: u64, fh: u64) -> FsResult<()> {
        trace!(ino, fh, "release");
        self.data_op("release", || {
            self.identity(creds)?;
            self.handle(ino, fh)?;
            let handle = self.handles.close_file(fh)?;
            self.stats.record_file_close();

            let remote = handle.record.remote_ino();
            if remote != 0 {
                for owner in handle.lock_owners() {
                    self.unlock_owner(remote, owner);
                }
            }

            let mut result = Ok(());
            if handle.writable {
                result = self.handle_cap(&handle).and_then(|cap| {
                    handle.data.account(&cap)?;
                    if handle.data.is_dirty() && handle.record.remote_ino() == 0 {
                        self.md.wait_flush(&handle.record)?;
                    }
                    Ok(cap)
                }).map(|_| ());
            }
            let dirty = handle.data.is_dirty();
            if let Err(e) = handle.data.detach(handle.writable) {
                result = result.and(Err(self.push_failed(&handle.data, ino, &handle.cap(), e)));
            } else if handle.writable && dirty && !handle.record.is_deleted() {
                let cap = handle.cap();
                result = result.and_then(|()| self.md.update(&handle.record, cap.authid()));
            }

            if handle.record.is_deleted() {
                self.data.release(ino);
                self.evict_if_unused(&handle.record);
            }
            debug!(ino, fh, "file released");
            result
        })
    }

    // ========================================================================
    // Directories
    // ========================================================================

    /// Opens the directory `ino` and snapshots its listing.
    pub fn opendir(&self, creds: &TransportCredentials, ino: u64) -> FsResult<u64> {
        trace!(ino, "opendir");
        self.metadata_op("opendir", || {
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(ino, false);
            let rec = self.md.get(ino)?;
            self.dir_cap(&id, &rec, AccessMask::R_OK, true)?;
            self.md.load_listing(&rec)?;

            let parent = rec.lock().parent;
            let mut entries = vec![
                DirEntry {
                    ino,
                    offset: 1,
                    kind: FileKind::Directory,
                    name: ".".to_string(),
                },
                DirEntry {
                    ino: parent,
                    offset: 2,
                    kind: FileKind::Directory,
                    name: "..".to_string(),
                },
            ];
            for (name, child) in self.md.listing(&rec) {
                let kind = match self.md.record(child) {
                    Some(c) => FileKind::from_mode(c.lock().mode),
                    None => match self.md.get(child) {
                        Ok(c) => FileKind::from_mode(c.lock().mode),
                        Err(e) => {
                            debug!(ino, child, error = %e, "skipping vanished entry");
                            continue;
                        }
                    },
                };
                entries.push(DirEntry {
                    ino: child,
                    offset: entries.len() as u64 + 1,
                    kind,
                    name,
                });
            }

            rec.lock().take_opendir();
            let count = entries.len();
            let fh = self.handles.open_dir(DirHandle {
                ino,
                record: rec,
                entries,
            });
            self.stats.record_dir_open();
            debug!(ino, fh, entries = count, "directory opened");
            Ok(fh)
        })
    }

    /// Entries of the snapshot behind `fh` from `offset` on.
    pub fn readdir(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        offset: u64,
    ) -> FsResult<Vec<DirEntry>> {
        trace!(ino, fh, offset, "readdir");
        self.metadata_op("readdir", || {
            self.identity(creds)?;
            let dir = self.handles.dir(fh)?;
            if dir.ino != ino {
                return Err(FsError::BadHandle(fh));
            }
            let skip = usize::try_from(offset).unwrap_or(usize::MAX);
            Ok(dir.entries.iter().skip(skip).cloned().collect())
        })
    }

    /// Closes the directory handle `fh`.
    pub fn releasedir(&self, creds: &TransportCredentials, ino: u64, fh: u64) -> FsResult<()> {
        trace!(ino, fh, "releasedir");
        self.metadata_op("releasedir", || {
            self.identity(creds)?;
            let dir = self.handles.close_dir(fh)?;
            {
                let mut s = dir.record.lock();
                s.opendir_count = s.opendir_count.saturating_sub(1);
            }
            self.stats.record_dir_close();
            self.evict_if_unused(&dir.record);
            Ok(())
        })
    }

    /// Checks `mask` (`access(2)` bits) against the capability of `ino`.
    pub fn access(&self, creds: &TransportCredentials, ino: u64, mask: u32) -> FsResult<()> {
        trace!(ino, mask, "access");
        self.metadata_op("access", || {
            let id = self.identity(creds)?;
            let rec = self.md.get(ino)?;
            let wanted = AccessMask::from_posix(mask);
            if wanted.is_empty() {
                return Ok(());
            }
            self.cap_for(&id, &rec, wanted).map(|_| ())
        })
    }

    // ========================================================================
    // Extended Attributes
    // ========================================================================

    /// Value of the attribute `name` of `ino`.
    pub fn getxattr(&self, creds: &TransportCredentials, ino: u64, name: &str) -> FsResult<Vec<u8>> {
        trace!(ino, name, "getxattr");
        self.metadata_op("getxattr", || {
            let id = self.identity(creds)?;
            let rec = self.md.get(ino)?;
            self.cap_for(&id, &rec, AccessMask::R_OK)?;
            rec.lock()
                .xattrs
                .get(name)
                .cloned()
                .ok_or(FsError::NoAttribute)
        })
    }

    /// Sets the attribute `name` of `ino`.
    ///
    /// `flags` takes `XATTR_CREATE` or `XATTR_REPLACE`. The two control
    /// names [`DROP_CAP_XATTR`] and [`DROP_ALL_CAPS_XATTR`] act on the
    /// capability cache instead of storing a value.
    pub fn setxattr(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        name: &str,
        value: &[u8],
        flags: i32,
    ) -> FsResult<()> {
        trace!(ino, name, len = value.len(), flags, "setxattr");
        self.metadata_op("setxattr", || {
            let id = self.identity(creds)?;
            let rec = self.md.get(ino)?;
            match name {
                DROP_CAP_XATTR => {
                    self.caps.drop_cap(&id, Self::cap_scope(&rec));
                    return Ok(());
                }
                DROP_ALL_CAPS_XATTR => {
                    if !id.sudoer {
                        return Err(FsError::NotPermitted);
                    }
                    self.caps.reset();
                    return Ok(());
                }
                _ => {}
            }

            let _monitor = self.tracker.monitor(ino, true);
            let cap = self.cap_for(&id, &rec, AccessMask::SA_OK)?;
            {
                let mut s = rec.lock();
                let exists = s.xattrs.contains_key(name);
                if flags & libc::XATTR_CREATE != 0 && exists {
                    return Err(FsError::AlreadyExists);
                }
                if flags & libc::XATTR_REPLACE != 0 && !exists {
                    return Err(FsError::NoAttribute);
                }
                s.xattrs.insert(name.to_string(), value.to_vec());
                s.ctime = Timespec::now();
            }
            self.md.update(&rec, cap.authid())
        })
    }

    /// Names of the attributes of `ino`.
    pub fn listxattr(&self, creds: &TransportCredentials, ino: u64) -> FsResult<Vec<String>> {
        trace!(ino, "listxattr");
        self.metadata_op("listxattr", || {
            let id = self.identity(creds)?;
            let rec = self.md.get(ino)?;
            self.cap_for(&id, &rec, AccessMask::R_OK)?;
            Ok(rec.lock().xattrs.keys().cloned().collect())
        })
    }

    /// Removes the attribute `name` of `ino`.
    pub fn removexattr(&self, creds: &TransportCredentials, ino: u64, name: &str) -> FsResult<()> {
        trace!(ino, name, "removexattr");
        self.metadata_op("removexattr", || {
            let id = self.identity(creds)?;
            let _monitor = self.tracker.monitor(ino, true);
            let rec = self.md.get(ino)?;
            let cap = self.cap_for(&id, &rec, AccessMask::SA_OK)?;
            {
                let mut s = rec.lock();
                if s.xattrs.remove(name).is_none() {
                    return Err(FsError::NoAttribute);
                }
                s.ctime = Timespec::now();
            }
            self.md.update(&rec, cap.authid())
        })
    }

    // ========================================================================
    // Byte-Range Locks
    // ========================================================================

    /// A lock of another owner conflicting with `lock`, or `lock` turned
    /// into an unlock if none does.
    pub fn getlk(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        owner: u64,
        lock: &FileLock,
    ) -> FsResult<FileLock> {
        trace!(ino, fh, owner, ?lock, "getlk");
        self.data_op("getlk", || {
            if !self.config.global_locking {
                return Err(FsError::NotSupported);
            }
            self.identity(creds)?;
            let handle = self.handle(ino, fh)?;
            let remote = self.lock_target(&handle.record)?;
            Ok(self
                .namespace
                .get_lock(remote, owner, lock)?
                .unwrap_or(FileLock {
                    kind: LockKind::Unlock,
                    ..*lock
                }))
        })
    }

    /// Acquires or releases `lock` for `owner`.
    ///
    /// With `wait` set a conflicting lock is polled with exponential
    /// backoff until it is free or `deadline` passes (`WouldBlock`).
    #[allow(clippy::too_many_arguments)]
    pub fn setlk(
        &self,
        creds: &TransportCredentials,
        ino: u64,
        fh: u64,
        owner: u64,
        lock: &FileLock,
        wait: bool,
        deadline: Option<Instant>,
    ) -> FsResult<()> {
        trace!(ino, fh, owner, ?lock, wait, "setlk");
        self.data_op("setlk", || {
            if !self.config.global_locking {
                return Err(FsError::NotSupported);
            }
            self.identity(creds)?;
            let handle = self.handle(ino, fh)?;
            let remote = self.lock_target(&handle.record)?;
            let mut backoff =
                ExponentialBackoff::new(self.config.lock_poll_initial, self.config.lock_poll_max)
                    .with_deadline(deadline);
            loop {
                match self.namespace.set_lock(remote, owner, lock) {
                    Ok(()) => {
                        if lock.kind != LockKind::Unlock {
                            handle.add_lock_owner(owner);
                        }
                        return Ok(());
                    }
                    Err(RemoteError::LockConflict) => {
                        if !wait || !backoff.sleep() {
                            debug!(ino, owner, attempts = backoff.attempts(), "lock busy");
                            return Err(FsError::WouldBlock);
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        })
    }
}

impl Drop for LeaseFs {
    fn drop(&mut self) {
        self.md.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasefs_core::UnixIdentityProvider;
    use leasefs_core::testing::{MemoryAuthorizer, MemoryNamespace, MemoryStorage};

    fn mount(config: ClientConfig) -> (LeaseFs, Arc<MemoryNamespace>) {
        let ns = Arc::new(MemoryNamespace::new());
        let remotes = Remotes {
            namespace: Arc::clone(&ns) as Arc<dyn RemoteNamespace>,
            authorizer: Arc::new(MemoryAuthorizer::new(Arc::clone(&ns))),
            storage: Arc::new(MemoryStorage::new()),
            root: MemoryNamespace::ROOT,
        };
        let fs = LeaseFs::new(config, Arc::new(UnixIdentityProvider::new()), remotes).unwrap();
        (fs, ns)
    }

    fn root() -> TransportCredentials {
        TransportCredentials::new(0, 0)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let ns = Arc::new(MemoryNamespace::new());
        let remotes = Remotes {
            namespace: Arc::clone(&ns) as Arc<dyn RemoteNamespace>,
            authorizer: Arc::new(MemoryAuthorizer::new(Arc::clone(&ns))),
            storage: Arc::new(MemoryStorage::new()),
            root: MemoryNamespace::ROOT,
        };
        let config = ClientConfig::default().max_name_len(0);
        let err = LeaseFs::new(config, Arc::new(UnixIdentityProvider::new()), remotes).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[test]
    fn test_name_checks() {
        let (fs, _) = mount(ClientConfig::default().max_name_len(8));
        let root_ino = leasefs_core::ROOT_INO;
        assert_eq!(
            fs.mkdir(&root(), root_ino, "a/b", 0o755).unwrap_err(),
            FsError::InvalidArgument("name")
        );
        assert_eq!(
            fs.mkdir(&root(), root_ino, "much-too-long", 0o755).unwrap_err(),
            FsError::NameTooLong
        );
        assert_eq!(
            fs.lookup(&root(), root_ino, "much-too-long").unwrap_err(),
            FsError::NameTooLong
        );
    }

    #[test]
    fn test_errors_are_counted() {
        let (fs, _) = mount(ClientConfig::default());
        let before = fs.stats().errors;
        assert_eq!(
            fs.lookup(&root(), leasefs_core::ROOT_INO, "missing").unwrap_err(),
            FsError::NotFound
        );
        assert_eq!(fs.stats().errors, before + 1);
    }

    #[test]
    fn test_unmappable_identity_is_eperm() {
        let (fs, _) = mount(ClientConfig::default());
        let creds = TransportCredentials::new(leasefs_core::identity::OVERFLOW_ID, 0);
        let err = fs.getattr(&creds, leasefs_core::ROOT_INO).unwrap_err();
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_mknod_defaults_to_regular_file() {
        let (fs, ns) = mount(ClientConfig::default());
        let entry = fs.mknod(&root(), leasefs_core::ROOT_INO, "plain", 0o644).unwrap();
        assert_eq!(entry.attr.kind, FileKind::RegularFile);
        assert!(ns.child(MemoryNamespace::ROOT, "plain").is_some());
    }
}
